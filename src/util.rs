pub mod hex;

use rand::{thread_rng, RngCore};

/// Random identifier for visits that arrive without one.
pub fn random_visit_id() -> String {
    let mut bytes = [0u8; 16];
    thread_rng().fill_bytes(&mut bytes);
    hex::to_hex(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visit_ids_are_unique_hex() {
        let a = random_visit_id();
        let b = random_visit_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
