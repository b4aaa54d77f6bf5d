/// Lowercase hex without separators, the form fingerprints are stored in.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
