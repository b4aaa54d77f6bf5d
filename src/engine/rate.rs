use rand::{thread_rng, Rng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, Instant};

/// Token bucket bounding how many visits start per second. A visit fans out
/// into up to six handshakes against the same host, so the bucket counts
/// visits rather than connections.
#[derive(Clone)]
pub struct RateLimiter {
    tokens: Arc<Semaphore>,
    visits_per_second: u32,
    last_refill: Arc<Mutex<Instant>>,
}

impl RateLimiter {
    pub fn new(visits_per_second: u32) -> Self {
        let visits_per_second = visits_per_second.max(1);
        Self {
            tokens: Arc::new(Semaphore::new(visits_per_second as usize)),
            visits_per_second,
            last_refill: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub async fn acquire(&self) {
        loop {
            self.refill().await;
            if let Ok(permit) = self.tokens.try_acquire() {
                permit.forget();
                return;
            }
            sleep(self.until_next_refill().await).await;
        }
    }

    pub fn available(&self) -> usize {
        self.tokens.available_permits()
    }

    async fn refill(&self) {
        let mut last = self.last_refill.lock().await;
        let now = Instant::now();
        if now.duration_since(*last) >= Duration::from_secs(1) {
            let missing = self
                .visits_per_second
                .saturating_sub(self.tokens.available_permits() as u32);
            if missing > 0 {
                self.tokens.add_permits(missing as usize);
            }
            *last = now;
        }
    }

    async fn until_next_refill(&self) -> Duration {
        let last = *self.last_refill.lock().await;
        (last + Duration::from_secs(1))
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1))
    }

    /// Spreads visit start times so a burst of visits for the same hosting
    /// provider does not land in the same millisecond.
    pub async fn sleep_jitter(&self) {
        let jitter_ms: u64 = thread_rng().gen_range(5..20);
        sleep(Duration::from_millis(jitter_ms)).await;
    }
}
