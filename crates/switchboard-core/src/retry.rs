//! Jittered exponential backoff for transient remote failures.

use std::time::Duration;

use rand::Rng;

/// Backoff schedule: `base * 2^attempt`, capped at `max`, with up to
/// ±25% uniform jitter on each delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            attempt: 0,
            max_attempts,
        }
    }

    /// Default schedule for remote calls: 200ms base, 5s cap, 3 attempts.
    pub fn remote() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(5), 3)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The next delay to sleep, or `None` when attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(self.max);
        self.attempt += 1;
        Some(jitter(capped))
    }
}

/// Apply ±25% uniform jitter.
fn jitter(d: Duration) -> Duration {
    let millis = d.as_millis() as u64;
    if millis == 0 {
        return d;
    }
    let spread = millis / 4;
    let low = millis - spread;
    let high = millis + spread + 1;
    Duration::from_millis(rand::thread_rng().gen_range(low..high))
}

/// Retry `op` on `Err` with the given backoff, sleeping between attempts.
/// The final error is returned once the schedule is exhausted.
pub async fn retry<T, E, F, Fut>(mut backoff: Backoff, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(attempt = backoff.attempt(), err = %e, "retrying after backoff");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
        }
    }
}
