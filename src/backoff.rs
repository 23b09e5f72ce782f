//! Capped exponential backoff shared by receivers and storage.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// First delay after a failure.
pub const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Delays never grow past this.
pub const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Doubling delay between retries, reset on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    next: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            next: base,
            attempts: 0,
        }
    }

    /// Number of failures since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.max);
        self.next = self.next.saturating_mul(2).min(self.max);
        self.attempts += 1;
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.base;
        self.attempts = 0;
    }

    /// Sleep for the next delay.
    ///
    /// Returns false if cancelled while sleeping.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BACKOFF_BASE, BACKOFF_MAX)
    }
}

#[test]
fn backoff_doubles_and_caps() {
    let mut backoff = Backoff::default();
    let delays: Vec<_> = (0..8).map(|_| backoff.next_delay().as_millis()).collect();
    assert_eq!(delays, vec![200, 400, 800, 1600, 3200, 6400, 10000, 10000]);
    assert_eq!(backoff.attempts(), 8);
}

#[test]
fn backoff_reset_works() {
    let mut backoff = Backoff::default();
    backoff.next_delay();
    backoff.next_delay();
    backoff.reset();
    assert_eq!(backoff.attempts(), 0);
    assert_eq!(backoff.next_delay(), BACKOFF_BASE);
}

#[tokio::test]
async fn backoff_wait_stops_on_cancel() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(60));
    assert!(!backoff.wait(&cancel).await);
}
