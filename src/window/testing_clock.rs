use std::sync::Arc;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;

use super::WallClock;

/// Use to simulate system time in tests.
///
/// Clones share the same "now", so a test can keep one handle and
/// hand another to the component under test.
#[derive(Debug, Clone)]
pub struct TestingClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TestingClock {
    pub fn new(start_at: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start_at)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.lock();
        *now = *now + by;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
        // A panic while holding this lock leaves a valid time behind.
        self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl WallClock for TestingClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }
}

#[test]
fn testing_clock_clones_share_time() {
    use chrono::TimeZone;

    let start = Utc.timestamp_opt(0, 0).unwrap();
    let clock = TestingClock::new(start);
    let other = clock.clone();
    clock.advance(Duration::seconds(5));
    assert_eq!(other.now(), start + Duration::seconds(5));
    other.set(start);
    assert_eq!(clock.now(), start);
}
