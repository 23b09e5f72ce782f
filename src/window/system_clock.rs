use chrono::DateTime;
use chrono::Utc;

use super::WallClock;

/// Use the current system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
