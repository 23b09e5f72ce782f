//! Sense of time for the join.
//!
//! Architecture
//! ------------
//!
//! Two kinds of clocks live here. A [`WallClock`] tells the current
//! system time; [`SystemClock`] reads the real one and
//! [`TestingClock`] is moved by hand in tests.
//!
//! A [`Clock`] turns a stream of items into a watermark: the time
//! below which no more items are expected. The join uses
//! [`ObservationClock`] over the observation stream. It advances
//! with each observation and is punctuated when the observation
//! stream goes idle, so buffered interactions keep flushing.

use std::task::Poll;

use chrono::DateTime;
use chrono::Utc;

pub mod event_time_clock;
pub mod system_clock;
pub mod testing_clock;

pub use event_time_clock::ObservationClock;
pub use event_time_clock::PunctuationConfig;
pub use system_clock::SystemClock;
pub use testing_clock::TestingClock;

/// Source of "now".
pub trait WallClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Defines the sense of time for a stream of items.
pub trait Clock<V> {
    /// Return the current watermark of the stream.
    ///
    /// This is called with each item in arrival order
    /// (`Poll::Ready(Some)`), when the stream ends
    /// (`Poll::Ready(None)`), and between items (`Poll::Pending`).
    /// The returned value never goes backwards.
    fn watermark(&mut self, next_value: &Poll<Option<&V>>) -> DateTime<Utc>;

    /// Get the time for an item.
    fn time_for(&self, value: &V) -> DateTime<Utc>;
}
