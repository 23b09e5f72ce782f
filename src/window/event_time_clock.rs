use std::sync::Arc;
use std::task::Poll;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;

use super::Clock;
use super::WallClock;
use crate::model::MessageBatch;

/// How the observation watermark moves while observations are idle.
#[derive(Debug, Clone, Copy)]
pub struct PunctuationConfig {
    /// Idle time after which punctuation starts.
    pub timeout: Duration,
    pub slack: Duration,
    /// When true, punctuate relative to the last observation time,
    /// otherwise relative to the wall clock.
    pub add_slack: bool,
    pub use_client_timestamp: bool,
}

/// Watermark over the observation stream.
///
/// The watermark is the latest observation time seen. If no
/// observation arrives for `timeout` of wall clock time, punctuation
/// moves it forward:
///
/// - with `add_slack`, to the last observation time plus `slack` for
///   every whole `timeout` that has passed;
/// - otherwise (or before any observation), to now minus `slack`.
///
/// When the observation stream ends, the watermark jumps to the
/// maximum time and every window closes.
pub struct ObservationClock {
    config: PunctuationConfig,
    wall_clock: Arc<dyn WallClock>,
    latest_event_time: Option<DateTime<Utc>>,
    system_time_of_last_event: DateTime<Utc>,
    watermark: DateTime<Utc>,
}

impl ObservationClock {
    pub fn new(config: PunctuationConfig, wall_clock: Arc<dyn WallClock>) -> Self {
        let system_time_of_last_event = wall_clock.now();
        Self {
            config,
            wall_clock,
            latest_event_time: None,
            system_time_of_last_event,
            watermark: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn current(&self) -> DateTime<Utc> {
        self.watermark
    }

    pub fn latest_event_time(&self) -> Option<DateTime<Utc>> {
        self.latest_event_time
    }

    fn punctuation(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let idle = now.signed_duration_since(self.system_time_of_last_event);
        if idle < self.config.timeout {
            return None;
        }
        match (self.config.add_slack, self.latest_event_time) {
            (true, Some(latest)) => {
                let timeout_ms = self.config.timeout.num_milliseconds().max(1);
                let periods = (idle.num_milliseconds() / timeout_ms).clamp(1, i32::MAX as i64);
                Some(
                    latest
                        .checked_add_signed(self.config.slack * periods as i32)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC),
                )
            }
            _ => Some(
                now.checked_sub_signed(self.config.slack)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
            ),
        }
    }
}

impl Clock<MessageBatch> for ObservationClock {
    fn watermark(&mut self, next_value: &Poll<Option<&MessageBatch>>) -> DateTime<Utc> {
        let now = self.wall_clock.now();
        let candidate = match next_value {
            Poll::Ready(Some(batch)) => {
                let event_time = self.time_for(batch);
                if self.latest_event_time.map_or(true, |latest| event_time > latest) {
                    self.latest_event_time = Some(event_time);
                }
                self.system_time_of_last_event = now;
                self.latest_event_time
            }
            Poll::Ready(None) => Some(DateTime::<Utc>::MAX_UTC),
            Poll::Pending => {
                let punctuated = self.punctuation(now);
                if let Some(time) = punctuated {
                    if time > self.watermark {
                        tracing::trace!("Punctuating observation watermark to {time:?}");
                    }
                }
                punctuated
            }
        };
        if let Some(candidate) = candidate {
            if candidate > self.watermark {
                self.watermark = candidate;
            }
        }
        self.watermark
    }

    /// Latest message time in the batch, or the batch time if it is
    /// empty.
    fn time_for(&self, batch: &MessageBatch) -> DateTime<Utc> {
        batch
            .messages
            .iter()
            .map(|msg| msg.event_time(self.config.use_client_timestamp))
            .max()
            .unwrap_or(batch.enqueued_time_utc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{test_batch, test_message, ts, PayloadType};
    use crate::window::TestingClock;

    fn clock(add_slack: bool) -> (TestingClock, ObservationClock) {
        let wall = TestingClock::new(ts(1000));
        let config = PunctuationConfig {
            timeout: Duration::seconds(10),
            slack: Duration::seconds(2),
            add_slack,
            use_client_timestamp: false,
        };
        let clock = ObservationClock::new(config, Arc::new(wall.clone()));
        (wall, clock)
    }

    fn obs(secs: i64) -> MessageBatch {
        test_batch(
            "0",
            secs,
            secs,
            vec![test_message("e", PayloadType::Observation, secs)],
        )
    }

    #[test]
    fn watermark_follows_observations_and_never_regresses() {
        let (_wall, mut clock) = clock(true);
        assert_eq!(clock.watermark(&Poll::Pending), DateTime::<Utc>::MIN_UTC);
        assert_eq!(clock.watermark(&Poll::Ready(Some(&obs(5)))), ts(5));
        assert_eq!(clock.watermark(&Poll::Ready(Some(&obs(3)))), ts(5));
        assert_eq!(clock.watermark(&Poll::Ready(Some(&obs(8)))), ts(8));
    }

    #[test]
    fn end_of_stream_closes_everything() {
        let (_wall, mut clock) = clock(true);
        clock.watermark(&Poll::Ready(Some(&obs(5))));
        assert_eq!(clock.watermark(&Poll::Ready(None)), DateTime::<Utc>::MAX_UTC);
        assert_eq!(clock.watermark(&Poll::Pending), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn punctuation_adds_slack_to_last_observation() {
        let (wall, mut clock) = clock(true);
        clock.watermark(&Poll::Ready(Some(&obs(5))));

        wall.advance(Duration::seconds(9));
        assert_eq!(clock.watermark(&Poll::Pending), ts(5));

        wall.advance(Duration::seconds(1));
        assert_eq!(clock.watermark(&Poll::Pending), ts(7));

        wall.advance(Duration::seconds(20));
        assert_eq!(clock.watermark(&Poll::Pending), ts(11));
    }

    #[test]
    fn punctuation_uses_wall_clock_without_slack_mode() {
        let (wall, mut clock) = clock(false);
        clock.watermark(&Poll::Ready(Some(&obs(5))));
        wall.advance(Duration::seconds(10));
        assert_eq!(clock.watermark(&Poll::Pending), ts(1008));
    }

    #[test]
    fn punctuation_before_any_observation_uses_wall_clock() {
        let (wall, mut clock) = clock(true);
        wall.advance(Duration::seconds(10));
        assert_eq!(clock.watermark(&Poll::Pending), ts(1008));
    }
}
