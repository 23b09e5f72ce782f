//! Data model flowing through the joiner.
//!
//! A [`MessageBatch`] is what the transport delivers for one
//! partition. The merge stage orders batches across partitions and
//! the join stage regroups their [`Message`]s into [`JoinedBatch`]es,
//! one group per interaction.

use std::fmt::Display;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Event id carried by control messages which never join.
pub const DICTIONARY_EVENT_ID: &str = "__dictionary__";

/// Unique ID of a partition within a stream.
///
/// Interaction and observation streams use the same partition ids;
/// checkpoints are keyed off of this.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub String);

impl Display for PartitionId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of payload a message carries.
///
/// The byte values are the tags used on the wire.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadType {
    Interaction,
    MultiStepInteraction,
    Observation,
    EpisodeObservation,
    Dictionary,
}

impl PayloadType {
    pub fn is_observation(&self) -> bool {
        matches!(self, Self::Observation | Self::EpisodeObservation)
    }
}

/// One logical event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub app_id: String,
    pub event_id: String,
    pub payload_type: PayloadType,
    pub enqueued_time_utc: DateTime<Utc>,
    /// Timestamp assigned by the producing client, if it sent one.
    pub client_time_utc: Option<DateTime<Utc>>,
    pub payload: Vec<u8>,
}

impl Message {
    /// Control messages pass through the join untouched.
    pub fn is_dictionary(&self) -> bool {
        self.event_id == DICTIONARY_EVENT_ID || self.payload_type == PayloadType::Dictionary
    }

    /// Time used for join windowing.
    pub fn event_time(&self, use_client_timestamp: bool) -> DateTime<Utc> {
        match (use_client_timestamp, self.client_time_utc) {
            (true, Some(client_time)) => client_time,
            _ => self.enqueued_time_utc,
        }
    }
}

/// Unit of transport delivery for a single partition.
///
/// `sequence_number` is strictly increasing within a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBatch {
    pub offset: i64,
    pub sequence_number: i64,
    pub partition_id: PartitionId,
    pub enqueued_time_utc: DateTime<Utc>,
    /// Number of events in the raw transport body, including any
    /// that were skipped while decoding.
    pub original_event_count: usize,
    pub messages: Vec<Message>,
}

/// Output unit of the join.
///
/// Position fields are inherited from the interaction batch the
/// groups came from, so a joined batch is also a checkpoint unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedBatch {
    pub offset: i64,
    pub sequence_number: i64,
    pub partition_id: PartitionId,
    pub enqueued_time_utc: DateTime<Utc>,
    pub source_message_event_count: usize,
    /// Each group is one interaction followed by its observations.
    /// Dictionary messages form single element groups.
    pub messages: Vec<Vec<Message>>,
}

impl JoinedBatch {
    pub fn observation_count(&self) -> usize {
        self.messages
            .iter()
            .map(|group| group.iter().filter(|m| m.payload_type.is_observation()).count())
            .sum()
    }
}

/// An observation with no buffered interaction to attach to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanObservation {
    pub partition_id: PartitionId,
    pub sequence_number: i64,
    pub offset: i64,
    pub message: Message,
}

/// Everything the join block emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinerOutput {
    Joined(JoinedBatch),
    Orphan(OrphanObservation),
}

/// Metadata the billing stage needs from a joined batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingRecord {
    pub partition_id: PartitionId,
    pub sequence_number: i64,
    pub source_message_event_count: usize,
}

impl From<&JoinedBatch> for BillingRecord {
    fn from(batch: &JoinedBatch) -> Self {
        Self {
            partition_id: batch.partition_id.clone(),
            sequence_number: batch.sequence_number,
            source_message_event_count: batch.source_message_event_count,
        }
    }
}

#[cfg(test)]
pub(crate) fn ts(secs: i64) -> DateTime<Utc> {
    use chrono::TimeZone;
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

#[cfg(test)]
pub(crate) fn test_message(event_id: &str, payload_type: PayloadType, secs: i64) -> Message {
    Message {
        app_id: "app".to_string(),
        event_id: event_id.to_string(),
        payload_type,
        enqueued_time_utc: ts(secs),
        client_time_utc: None,
        payload: event_id.as_bytes().to_vec(),
    }
}

#[cfg(test)]
pub(crate) fn test_batch(partition: &str, seq: i64, secs: i64, messages: Vec<Message>) -> MessageBatch {
    MessageBatch {
        offset: seq * 100,
        sequence_number: seq,
        partition_id: PartitionId::from(partition),
        enqueued_time_utc: ts(secs),
        original_event_count: messages.len(),
        messages,
    }
}

#[test]
fn event_time_prefers_client_time_when_enabled() {
    let mut msg = test_message("a", PayloadType::Interaction, 10);
    msg.client_time_utc = Some(ts(3));
    assert_eq!(msg.event_time(true), ts(3));
    assert_eq!(msg.event_time(false), ts(10));
    msg.client_time_utc = None;
    assert_eq!(msg.event_time(true), ts(10));
}

#[test]
fn dictionary_detection_works() {
    let msg = test_message(DICTIONARY_EVENT_ID, PayloadType::Interaction, 0);
    assert!(msg.is_dictionary());
    let msg = test_message("x", PayloadType::Dictionary, 0);
    assert!(msg.is_dictionary());
    let msg = test_message("x", PayloadType::Observation, 0);
    assert!(!msg.is_dictionary());
}
