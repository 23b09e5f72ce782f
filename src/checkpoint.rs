//! Persisted progress markers.
//!
//! Both checkpoints are whole JSON documents written under a
//! well-known blob name. The joiner checkpoint looks like
//!
//! ```json
//! { "0": { "Offset": 4096, "EnqueuedTimeUtc": "2023-11-14T22:13:20Z" } }
//! ```
//!
//! and the billing checkpoint maps partitions to the last billed
//! sequence number:
//!
//! ```json
//! { "0": 17 }
//! ```

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::model::JoinedBatch;
use crate::model::PartitionId;

/// Sequence number meaning nothing has been billed yet.
pub const NOTHING_BILLED: i64 = -1;

/// Progress of one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCheckpoint {
    #[serde(rename = "Offset")]
    pub offset: Option<i64>,
    #[serde(rename = "EnqueuedTimeUtc")]
    pub enqueued_time_utc: Option<DateTime<Utc>>,
}

/// An update that would move a partition checkpoint backwards.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "checkpoint regression on partition {partition_id}: offset {current_offset:?} -> {offset}, \
     enqueued time {current_time:?} -> {enqueued_time_utc}"
)]
pub struct CheckpointRegression {
    pub partition_id: PartitionId,
    pub current_offset: Option<i64>,
    pub offset: i64,
    pub current_time: Option<DateTime<Utc>>,
    pub enqueued_time_utc: DateTime<Utc>,
}

/// Joiner progress across all interaction partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventHubCheckpoint(pub BTreeMap<PartitionId, PartitionCheckpoint>);

impl EventHubCheckpoint {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn get(&self, partition_id: &PartitionId) -> Option<&PartitionCheckpoint> {
        self.0.get(partition_id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Move a partition forward.
    ///
    /// Both fields are monotonic. If either would go backwards the
    /// whole update is rejected and nothing changes.
    pub fn advance(
        &mut self,
        partition_id: &PartitionId,
        offset: i64,
        enqueued_time_utc: DateTime<Utc>,
    ) -> Result<(), CheckpointRegression> {
        let current = self.0.entry(partition_id.clone()).or_default();
        let offset_regressed = current.offset.map_or(false, |cur| offset < cur);
        let time_regressed = current
            .enqueued_time_utc
            .map_or(false, |cur| enqueued_time_utc < cur);
        if offset_regressed || time_regressed {
            return Err(CheckpointRegression {
                partition_id: partition_id.clone(),
                current_offset: current.offset,
                offset,
                current_time: current.enqueued_time_utc,
                enqueued_time_utc,
            });
        }
        current.offset = Some(offset);
        current.enqueued_time_utc = Some(enqueued_time_utc);
        Ok(())
    }

    /// Advance from a consumed joined batch.
    pub fn advance_batch(&mut self, batch: &JoinedBatch) -> Result<(), CheckpointRegression> {
        self.advance(&batch.partition_id, batch.offset, batch.enqueued_time_utc)
    }
}

/// Last billed sequence number per partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BillingCheckpoint(pub BTreeMap<PartitionId, i64>);

impl BillingCheckpoint {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn last_billed(&self, partition_id: &PartitionId) -> i64 {
        self.0.get(partition_id).copied().unwrap_or(NOTHING_BILLED)
    }

    /// Returns true and records the sequence number if this batch
    /// has not been billed yet.
    pub fn try_advance(&mut self, partition_id: &PartitionId, sequence_number: i64) -> bool {
        if sequence_number > self.last_billed(partition_id) {
            self.0.insert(partition_id.clone(), sequence_number);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
use crate::model::ts;

#[test]
fn partition_checkpoint_serde_names() {
    use serde_test::assert_tokens;
    use serde_test::Token;

    let cp = PartitionCheckpoint {
        offset: Some(5),
        enqueued_time_utc: None,
    };
    assert_tokens(
        &cp,
        &[
            Token::Struct {
                name: "PartitionCheckpoint",
                len: 2,
            },
            Token::Str("Offset"),
            Token::Some,
            Token::I64(5),
            Token::Str("EnqueuedTimeUtc"),
            Token::None,
            Token::StructEnd,
        ],
    );
}

#[test]
fn joiner_checkpoint_reads_documented_format() {
    let json = br#"{"0":{"Offset":4096,"EnqueuedTimeUtc":"2023-11-14T22:13:20Z"},"1":{"Offset":null,"EnqueuedTimeUtc":null}}"#;
    let cp = EventHubCheckpoint::from_json(json).unwrap();
    let p0 = cp.get(&PartitionId::from("0")).unwrap();
    assert_eq!(p0.offset, Some(4096));
    assert_eq!(p0.enqueued_time_utc, Some(ts(0)));
    assert_eq!(cp.get(&PartitionId::from("1")), Some(&PartitionCheckpoint::default()));

    let back = EventHubCheckpoint::from_json(&cp.to_json().unwrap()).unwrap();
    assert_eq!(back, cp);
}

#[test]
fn advance_rejects_regression() {
    let mut cp = EventHubCheckpoint::default();
    let pid = PartitionId::from("0");
    cp.advance(&pid, 10, ts(10)).unwrap();
    cp.advance(&pid, 20, ts(20)).unwrap();

    let err = cp.advance(&pid, 15, ts(30)).unwrap_err();
    assert_eq!(err.current_offset, Some(20));
    let err = cp.advance(&pid, 30, ts(5));
    assert!(err.is_err());

    let p0 = cp.get(&pid).unwrap();
    assert_eq!(p0.offset, Some(20));
    assert_eq!(p0.enqueued_time_utc, Some(ts(20)));

    // Equal values are not a regression.
    cp.advance(&pid, 20, ts(20)).unwrap();
}

#[test]
fn billing_checkpoint_tracks_sequence() {
    let mut cp = BillingCheckpoint::default();
    let pid = PartitionId::from("3");
    assert_eq!(cp.last_billed(&pid), NOTHING_BILLED);
    assert!(cp.try_advance(&pid, 0));
    assert!(!cp.try_advance(&pid, 0));
    assert!(cp.try_advance(&pid, 7));
    assert!(!cp.try_advance(&pid, 6));

    let json = cp.to_json().unwrap();
    assert_eq!(json, br#"{"3":7}"#);
    assert_eq!(BillingCheckpoint::from_json(&json).unwrap(), cp);
}
