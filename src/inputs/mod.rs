//! Reading partitioned streams from a transport.
//!
//! Architecture
//! ------------
//!
//! The transport itself is an external collaborator behind the
//! [`Transport`] and [`PartitionClient`] traits. For every partition
//! of every stream the joiner runs one [`PartitionReceiver`] task.
//! It pulls [`RawEvent`]s, decodes each into a
//! [`crate::model::MessageBatch`] and pushes it into that
//! partition's [`crate::source::PartitionSource`].
//!
//! [`MemoryTransport`] is an in-process transport for tests and for
//! embedding the joiner without a broker.

use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;

use crate::errors::TransportError;
use crate::model::PartitionId;

pub mod memory;
pub mod receiver;

pub use memory::MemoryTransport;
pub use receiver::PartitionReceiver;
pub use receiver::ReceiverConfig;

/// One transport event as delivered, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub offset: i64,
    pub sequence_number: i64,
    pub partition_id: PartitionId,
    pub enqueued_time_utc: DateTime<Utc>,
    /// Preamble followed by the message body.
    pub body: Vec<u8>,
}

/// Where a receiver starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// First event after this offset.
    AfterOffset(i64),
    /// First event enqueued at or after this time.
    EnqueuedTime(DateTime<Utc>),
}

/// Result of one receive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Zero or more events. Empty means the receive timed out.
    Events(Vec<RawEvent>),
    /// The partition will never produce more events.
    EndOfStream,
}

/// Entry point into a partitioned transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn partition_ids(&self, stream: &str) -> Result<Vec<PartitionId>, TransportError>;

    async fn create_receiver(
        &self,
        stream: &str,
        partition_id: &PartitionId,
        start: StartPosition,
    ) -> Result<Box<dyn PartitionClient>, TransportError>;
}

/// Reads one partition of one stream.
#[async_trait]
pub trait PartitionClient: Send {
    /// Wait up to `timeout` for at most `max_events` events.
    async fn receive(
        &mut self,
        max_events: usize,
        timeout: Duration,
    ) -> Result<ReceiveOutcome, TransportError>;
}
