//! Per-partition buffering between a receiver and the merge stage.
//!
//! [`channel`] creates the two halves. The [`PartitionWriter`] is
//! owned by the partition's receiver task and the
//! [`PartitionSource`] by the merge loop. The queue is bounded, so a
//! slow merge throttles the receiver through [`PartitionWriter::push`].
//! Dropping the writer closes the source once it is drained.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::model::MessageBatch;
use crate::model::PartitionId;

/// Default queue bound per partition.
pub const DEFAULT_CAPACITY: usize = 16;

/// What the receiver feeding a source is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverStatus {
    Receiving,
    /// Receive errors are occurring and the receiver is waiting
    /// before retrying.
    BackingOff,
}

/// Liveness of a partition as seen by the merge stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSourceState {
    /// Nothing known yet.
    Default,
    /// Partition has a substantial backlog.
    Historical,
    /// Partition is caught up.
    Active,
    /// No data currently available.
    Inactive,
    /// Receiver is backing off after errors.
    Paused,
}

/// The reader has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("partition source was dropped")]
pub struct SourceClosed;

/// Create a bounded source for one partition.
pub fn channel(partition_id: PartitionId, capacity: usize) -> (PartitionWriter, PartitionSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (status_tx, status_rx) = watch::channel(ReceiverStatus::Receiving);
    let writer = PartitionWriter {
        partition_id: partition_id.clone(),
        tx,
        status: status_tx,
    };
    let source = PartitionSource {
        partition_id,
        head: None,
        rx,
        status: status_rx,
        closed: false,
    };
    (writer, source)
}

/// Producer half, owned by the receiver.
pub struct PartitionWriter {
    partition_id: PartitionId,
    tx: mpsc::Sender<MessageBatch>,
    status: watch::Sender<ReceiverStatus>,
}

impl PartitionWriter {
    pub fn partition_id(&self) -> &PartitionId {
        &self.partition_id
    }

    /// Queue a batch, waiting while the queue is full.
    pub async fn push(&self, batch: MessageBatch) -> Result<(), SourceClosed> {
        self.tx.send(batch).await.map_err(|_| SourceClosed)
    }

    pub fn set_status(&self, status: ReceiverStatus) {
        self.status.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }
}

/// Consumer half, owned by the merge loop.
pub struct PartitionSource {
    partition_id: PartitionId,
    /// A batch taken off the channel but not yet popped.
    head: Option<MessageBatch>,
    rx: mpsc::Receiver<MessageBatch>,
    status: watch::Receiver<ReceiverStatus>,
    closed: bool,
}

impl PartitionSource {
    pub fn partition_id(&self) -> &PartitionId {
        &self.partition_id
    }

    /// Move the next queued batch into the head slot if possible.
    fn fill(&mut self) -> bool {
        if self.head.is_some() {
            return true;
        }
        if self.closed {
            return false;
        }
        match self.rx.try_recv() {
            Ok(batch) => {
                self.head = Some(batch);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.closed = true;
                false
            }
        }
    }

    /// Look at the next batch without removing it.
    pub fn peek(&mut self) -> Option<&MessageBatch> {
        self.fill();
        self.head.as_ref()
    }

    /// Remove and return the next batch.
    pub fn pop(&mut self) -> Option<MessageBatch> {
        self.fill();
        self.head.take()
    }

    /// True once the writer is gone and every batch was popped.
    pub fn is_drained(&mut self) -> bool {
        !self.fill() && self.closed
    }

    pub fn receiver_status(&self) -> ReceiverStatus {
        *self.status.borrow()
    }

    /// Wait until a batch is queued.
    ///
    /// Returns false on timeout, cancellation, or if the writer is
    /// gone with nothing left to read.
    pub async fn wait_for_data(&mut self, timeout: Duration, cancel: &CancellationToken) -> bool {
        if self.fill() {
            return true;
        }
        if self.closed {
            return false;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(partition_id = %self.partition_id, "Wait for data cancelled");
                false
            }
            res = tokio::time::timeout(timeout, self.rx.recv()) => match res {
                Ok(Some(batch)) => {
                    self.head = Some(batch);
                    true
                }
                Ok(None) => {
                    self.closed = true;
                    false
                }
                Err(_elapsed) => false,
            },
        }
    }
}

#[cfg(test)]
use crate::model::test_batch;

#[tokio::test]
async fn peek_and_pop_work() {
    let (writer, mut source) = channel(PartitionId::from("0"), 4);
    assert!(source.peek().is_none());
    writer.push(test_batch("0", 1, 1, vec![])).await.unwrap();
    writer.push(test_batch("0", 2, 2, vec![])).await.unwrap();

    assert_eq!(source.peek().map(|b| b.sequence_number), Some(1));
    assert_eq!(source.peek().map(|b| b.sequence_number), Some(1));
    assert_eq!(source.pop().map(|b| b.sequence_number), Some(1));
    assert_eq!(source.pop().map(|b| b.sequence_number), Some(2));
    assert!(source.pop().is_none());
    assert!(!source.is_drained());

    drop(writer);
    assert!(source.is_drained());
}

#[tokio::test]
async fn wait_for_data_times_out_and_wakes() {
    let cancel = CancellationToken::new();
    let (writer, mut source) = channel(PartitionId::from("0"), 4);
    assert!(!source.wait_for_data(Duration::from_millis(10), &cancel).await);

    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.push(test_batch("0", 1, 1, vec![])).await.unwrap();
        writer
    });
    assert!(source.wait_for_data(Duration::from_secs(5), &cancel).await);
    assert!(source.peek().is_some());
    drop(handle.await.unwrap());

    source.pop();
    assert!(!source.wait_for_data(Duration::from_secs(5), &cancel).await);
    assert!(source.is_drained());
}

#[tokio::test]
async fn wait_for_data_returns_false_on_cancel() {
    let cancel = CancellationToken::new();
    let (_writer, mut source) = channel(PartitionId::from("0"), 4);
    cancel.cancel();
    assert!(!source.wait_for_data(Duration::from_secs(60), &cancel).await);
}

#[tokio::test]
async fn push_applies_backpressure() {
    let (writer, mut source) = channel(PartitionId::from("0"), 1);
    writer.push(test_batch("0", 1, 1, vec![])).await.unwrap();
    let blocked = tokio::time::timeout(
        Duration::from_millis(20),
        writer.push(test_batch("0", 2, 2, vec![])),
    )
    .await;
    assert!(blocked.is_err());
    source.pop();
    writer.push(test_batch("0", 3, 3, vec![])).await.unwrap();
}

#[test]
fn status_is_visible_to_source() {
    let (writer, source) = channel(PartitionId::from("0"), 1);
    assert_eq!(source.receiver_status(), ReceiverStatus::Receiving);
    writer.set_status(ReceiverStatus::BackingOff);
    assert_eq!(source.receiver_status(), ReceiverStatus::BackingOff);
}
