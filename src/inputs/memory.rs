use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use tokio::sync::Notify;

use super::PartitionClient;
use super::RawEvent;
use super::ReceiveOutcome;
use super::StartPosition;
use super::Transport;
use crate::codec::encode_event_message;
use crate::errors::CodecError;
use crate::errors::TransportError;
use crate::model::Message;
use crate::model::PartitionId;

#[derive(Debug, Default)]
struct MemoryPartition {
    events: Vec<RawEvent>,
    next_offset: i64,
    closed: bool,
    failures: VecDeque<TransportError>,
}

type Streams = HashMap<String, BTreeMap<PartitionId, MemoryPartition>>;

/// Transport holding every stream in memory.
///
/// Partitions are append-only logs. Clones share the same logs.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    streams: Arc<Mutex<Streams>>,
    appended: Arc<Notify>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Streams> {
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a stream with partitions `"0"` to `"{count - 1}"`.
    pub fn add_stream(&self, stream: &str, count: usize) {
        let partitions = (0..count)
            .map(|i| (PartitionId(i.to_string()), MemoryPartition::default()))
            .collect();
        self.lock().insert(stream.to_string(), partitions);
    }

    fn with_partition<T>(
        &self,
        stream: &str,
        partition_id: &PartitionId,
        f: impl FnOnce(&mut MemoryPartition) -> T,
    ) -> T {
        let mut streams = self.lock();
        let partition = streams
            .entry(stream.to_string())
            .or_default()
            .entry(partition_id.clone())
            .or_default();
        let out = f(partition);
        drop(streams);
        self.appended.notify_waiters();
        out
    }

    /// Append an already encoded body. Returns its sequence number.
    pub fn append_raw(
        &self,
        stream: &str,
        partition_id: &PartitionId,
        enqueued_time_utc: DateTime<Utc>,
        body: Vec<u8>,
    ) -> i64 {
        self.with_partition(stream, partition_id, |partition| {
            let sequence_number = partition.events.len() as i64;
            let offset = partition.next_offset;
            partition.next_offset += body.len().max(1) as i64;
            partition.events.push(RawEvent {
                offset,
                sequence_number,
                partition_id: partition_id.clone(),
                enqueued_time_utc,
                body,
            });
            sequence_number
        })
    }

    /// Encode and append one batch of messages.
    pub fn append(
        &self,
        stream: &str,
        partition_id: &PartitionId,
        enqueued_time_utc: DateTime<Utc>,
        messages: &[Message],
    ) -> Result<i64, CodecError> {
        let body = encode_event_message(messages)?;
        Ok(self.append_raw(stream, partition_id, enqueued_time_utc, body))
    }

    /// Receivers of this partition see end of stream once drained.
    pub fn close_partition(&self, stream: &str, partition_id: &PartitionId) {
        self.with_partition(stream, partition_id, |partition| partition.closed = true);
    }

    pub fn close_stream(&self, stream: &str) {
        if let Some(partitions) = self.lock().get_mut(stream) {
            for partition in partitions.values_mut() {
                partition.closed = true;
            }
        }
        self.appended.notify_waiters();
    }

    /// The next receive calls on this partition fail with these
    /// errors, in order.
    pub fn inject_failures(
        &self,
        stream: &str,
        partition_id: &PartitionId,
        failures: Vec<TransportError>,
    ) {
        self.with_partition(stream, partition_id, |partition| {
            partition.failures.extend(failures)
        });
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn partition_ids(&self, stream: &str) -> Result<Vec<PartitionId>, TransportError> {
        self.lock()
            .get(stream)
            .map(|partitions| partitions.keys().cloned().collect())
            .ok_or_else(|| TransportError::Fatal(format!("unknown stream {stream:?}")))
    }

    async fn create_receiver(
        &self,
        stream: &str,
        partition_id: &PartitionId,
        start: StartPosition,
    ) -> Result<Box<dyn PartitionClient>, TransportError> {
        let known = self
            .lock()
            .get(stream)
            .map_or(false, |partitions| partitions.contains_key(partition_id));
        if !known {
            return Err(TransportError::Fatal(format!(
                "unknown partition {partition_id} in stream {stream:?}"
            )));
        }
        Ok(Box::new(MemoryClient {
            transport: self.clone(),
            stream: stream.to_string(),
            partition_id: partition_id.clone(),
            start,
            next_index: 0,
        }))
    }
}

struct MemoryClient {
    transport: MemoryTransport,
    stream: String,
    partition_id: PartitionId,
    start: StartPosition,
    next_index: usize,
}

impl MemoryClient {
    fn admits(&self, event: &RawEvent) -> bool {
        match self.start {
            StartPosition::AfterOffset(offset) => event.offset > offset,
            StartPosition::EnqueuedTime(time) => event.enqueued_time_utc >= time,
        }
    }

    fn poll(&mut self, max_events: usize) -> Result<Option<ReceiveOutcome>, TransportError> {
        let mut streams = self.transport.lock();
        let partition = streams
            .get_mut(&self.stream)
            .and_then(|partitions| partitions.get_mut(&self.partition_id))
            .ok_or_else(|| TransportError::Fatal(format!("partition {} is gone", self.partition_id)))?;
        if let Some(err) = partition.failures.pop_front() {
            return Err(err);
        }
        let mut events = Vec::new();
        while self.next_index < partition.events.len() && events.len() < max_events {
            let event = &partition.events[self.next_index];
            self.next_index += 1;
            if self.admits(event) {
                events.push(event.clone());
            }
        }
        if !events.is_empty() {
            Ok(Some(ReceiveOutcome::Events(events)))
        } else if partition.closed {
            Ok(Some(ReceiveOutcome::EndOfStream))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl PartitionClient for MemoryClient {
    async fn receive(
        &mut self,
        max_events: usize,
        timeout: Duration,
    ) -> Result<ReceiveOutcome, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let appended = self.transport.appended.clone();
            let notified = appended.notified();
            if let Some(outcome) = self.poll(max_events.max(1))? {
                return Ok(outcome);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(ReceiveOutcome::Events(Vec::new()));
            }
        }
    }
}
