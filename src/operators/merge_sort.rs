//! N-way merge of partition sources by enqueued time.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::future::select_all;
use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::JoinerError;
use crate::metrics::JoinerMetrics;
use crate::model::MessageBatch;
use crate::source::PartitionSource;
use crate::source::PartitionSourceState;
use crate::source::ReceiverStatus;
use crate::window::WallClock;

#[derive(Debug, Clone)]
pub struct MergeSortConfig {
    /// Wait bound for partitions that are caught up or unknown.
    pub active_read_timeout: Duration,
    /// Wait bound for partitions with a backlog.
    pub historical_read_timeout: Duration,
    /// Batches older than this mark their partition as historical.
    pub historical_threshold: chrono::Duration,
}

struct PartitionSlot {
    source: PartitionSource,
    state: PartitionSourceState,
    closed: bool,
}

impl PartitionSlot {
    /// How long to wait for this partition when it is empty.
    ///
    /// Inactive and paused partitions are only polled.
    fn wait_timeout(&self, config: &MergeSortConfig) -> Option<Duration> {
        match self.state {
            PartitionSourceState::Default | PartitionSourceState::Active => {
                Some(config.active_read_timeout)
            }
            PartitionSourceState::Historical => Some(config.historical_read_timeout),
            PartitionSourceState::Inactive | PartitionSourceState::Paused => None,
        }
    }
}

/// Merges many partitions into one stream ordered by enqueued time.
///
/// The order is best effort: an empty partition is waited on for a
/// bounded time and then skipped for the round, so its later batches
/// may come out behind newer batches of other partitions. Ties are
/// broken by the order partitions were added.
///
/// All partitions must be added before [`Self::run`], which consumes
/// the block.
pub struct EventMergeSortBlock {
    name: String,
    config: MergeSortConfig,
    wall_clock: Arc<dyn WallClock>,
    partitions: Vec<PartitionSlot>,
    metrics: JoinerMetrics,
}

impl EventMergeSortBlock {
    pub fn new(
        name: impl Into<String>,
        config: MergeSortConfig,
        wall_clock: Arc<dyn WallClock>,
        metrics: JoinerMetrics,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            wall_clock,
            partitions: Vec::new(),
            metrics,
        }
    }

    pub fn add(&mut self, source: PartitionSource) {
        self.partitions.push(PartitionSlot {
            source,
            state: PartitionSourceState::Default,
            closed: false,
        });
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Emit batches until every partition is drained or `cancel`
    /// fires.
    pub async fn run(
        mut self,
        output: mpsc::Sender<MessageBatch>,
        cancel: CancellationToken,
    ) -> Result<(), JoinerError> {
        tracing::info!(stream = %self.name, partitions = self.partitions.len(), "Starting merge");
        let mut emitted: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                tracing::debug!(stream = %self.name, emitted, "Merge cancelled");
                break;
            }
            self.fill_empty_partitions(&cancel).await;
            self.update_states();
            if self.partitions.iter().all(|slot| slot.closed) {
                tracing::info!(stream = %self.name, emitted, "All partitions drained; merge complete");
                break;
            }
            let Some(index) = self.next_index() else {
                self.wait_for_any(&cancel).await;
                continue;
            };
            let Some(batch) = self.partitions[index].source.pop() else {
                continue;
            };

            let labels = [
                KeyValue::new("stream", self.name.clone()),
                KeyValue::new("partition_id", batch.partition_id.0.clone()),
            ];
            let lag = self
                .wall_clock
                .now()
                .signed_duration_since(batch.enqueued_time_utc);
            self.metrics
                .partition_lag
                .record(lag.num_milliseconds() as f64 / 1000.0, &labels);
            self.metrics.merged_batches.add(1, &labels);
            tracing::trace!(
                stream = %self.name,
                partition_id = %batch.partition_id,
                sequence_number = batch.sequence_number,
                "Emitting batch enqueued at {:?}",
                batch.enqueued_time_utc
            );

            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = output.send(batch) => res,
            };
            if sent.is_err() {
                tracing::info!(stream = %self.name, "Merge output closed; stopping");
                break;
            }
            emitted += 1;
        }
        Ok(())
    }

    /// Give every empty partition a chance to produce, bounded by the
    /// timeout of its state. The waits run concurrently.
    async fn fill_empty_partitions(&mut self, cancel: &CancellationToken) {
        let config = &self.config;
        let waits = self
            .partitions
            .iter_mut()
            .filter(|slot| !slot.closed)
            .filter_map(|slot| {
                if slot.source.peek().is_some() {
                    return None;
                }
                let timeout = slot.wait_timeout(config)?;
                Some(slot.source.wait_for_data(timeout, cancel))
            });
        join_all(waits).await;
    }

    fn update_states(&mut self) {
        let now = self.wall_clock.now();
        let name = &self.name;
        let threshold = self.config.historical_threshold;
        for slot in self.partitions.iter_mut().filter(|slot| !slot.closed) {
            let head_time = slot.source.peek().map(|batch| batch.enqueued_time_utc);
            let next_state = match head_time {
                Some(time) if now.signed_duration_since(time) > threshold => {
                    PartitionSourceState::Historical
                }
                Some(_) => PartitionSourceState::Active,
                None if slot.source.is_drained() => {
                    tracing::info!(stream = %name, partition_id = %slot.source.partition_id(), "Partition drained");
                    slot.closed = true;
                    continue;
                }
                None if slot.source.receiver_status() == ReceiverStatus::BackingOff => {
                    PartitionSourceState::Paused
                }
                None => PartitionSourceState::Inactive,
            };
            if slot.state != next_state {
                tracing::debug!(
                    stream = %name,
                    partition_id = %slot.source.partition_id(),
                    from = ?slot.state,
                    to = ?next_state,
                    "Partition state changed"
                );
                slot.state = next_state;
            }
        }
    }

    /// Partition holding the oldest head batch.
    fn next_index(&mut self) -> Option<usize> {
        self.partitions
            .iter_mut()
            .enumerate()
            .filter(|(_, slot)| !slot.closed)
            .filter_map(|(index, slot)| {
                slot.source
                    .peek()
                    .map(|batch| (batch.enqueued_time_utc, index))
            })
            .min()
            .map(|(_, index)| index)
    }

    /// Nothing is buffered anywhere; sleep until any partition has
    /// data, closes, or the active timeout passes.
    async fn wait_for_any(&mut self, cancel: &CancellationToken) {
        let timeout = self.config.active_read_timeout;
        let waits: Vec<_> = self
            .partitions
            .iter_mut()
            .filter(|slot| !slot.closed)
            .map(|slot| Box::pin(slot.source.wait_for_data(timeout, cancel)))
            .collect();
        if !waits.is_empty() {
            select_all(waits).await;
        }
    }

    #[cfg(test)]
    fn states(&self) -> Vec<PartitionSourceState> {
        self.partitions.iter().map(|slot| slot.state).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::model::{test_batch, ts, PartitionId};
    use crate::source;
    use crate::window::TestingClock;

    fn block(active_ms: u64) -> EventMergeSortBlock {
        let config = MergeSortConfig {
            active_read_timeout: Duration::from_millis(active_ms),
            historical_read_timeout: Duration::from_millis(active_ms * 2),
            historical_threshold: chrono::Duration::minutes(5),
        };
        let clock = TestingClock::new(ts(10));
        EventMergeSortBlock::new("interaction", config, Arc::new(clock), JoinerMetrics::new())
    }

    async fn collect(mut rx: mpsc::Receiver<MessageBatch>) -> Vec<(String, i64)> {
        let mut out = Vec::new();
        while let Some(batch) = rx.recv().await {
            out.push((batch.partition_id.0, batch.enqueued_time_utc.timestamp() - ts(0).timestamp()));
        }
        out
    }

    #[tokio::test]
    async fn merge_orders_by_enqueued_time() {
        let mut merge = block(100);
        let (a_writer, a) = source::channel(PartitionId::from("a"), 16);
        let (b_writer, b) = source::channel(PartitionId::from("b"), 16);
        merge.add(a);
        merge.add(b);
        a_writer.push(test_batch("a", 0, 1, vec![])).await.unwrap();
        a_writer.push(test_batch("a", 1, 3, vec![])).await.unwrap();
        b_writer.push(test_batch("b", 0, 2, vec![])).await.unwrap();
        drop(a_writer);
        drop(b_writer);

        let (tx, rx) = mpsc::channel(16);
        merge.run(tx, CancellationToken::new()).await.unwrap();
        let out = collect(rx).await;
        assert_eq!(
            out,
            vec![("a".into(), 1), ("b".into(), 2), ("a".into(), 3)]
        );
    }

    #[tokio::test]
    async fn ties_go_to_first_registered_partition() {
        let mut merge = block(100);
        let (b_writer, b) = source::channel(PartitionId::from("b"), 16);
        let (a_writer, a) = source::channel(PartitionId::from("a"), 16);
        merge.add(b);
        merge.add(a);
        a_writer.push(test_batch("a", 0, 1, vec![])).await.unwrap();
        b_writer.push(test_batch("b", 0, 1, vec![])).await.unwrap();
        drop(a_writer);
        drop(b_writer);

        let (tx, rx) = mpsc::channel(16);
        merge.run(tx, CancellationToken::new()).await.unwrap();
        let out = collect(rx).await;
        assert_eq!(out, vec![("b".into(), 1), ("a".into(), 1)]);
    }

    #[tokio::test]
    async fn merge_of_monotonic_partitions_is_monotonic() {
        let rng = fastrand::Rng::with_seed(7);
        for _ in 0..20 {
            let mut merge = block(100);
            let mut expected = 0;
            for p in 0..4 {
                let name = p.to_string();
                let (writer, source) = source::channel(PartitionId::from(name.as_str()), 16);
                merge.add(source);
                let mut secs = 0;
                for seq in 0..rng.i64(0..8) {
                    secs += rng.i64(0..3);
                    writer.push(test_batch(&name, seq, secs, vec![])).await.unwrap();
                    expected += 1;
                }
            }

            let (tx, rx) = mpsc::channel(64);
            merge.run(tx, CancellationToken::new()).await.unwrap();
            let out = collect(rx).await;
            assert_eq!(out.len(), expected);
            assert!(out.windows(2).all(|pair| pair[0].1 <= pair[1].1), "{out:?}");
        }
    }

    #[tokio::test]
    async fn zero_partitions_completes_immediately() {
        let merge = block(1000);
        let (tx, rx) = mpsc::channel(1);
        merge.run(tx, CancellationToken::new()).await.unwrap();
        assert!(collect(rx).await.is_empty());
    }

    #[tokio::test]
    async fn slow_partition_within_timeout_is_not_starved() {
        let mut merge = block(1000);
        let (a_writer, a) = source::channel(PartitionId::from("a"), 16);
        let (b_writer, b) = source::channel(PartitionId::from("b"), 16);
        merge.add(a);
        merge.add(b);
        a_writer.push(test_batch("a", 0, 5, vec![])).await.unwrap();
        drop(a_writer);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            b_writer.push(test_batch("b", 0, 1, vec![])).await.unwrap();
        });

        let (tx, rx) = mpsc::channel(16);
        merge.run(tx, CancellationToken::new()).await.unwrap();
        let out = collect(rx).await;
        assert_eq!(out, vec![("b".into(), 1), ("a".into(), 5)]);
    }

    #[tokio::test]
    async fn idle_partition_is_skipped_after_timeout() {
        let mut merge = block(50);
        let (a_writer, a) = source::channel(PartitionId::from("a"), 16);
        let (_b_writer, b) = source::channel(PartitionId::from("b"), 16);
        merge.add(a);
        merge.add(b);
        for (seq, secs) in [(0, 1), (1, 2), (2, 3)] {
            a_writer.push(test_batch("a", seq, secs, vec![])).await.unwrap();
        }

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let handle = tokio::spawn(merge.run(tx, cancel.clone()));
        for _ in 0..3 {
            assert!(rx.recv().await.is_some());
        }
        // Only the first round waits on the idle partition.
        assert!(started.elapsed() < Duration::from_millis(500));
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_stops_a_waiting_merge() {
        let mut merge = block(10_000);
        let (_writer, a) = source::channel(PartitionId::from("a"), 16);
        merge.add(a);
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(merge.run(tx, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn states_follow_partition_liveness() {
        let mut merge = block(10);
        let (old_writer, old) = source::channel(PartitionId::from("old"), 16);
        let (new_writer, new) = source::channel(PartitionId::from("new"), 16);
        let (idle_writer, idle) = source::channel(PartitionId::from("idle"), 16);
        let (paused_writer, paused) = source::channel(PartitionId::from("paused"), 16);
        merge.add(old);
        merge.add(new);
        merge.add(idle);
        merge.add(paused);
        old_writer.push(test_batch("old", 0, -600, vec![])).await.unwrap();
        new_writer.push(test_batch("new", 0, 9, vec![])).await.unwrap();
        paused_writer.set_status(ReceiverStatus::BackingOff);

        let cancel = CancellationToken::new();
        merge.fill_empty_partitions(&cancel).await;
        merge.update_states();
        assert_eq!(
            merge.states(),
            vec![
                PartitionSourceState::Historical,
                PartitionSourceState::Active,
                PartitionSourceState::Inactive,
                PartitionSourceState::Paused,
            ]
        );
        drop(idle_writer);
    }
}
