//! Usage billing over joined output.
//!
//! Billing is idempotent per `(partition, sequence number)`. The
//! billing checkpoint is persisted before usage is reported, and the
//! accumulator is only reset after a report. A failed persist defers
//! the report to the next successful one, so a crash can under-bill
//! until the next run catches up but never bills a batch twice.

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::BillingCheckpoint;
use crate::errors::JoinerError;
use crate::metrics::JoinerMetrics;
use crate::model::BillingRecord;
use crate::recovery::CheckpointStore;

/// Where billable usage goes.
#[async_trait]
pub trait UsageReporter: Send + Sync {
    async fn report(&self, billable_events: u64) -> Result<(), JoinerError>;
}

/// Reports usage only to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogUsageReporter;

#[async_trait]
impl UsageReporter for LogUsageReporter {
    async fn report(&self, billable_events: u64) -> Result<(), JoinerError> {
        tracing::info!(billable_events, "Reporting usage");
        Ok(())
    }
}

pub struct BillingBlock {
    store: CheckpointStore,
    blob_name: String,
    reporter: Arc<dyn UsageReporter>,
    checkpoint: BillingCheckpoint,
    accumulated: u64,
    metrics: JoinerMetrics,
}

impl BillingBlock {
    /// Load the last billing checkpoint and build the block.
    pub async fn resume(
        store: CheckpointStore,
        blob_name: impl Into<String>,
        reporter: Arc<dyn UsageReporter>,
        metrics: JoinerMetrics,
    ) -> Result<Self, JoinerError> {
        let blob_name = blob_name.into();
        let checkpoint = store.load_billing(&blob_name).await?;
        tracing::info!(
            partitions = checkpoint.0.len(),
            "Resuming billing from {checkpoint:?}"
        );
        Ok(Self {
            store,
            blob_name,
            reporter,
            checkpoint,
            accumulated: 0,
            metrics,
        })
    }

    pub fn checkpoint(&self) -> &BillingCheckpoint {
        &self.checkpoint
    }

    /// Events counted but not yet reported.
    pub fn accumulated(&self) -> u64 {
        self.accumulated
    }

    /// Count the billable records of a unit of work. Records at or
    /// below the partition's last billed sequence number are skipped.
    pub fn accumulate(&mut self, records: &[BillingRecord]) {
        for record in records {
            if self
                .checkpoint
                .try_advance(&record.partition_id, record.sequence_number)
            {
                self.accumulated += record.source_message_event_count as u64;
            } else {
                tracing::debug!(
                    partition_id = %record.partition_id,
                    sequence_number = record.sequence_number,
                    "Batch already billed; skipping"
                );
            }
        }
    }

    /// Persist the checkpoint, then report and reset the accumulator.
    ///
    /// A failed persist is logged and leaves the accumulator in place
    /// for the next attempt.
    pub async fn settle(&mut self) -> Result<(), JoinerError> {
        if self.accumulated == 0 {
            return Ok(());
        }
        if let Err(err) = self
            .store
            .save_billing(&self.blob_name, &self.checkpoint)
            .await
        {
            tracing::warn!(
                accumulated = self.accumulated,
                "Could not persist billing checkpoint; deferring report: {err}"
            );
            return Ok(());
        }
        self.reporter.report(self.accumulated).await?;
        let labels: [KeyValue; 0] = [];
        self.metrics.billed_events.add(self.accumulated, &labels);
        self.accumulated = 0;
        Ok(())
    }

    /// Bill each unit of work as it arrives until the input closes or
    /// `cancel` fires.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<Vec<BillingRecord>>,
        cancel: CancellationToken,
    ) -> Result<(), JoinerError> {
        loop {
            let records = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(accumulated = self.accumulated, "Billing cancelled");
                    break;
                }
                records = input.recv() => records,
            };
            let Some(records) = records else {
                tracing::info!("Billing input closed");
                break;
            };
            self.accumulate(&records);
            self.settle().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::backoff::Backoff;
    use crate::errors::StorageError;
    use crate::model::PartitionId;
    use crate::recovery::InMemBlobStore;

    #[derive(Default)]
    struct RecordingReporter {
        reports: Mutex<Vec<u64>>,
    }

    impl RecordingReporter {
        fn reports(&self) -> Vec<u64> {
            self.reports.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UsageReporter for RecordingReporter {
        async fn report(&self, billable_events: u64) -> Result<(), JoinerError> {
            self.reports.lock().unwrap().push(billable_events);
            Ok(())
        }
    }

    fn record(partition: &str, seq: i64, count: usize) -> BillingRecord {
        BillingRecord {
            partition_id: PartitionId::from(partition),
            sequence_number: seq,
            source_message_event_count: count,
        }
    }

    fn store(blobs: &Arc<InMemBlobStore>) -> CheckpointStore {
        CheckpointStore::new(blobs.clone(), 1)
            .with_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn replayed_batches_are_not_billed_again() {
        let blobs = Arc::new(InMemBlobStore::new());
        let reporter = Arc::new(RecordingReporter::default());

        let mut billing = BillingBlock::resume(store(&blobs), "billing", reporter.clone(), JoinerMetrics::new())
            .await
            .unwrap();
        billing.accumulate(&[record("0", 1, 10), record("1", 4, 5), record("0", 1, 10)]);
        billing.settle().await.unwrap();
        assert_eq!(reporter.reports(), vec![15]);

        // Crash and restart, then replay plus one new batch.
        let mut billing = BillingBlock::resume(store(&blobs), "billing", reporter.clone(), JoinerMetrics::new())
            .await
            .unwrap();
        assert_eq!(billing.checkpoint().last_billed(&PartitionId::from("0")), 1);
        billing.accumulate(&[record("0", 0, 3), record("0", 1, 10), record("1", 4, 5)]);
        assert_eq!(billing.accumulated(), 0);
        billing.accumulate(&[record("0", 2, 7)]);
        billing.settle().await.unwrap();
        assert_eq!(reporter.reports(), vec![15, 7]);
    }

    #[tokio::test]
    async fn failed_persist_defers_the_report() {
        let blobs = Arc::new(InMemBlobStore::new());
        blobs.inject_write_failures(vec![StorageError::Throttled("busy".into())]);
        let reporter = Arc::new(RecordingReporter::default());
        let mut billing = BillingBlock::resume(store(&blobs), "billing", reporter.clone(), JoinerMetrics::new())
            .await
            .unwrap();

        billing.accumulate(&[record("0", 0, 4)]);
        billing.settle().await.unwrap();
        assert!(reporter.reports().is_empty());
        assert_eq!(billing.accumulated(), 4);
        assert_eq!(blobs.get("billing"), None);

        billing.accumulate(&[record("0", 0, 4), record("0", 1, 6)]);
        billing.settle().await.unwrap();
        assert_eq!(reporter.reports(), vec![10]);
        assert_eq!(billing.accumulated(), 0);
        let persisted = BillingCheckpoint::from_json(&blobs.get("billing").unwrap()).unwrap();
        assert_eq!(persisted.last_billed(&PartitionId::from("0")), 1);
    }

    #[tokio::test]
    async fn nothing_billable_writes_nothing() {
        let blobs = Arc::new(InMemBlobStore::new());
        let reporter = Arc::new(RecordingReporter::default());
        let mut billing = BillingBlock::resume(store(&blobs), "billing", reporter.clone(), JoinerMetrics::new())
            .await
            .unwrap();
        billing.settle().await.unwrap();
        assert_eq!(blobs.writes(), 0);
        assert!(reporter.reports().is_empty());
    }

    #[tokio::test]
    async fn run_bills_until_input_closes() {
        let blobs = Arc::new(InMemBlobStore::new());
        let reporter = Arc::new(RecordingReporter::default());
        let billing = BillingBlock::resume(store(&blobs), "billing", reporter.clone(), JoinerMetrics::new())
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(4);
        tx.send(vec![record("0", 0, 2), record("0", 1, 3)]).await.unwrap();
        tx.send(vec![record("0", 1, 3)]).await.unwrap();
        tx.send(vec![record("1", 0, 1)]).await.unwrap();
        drop(tx);
        billing.run(rx, CancellationToken::new()).await.unwrap();
        assert_eq!(reporter.reports(), vec![5, 1]);
    }
}
