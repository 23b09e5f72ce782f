//! Durable checkpoints.
//!
//! Architecture
//! ------------
//!
//! Checkpoints are whole JSON documents stored under a well-known
//! name in a [`BlobStore`]. Every write replaces the whole blob;
//! there are no partial updates. Each checkpoint has exactly one
//! owner: the joiner's checkpoint actor for the
//! [`EventHubCheckpoint`] and the billing block for the
//! [`BillingCheckpoint`].
//!
//! [`CheckpointStore`] wraps a blob store with JSON handling and
//! retries transient storage errors with [`Backoff`]. A missing blob
//! means "start from scratch", and so does a corrupt one, after a
//! warning.

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;

use crate::backoff::Backoff;
use crate::checkpoint::BillingCheckpoint;
use crate::checkpoint::EventHubCheckpoint;
use crate::errors::JoinerError;
use crate::errors::ResultExt;
use crate::errors::StorageError;
use crate::metrics::JoinerMetrics;
use crate::with_timer;

pub mod store;

pub use store::in_mem::InMemBlobStore;
pub use store::local::LocalBlobStore;
pub use store::sqlite::SqliteBlobStore;

/// Whole-blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a blob, `None` if it does not exist.
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Create or overwrite a blob.
    async fn write(&self, name: &str, data: Vec<u8>) -> Result<(), StorageError>;
}

/// JSON checkpoints on top of a [`BlobStore`].
#[derive(Clone)]
pub struct CheckpointStore {
    blobs: Arc<dyn BlobStore>,
    max_attempts: u32,
    backoff: Backoff,
    metrics: JoinerMetrics,
}

impl CheckpointStore {
    pub fn new(blobs: Arc<dyn BlobStore>, max_attempts: u32) -> Self {
        Self {
            blobs,
            max_attempts: max_attempts.max(1),
            backoff: Backoff::default(),
            metrics: JoinerMetrics::new(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn load_joiner(&self, name: &str) -> Result<EventHubCheckpoint, JoinerError> {
        self.load_json(name, "joiner checkpoint").await
    }

    pub async fn save_joiner(
        &self,
        name: &str,
        checkpoint: &EventHubCheckpoint,
    ) -> Result<(), JoinerError> {
        let bytes = checkpoint.to_json()?;
        self.write_with_retry(name, bytes)
            .await
            .reraise("error writing joiner checkpoint")
    }

    pub async fn load_billing(&self, name: &str) -> Result<BillingCheckpoint, JoinerError> {
        self.load_json(name, "billing checkpoint").await
    }

    pub async fn save_billing(
        &self,
        name: &str,
        checkpoint: &BillingCheckpoint,
    ) -> Result<(), JoinerError> {
        let bytes = checkpoint.to_json()?;
        self.write_with_retry(name, bytes)
            .await
            .reraise("error writing billing checkpoint")
    }

    async fn load_json<T: DeserializeOwned + Default>(
        &self,
        name: &str,
        what: &str,
    ) -> Result<T, JoinerError> {
        let Some(bytes) = self
            .read_with_retry(name)
            .await
            .reraise(&format!("error reading {what}"))?
        else {
            tracing::info!(blob = name, "No {what} found; starting from scratch");
            return Ok(T::default());
        };
        match serde_json::from_slice(&bytes) {
            Ok(checkpoint) => Ok(checkpoint),
            Err(err) => {
                tracing::warn!(blob = name, %err, "Corrupt {what}; starting from scratch");
                Ok(T::default())
            }
        }
    }

    async fn read_with_retry(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut backoff = self.backoff.clone();
        loop {
            match self.blobs.read(name).await {
                Err(err) if err.is_transient() && backoff.attempts() + 1 < self.max_attempts => {
                    let delay = backoff.next_delay();
                    tracing::warn!(blob = name, %err, ?delay, "Transient storage error reading blob; retrying");
                    tokio::time::sleep(delay).await;
                }
                res => return res,
            }
        }
    }

    async fn write_with_retry(&self, name: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let labels = [KeyValue::new("blob", name.to_string())];
        let mut backoff = self.backoff.clone();
        loop {
            let res = with_timer!(
                self.metrics.checkpoint_persist_duration,
                labels,
                self.blobs.write(name, bytes.clone()).await
            );
            match res {
                Err(err) if err.is_transient() && backoff.attempts() + 1 < self.max_attempts => {
                    let delay = backoff.next_delay();
                    tracing::warn!(blob = name, %err, ?delay, "Transient storage error writing blob; retrying");
                    tokio::time::sleep(delay).await;
                }
                res => return res,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{ts, PartitionId};

    fn store(blobs: Arc<InMemBlobStore>) -> CheckpointStore {
        CheckpointStore::new(blobs, 3)
            .with_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn missing_and_corrupt_blobs_start_from_scratch() {
        let blobs = Arc::new(InMemBlobStore::new());
        let store = store(blobs.clone());
        assert!(store.load_joiner("cp").await.unwrap().is_empty());

        blobs.put("cp", b"{not json".to_vec());
        assert!(store.load_joiner("cp").await.unwrap().is_empty());
        blobs.put("billing", b"[1, 2]".to_vec());
        assert_eq!(
            store.load_billing("billing").await.unwrap(),
            BillingCheckpoint::default()
        );
    }

    #[tokio::test]
    async fn checkpoints_survive_a_reload() {
        let blobs = Arc::new(InMemBlobStore::new());
        let store = store(blobs.clone());
        let mut cp = EventHubCheckpoint::default();
        cp.advance(&PartitionId::from("0"), 9, ts(1)).unwrap();
        store.save_joiner("cp", &cp).await.unwrap();

        let mut billing = BillingCheckpoint::default();
        billing.try_advance(&PartitionId::from("0"), 4);
        store.save_billing("billing", &billing).await.unwrap();

        let reloaded = CheckpointStore::new(blobs, 1);
        assert_eq!(reloaded.load_joiner("cp").await.unwrap(), cp);
        assert_eq!(reloaded.load_billing("billing").await.unwrap(), billing);
    }

    #[tokio::test]
    async fn transient_write_errors_are_retried() {
        let blobs = Arc::new(InMemBlobStore::new());
        blobs.inject_write_failures(vec![
            StorageError::Throttled("slow down".into()),
            StorageError::Throttled("slow down".into()),
        ]);
        let store = store(blobs.clone());
        store
            .save_billing("billing", &BillingCheckpoint::default())
            .await
            .unwrap();
        assert_eq!(blobs.get("billing"), Some(b"{}".to_vec()));
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let blobs = Arc::new(InMemBlobStore::new());
        blobs.inject_write_failures(
            (0..3)
                .map(|_| StorageError::Throttled("slow down".into()))
                .collect(),
        );
        let store = store(blobs.clone());
        let err = store
            .save_billing("billing", &BillingCheckpoint::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("error writing billing checkpoint"));
        assert_eq!(blobs.get("billing"), None);
    }
}
