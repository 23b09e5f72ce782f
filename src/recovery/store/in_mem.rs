//! Blob store with all data in memory.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::MutexGuard;

use async_trait::async_trait;

use crate::errors::StorageError;
use crate::recovery::BlobStore;

#[derive(Debug, Default)]
struct Inner {
    blobs: HashMap<String, Vec<u8>>,
    write_failures: VecDeque<StorageError>,
    writes: usize,
}

/// A blob store with all data in memory.
///
/// Write failures can be queued up to exercise retry and deferral
/// paths.
#[derive(Debug, Default)]
pub struct InMemBlobStore {
    inner: Mutex<Inner>,
}

impl InMemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(name).cloned()
    }

    pub fn put(&self, name: &str, data: Vec<u8>) {
        self.lock().blobs.insert(name.to_string(), data);
    }

    /// The next writes fail with these errors, in order.
    pub fn inject_write_failures(&self, failures: Vec<StorageError>) {
        self.lock().write_failures.extend(failures);
    }

    /// Number of successful writes.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }
}

#[async_trait]
impl BlobStore for InMemBlobStore {
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.get(name))
    }

    async fn write(&self, name: &str, data: Vec<u8>) -> Result<(), StorageError> {
        let mut inner = self.lock();
        if let Some(err) = inner.write_failures.pop_front() {
            return Err(err);
        }
        inner.blobs.insert(name.to_string(), data);
        inner.writes += 1;
        Ok(())
    }
}

#[tokio::test]
async fn injected_failures_come_first() {
    let store = InMemBlobStore::new();
    store.inject_write_failures(vec![StorageError::Throttled("busy".into())]);
    assert!(store.write("a", vec![1]).await.is_err());
    store.write("a", vec![2]).await.unwrap();
    assert_eq!(store.read("a").await.unwrap(), Some(vec![2]));
    assert_eq!(store.writes(), 1);
}
