//! Blob store keeping one file per blob in a directory.

use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::errors::StorageError;
use crate::recovery::BlobStore;

#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    dir: PathBuf,
}

impl LocalBlobStore {
    /// Use `dir`, creating it if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, StorageError> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\']);
        if !valid {
            return Err(StorageError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid blob name {name:?}"),
            )));
        }
        Ok(self.dir.join(name))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes a temp file then renames it over the blob, so readers
    /// only ever see whole blobs.
    async fn write(&self, name: &str, data: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path_for(name)?;
        let tmp = self.dir.join(format!(".{name}.tmp"));
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::trace!("Wrote {} bytes to {path:?}", data.len());
        Ok(())
    }
}

#[tokio::test]
async fn local_store_overwrites_whole_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalBlobStore::open(dir.path().join("checkpoints")).await.unwrap();
    assert_eq!(store.read("cp.json").await.unwrap(), None);
    store.write("cp.json", b"first".to_vec()).await.unwrap();
    store.write("cp.json", b"2nd".to_vec()).await.unwrap();
    assert_eq!(store.read("cp.json").await.unwrap(), Some(b"2nd".to_vec()));
}

#[tokio::test]
async fn local_store_rejects_paths() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalBlobStore::open(dir.path()).await.unwrap();
    assert!(store.write("../escape", vec![]).await.is_err());
    assert!(store.read("a/b").await.is_err());
}
