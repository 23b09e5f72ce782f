//! SQLite implementation of a blob store.
//!
//! All blobs live in one `blobs` table. Connections are opened with
//! the same pragmas as every other SQLite file we write.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;

use async_trait::async_trait;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use crate::errors::StorageError;
use crate::recovery::BlobStore;

// The `'static` lifetime within [`Migrations`] is saying that the
// [`str`]s composing the migrations are `'static`.
static MIGRATIONS: OnceLock<Migrations<'static>> = OnceLock::new();

fn get_migrations() -> &'static Migrations<'static> {
    MIGRATIONS.get_or_init(|| {
        Migrations::new(vec![M::up(
            "CREATE TABLE blobs ( \
             name TEXT NOT NULL PRIMARY KEY, \
             data BLOB NOT NULL, \
             updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP \
             ) STRICT",
        )])
    })
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> Result<(), StorageError> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    get_migrations().to_latest(conn)?;
    Ok(())
}

#[derive(Clone)]
pub struct SqliteBlobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBlobStore {
    pub fn open(file: &Path) -> Result<Self, StorageError> {
        tracing::info!("Opening SQLite blob store at {file:?}");
        let mut conn = Connection::open_with_flags(
            file,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        setup_conn(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let mut conn = Connection::open_in_memory()?;
        setup_conn(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking closure against the connection off the async
    /// executor.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut conn)
        })
        .await
        .map_err(|err| StorageError::Task(err.to_string()))?
    }
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let data = conn
                .query_row(
                    "SELECT data FROM blobs WHERE name = ?1",
                    rusqlite::params![name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(data)
        })
        .await
    }

    async fn write(&self, name: &str, data: Vec<u8>) -> Result<(), StorageError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let txn = conn.transaction()?;
            tracing::trace!("Writing blob {name:?}");
            txn.execute(
                "INSERT INTO blobs (name, data) \
                 VALUES (?1, ?2) \
                 ON CONFLICT (name) DO UPDATE \
                 SET data = excluded.data, updated_at = CURRENT_TIMESTAMP",
                rusqlite::params![name, data],
            )?;
            txn.commit()?;
            Ok(())
        })
        .await
    }
}

#[tokio::test]
async fn sqlite_store_upserts() {
    let store = SqliteBlobStore::open_in_memory().unwrap();
    assert_eq!(store.read("cp").await.unwrap(), None);
    store.write("cp", b"one".to_vec()).await.unwrap();
    store.write("cp", b"two".to_vec()).await.unwrap();
    store.write("other", b"x".to_vec()).await.unwrap();
    assert_eq!(store.read("cp").await.unwrap(), Some(b"two".to_vec()));
}

#[tokio::test]
async fn sqlite_store_persists_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.sqlite3");
    {
        let store = SqliteBlobStore::open(&path).unwrap();
        store.write("cp", b"{}".to_vec()).await.unwrap();
    }
    let store = SqliteBlobStore::open(&path).unwrap();
    assert_eq!(store.read("cp").await.unwrap(), Some(b"{}".to_vec()));
}
