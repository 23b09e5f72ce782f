//! Error types for the joiner pipeline.
//!
//! Errors are split by the boundary they cross. Transport and
//! storage errors know whether they are transient so the receiver
//! and storage layers can retry them with [`crate::backoff`].
//! Everything that reaches the orchestrator is a [`JoinerError`].

use std::panic::Location;

use crate::model::PartitionId;

/// Errors produced by a partition transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transient transport error: {0}")]
    Transient(String),
    #[error("transport error: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors produced by a blob store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("sqlite migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),
    #[error("storage throttled: {0}")]
    Throttled(String),
    #[error("storage task failed: {0}")]
    Task(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Throttled(_) => true,
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Errors decoding transport payloads or persisted logs.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("message preamble too short: {0} bytes")]
    ShortPreamble(usize),
    #[error("unsupported preamble: reserved={reserved} version={version}")]
    UnsupportedPreamble { reserved: u8, version: u8 },
    #[error("unknown message type {0:#06x}")]
    UnknownMessageType(u16),
    #[error("message declares {declared} body bytes but {actual} are present")]
    BodySizeMismatch { declared: usize, actual: usize },
    #[error("truncated {what} at byte {at}")]
    Truncated { what: &'static str, at: usize },
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("timestamp out of range: {0} ms")]
    InvalidTimestamp(i64),
    #[error("timestamp out of range: {secs} s {nanos} ns")]
    InvalidPreciseTimestamp { secs: i64, nanos: u32 },
    #[error("{0} is missing")]
    MissingTimestamp(&'static str),
    #[error("{what} too long: {len} bytes")]
    FieldTooLong { what: &'static str, len: usize },
    #[error("log does not start with the file magic")]
    MissingMagic,
    #[error("file magic found in the middle of the log")]
    MagicMidStream,
    #[error("unsupported log version {0}")]
    UnsupportedVersion(u32),
    #[error("log contains more than one {0} record")]
    DuplicateRecord(&'static str),
    #[error("unknown log record type {0:#010x}")]
    UnknownRecordType(u32),
    #[error("record payload too large: {0} bytes")]
    RecordTooLarge(usize),
    #[error("invalid JSON in {what}: {source}")]
    Json {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top level error of the joiner and its components.
#[derive(Debug, thiserror::Error)]
pub enum JoinerError {
    #[error(
        "interaction stream has {interactions} partitions but observation stream has \
         {observations}; the streams must be symmetric"
    )]
    PartitionCountMismatch {
        interactions: usize,
        observations: usize,
    },
    #[error("stream {0:?} has no partitions")]
    NoPartitions(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("telemetry setup failed: {0}")]
    Telemetry(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("receiver for partition {partition_id} gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        partition_id: PartitionId,
        attempts: u32,
        last: String,
    },
    #[error("{component} failed: {reason}")]
    ComponentFailed { component: String, reason: String },
    #[error("{component} panicked")]
    ComponentPanicked { component: String },
    #[error("({location}) {msg}\nCaused by => {source}")]
    Context {
        location: String,
        msg: String,
        #[source]
        source: Box<JoinerError>,
    },
}

/// Attach a message and the caller's location to any error that
/// converts into a [`JoinerError`].
///
/// Example:
///     store.read(name).await.reraise("error reading joiner checkpoint")?;
pub(crate) trait ResultExt<T> {
    #[track_caller]
    fn reraise(self, msg: &str) -> Result<T, JoinerError>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<JoinerError>,
{
    #[track_caller]
    fn reraise(self, msg: &str) -> Result<T, JoinerError> {
        let caller = Location::caller();
        self.map_err(|err| JoinerError::Context {
            location: format_location(caller),
            msg: msg.to_string(),
            source: Box::new(err.into()),
        })
    }
}

/// Build a [`JoinerError::Config`] with location tracking.
#[track_caller]
pub(crate) fn tracked_config_err(msg: &str) -> JoinerError {
    let caller = Location::caller();
    JoinerError::Config(prepend_caller(caller, msg))
}

fn format_location(caller: &Location) -> String {
    format!("{}:{}:{}", caller.file(), caller.line(), caller.column())
}

fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({}) {msg}", format_location(caller))
}

#[test]
fn reraise_prepends_location_and_cause() {
    let res: Result<(), TransportError> = Err(TransportError::Fatal("gone".to_string()));
    let err = res.reraise("error creating receiver").unwrap_err();
    let msg = err.to_string();
    assert!(msg.starts_with("(src/errors.rs:"));
    assert!(msg.contains(") error creating receiver\nCaused by => transport error: gone"));
}

#[test]
fn transient_classification_works() {
    assert!(TransportError::Transient("timeout".into()).is_transient());
    assert!(!TransportError::Fatal("auth".into()).is_transient());
    assert!(StorageError::Throttled("429".into()).is_transient());
    let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
    assert!(StorageError::Io(io).is_transient());
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
    assert!(!StorageError::Io(io).is_transient());
}
