//! Persisting joined output.
//!
//! [`JoinedLogSink`] writes joined batches as regular records of a
//! framed log (see [`crate::codec::framing`]), after optional header
//! properties and the checkpoint the batches resume from.
//! [`read_joined_log`] reads such a log back.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Read;
use std::io::Write;
use std::path::Path;

use crate::checkpoint::EventHubCheckpoint;
use crate::codec::decode_joined_batch;
use crate::codec::encode_joined_batch;
use crate::codec::LogReader;
use crate::codec::LogRecord;
use crate::codec::LogWriter;
use crate::errors::CodecError;
use crate::model::JoinedBatch;

pub struct JoinedLogSink<W: Write> {
    writer: LogWriter<W>,
    batches: usize,
}

impl<W: Write> JoinedLogSink<W> {
    pub fn new(
        inner: W,
        properties: Option<&BTreeMap<String, String>>,
        checkpoint: Option<&EventHubCheckpoint>,
    ) -> Result<Self, CodecError> {
        let mut writer = LogWriter::new(inner)?;
        if let Some(properties) = properties {
            writer.write_header(properties)?;
        }
        if let Some(checkpoint) = checkpoint {
            writer.write_checkpoint(checkpoint)?;
        }
        Ok(Self { writer, batches: 0 })
    }

    pub fn write_batch(&mut self, batch: &JoinedBatch) -> Result<(), CodecError> {
        let payload = encode_joined_batch(batch)?;
        self.writer.write_regular(&payload)?;
        self.batches += 1;
        tracing::trace!(
            partition_id = %batch.partition_id,
            sequence_number = batch.sequence_number,
            bytes = payload.len(),
            "Wrote joined batch"
        );
        Ok(())
    }

    /// Batches written so far.
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Write the EOF record and return the inner writer.
    pub fn finish(self) -> Result<W, CodecError> {
        tracing::debug!(batches = self.batches, "Closing joined log");
        self.writer.finish()
    }
}

impl JoinedLogSink<BufWriter<File>> {
    pub fn create(
        path: impl AsRef<Path>,
        properties: Option<&BTreeMap<String, String>>,
        checkpoint: Option<&EventHubCheckpoint>,
    ) -> Result<Self, CodecError> {
        let path = path.as_ref();
        tracing::info!("Writing joined log to {path:?}");
        Self::new(BufWriter::new(File::create(path)?), properties, checkpoint)
    }
}

/// Contents of a joined log.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JoinedLog {
    pub properties: BTreeMap<String, String>,
    pub checkpoint: Option<EventHubCheckpoint>,
    pub batches: Vec<JoinedBatch>,
}

pub fn read_joined_log<R: Read>(inner: R) -> Result<JoinedLog, CodecError> {
    let mut log = JoinedLog::default();
    for record in LogReader::new(inner)? {
        match record? {
            LogRecord::Header(properties) => log.properties = properties,
            LogRecord::Checkpoint(checkpoint) => log.checkpoint = Some(checkpoint),
            LogRecord::Regular(payload) => log.batches.push(decode_joined_batch(&payload)?),
        }
    }
    Ok(log)
}

pub fn read_joined_log_file(path: impl AsRef<Path>) -> Result<JoinedLog, CodecError> {
    read_joined_log(BufReader::new(File::open(path)?))
}
