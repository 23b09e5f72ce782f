//! Binary framing for persisted joined logs.
//!
//! A log is a sequence of little endian records, each padded to an
//! 8 byte boundary:
//!
//! ```text
//! [record type: u32][payload size: u32][payload][zero padding]
//! ```
//!
//! The file starts with the magic record, whose second word is the
//! format version instead of a size. After that come at most one
//! file header (JSON string map), at most one checkpoint (joiner
//! checkpoint JSON), any number of regular records (joined batches)
//! and optionally an EOF record.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;

use crate::checkpoint::EventHubCheckpoint;
use crate::errors::CodecError;

pub const FILE_MAGIC: u32 = 0x4246_5756;
pub const REGULAR: u32 = 0xFFFF_FFFF;
pub const FILE_HEADER: u32 = 0x5555_5555;
pub const CHECKPOINT: u32 = 0x1111_1111;
pub const EOF: u32 = 0xAAAA_AAAA;

pub const LOG_VERSION: u32 = 1;

const ALIGNMENT: usize = 8;
const MAX_RECORD_SIZE: usize = 256 * 1024 * 1024;

fn padding(size: usize) -> usize {
    (ALIGNMENT - size % ALIGNMENT) % ALIGNMENT
}

/// One decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Header(BTreeMap<String, String>),
    Checkpoint(EventHubCheckpoint),
    Regular(Vec<u8>),
}

pub struct LogWriter<W: Write> {
    inner: W,
    wrote_header: bool,
    wrote_checkpoint: bool,
}

impl<W: Write> LogWriter<W> {
    /// Start a new log, writing the magic record.
    pub fn new(mut inner: W) -> Result<Self, CodecError> {
        inner.write_all(&FILE_MAGIC.to_le_bytes())?;
        inner.write_all(&LOG_VERSION.to_le_bytes())?;
        Ok(Self {
            inner,
            wrote_header: false,
            wrote_checkpoint: false,
        })
    }

    pub fn write_header(&mut self, properties: &BTreeMap<String, String>) -> Result<(), CodecError> {
        if self.wrote_header {
            return Err(CodecError::DuplicateRecord("file header"));
        }
        let payload = serde_json::to_vec(properties).map_err(|source| CodecError::Json {
            what: "file header",
            source,
        })?;
        self.write_record(FILE_HEADER, &payload)?;
        self.wrote_header = true;
        Ok(())
    }

    pub fn write_checkpoint(&mut self, checkpoint: &EventHubCheckpoint) -> Result<(), CodecError> {
        if self.wrote_checkpoint {
            return Err(CodecError::DuplicateRecord("checkpoint"));
        }
        let payload = checkpoint.to_json().map_err(|source| CodecError::Json {
            what: "checkpoint",
            source,
        })?;
        self.write_record(CHECKPOINT, &payload)?;
        self.wrote_checkpoint = true;
        Ok(())
    }

    pub fn write_regular(&mut self, payload: &[u8]) -> Result<(), CodecError> {
        self.write_record(REGULAR, payload)
    }

    /// Write the EOF record and hand back the underlying writer.
    pub fn finish(mut self) -> Result<W, CodecError> {
        self.write_record(EOF, &[])?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn write_record(&mut self, record_type: u32, payload: &[u8]) -> Result<(), CodecError> {
        if payload.len() > MAX_RECORD_SIZE {
            return Err(CodecError::RecordTooLarge(payload.len()));
        }
        let size = payload.len() as u32;
        self.inner.write_all(&record_type.to_le_bytes())?;
        self.inner.write_all(&size.to_le_bytes())?;
        self.inner.write_all(payload)?;
        let pad = [0u8; ALIGNMENT];
        self.inner.write_all(&pad[..padding(payload.len())])?;
        Ok(())
    }
}

pub struct LogReader<R: Read> {
    inner: R,
    position: usize,
    seen_header: bool,
    seen_checkpoint: bool,
    done: bool,
}

impl<R: Read> LogReader<R> {
    /// Open a log, validating the magic record.
    pub fn new(inner: R) -> Result<Self, CodecError> {
        let mut reader = Self {
            inner,
            position: 0,
            seen_header: false,
            seen_checkpoint: false,
            done: false,
        };
        match reader.read_u32_or_end("file magic")? {
            Some(FILE_MAGIC) => {}
            _ => return Err(CodecError::MissingMagic),
        }
        let version = reader.read_u32("log version")?;
        if version != LOG_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        Ok(reader)
    }

    /// Byte offset of the next record.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Read the next record, or `None` at EOF.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>, CodecError> {
        if self.done {
            return Ok(None);
        }
        let Some(record_type) = self.read_u32_or_end("record type")? else {
            self.done = true;
            return Ok(None);
        };
        if record_type == FILE_MAGIC {
            return Err(CodecError::MagicMidStream);
        }
        if !matches!(record_type, REGULAR | FILE_HEADER | CHECKPOINT | EOF) {
            return Err(CodecError::UnknownRecordType(record_type));
        }
        let size = self.read_u32("record size")? as usize;
        if size > MAX_RECORD_SIZE {
            return Err(CodecError::RecordTooLarge(size));
        }
        let mut payload = vec![0u8; size];
        self.read_exact(&mut payload, "record payload")?;
        let mut pad = [0u8; ALIGNMENT];
        self.read_exact(&mut pad[..padding(size)], "record padding")?;

        match record_type {
            EOF => {
                self.done = true;
                Ok(None)
            }
            FILE_HEADER => {
                if self.seen_header {
                    return Err(CodecError::DuplicateRecord("file header"));
                }
                self.seen_header = true;
                let properties =
                    serde_json::from_slice(&payload).map_err(|source| CodecError::Json {
                        what: "file header",
                        source,
                    })?;
                Ok(Some(LogRecord::Header(properties)))
            }
            CHECKPOINT => {
                if self.seen_checkpoint {
                    return Err(CodecError::DuplicateRecord("checkpoint"));
                }
                self.seen_checkpoint = true;
                let checkpoint =
                    EventHubCheckpoint::from_json(&payload).map_err(|source| CodecError::Json {
                        what: "checkpoint",
                        source,
                    })?;
                Ok(Some(LogRecord::Checkpoint(checkpoint)))
            }
            _ => Ok(Some(LogRecord::Regular(payload))),
        }
    }

    fn read_exact(&mut self, buf: &mut [u8], what: &'static str) -> Result<(), CodecError> {
        match self.inner.read_exact(buf) {
            Ok(()) => {
                self.position += buf.len();
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Err(CodecError::Truncated {
                what,
                at: self.position,
            }),
            Err(err) => Err(err.into()),
        }
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32, CodecError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf, what)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Like `read_u32` but a clean end of input yields `None`.
    fn read_u32_or_end(&mut self, what: &'static str) -> Result<Option<u32>, CodecError> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(CodecError::Truncated {
                        what,
                        at: self.position,
                    })
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.position += buf.len();
        Ok(Some(u32::from_le_bytes(buf)))
    }
}

impl<R: Read> Iterator for LogReader<R> {
    type Item = Result<LogRecord, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

#[cfg(test)]
use crate::model::{ts, PartitionId};

#[test]
fn log_round_trip_is_aligned() {
    let properties = BTreeMap::from([
        ("joiner".to_string(), "rewardjoin".to_string()),
        ("window".to_string(), "3600".to_string()),
    ]);
    let mut checkpoint = EventHubCheckpoint::default();
    checkpoint.advance(&PartitionId::from("0"), 17, ts(4)).unwrap();
    let payloads: Vec<Vec<u8>> = vec![vec![], vec![1], (0..8).collect(), (0..13).collect()];

    let mut writer = LogWriter::new(Vec::new()).unwrap();
    writer.write_header(&properties).unwrap();
    writer.write_checkpoint(&checkpoint).unwrap();
    for payload in &payloads {
        writer.write_regular(payload).unwrap();
    }
    let bytes = writer.finish().unwrap();
    assert_eq!(bytes.len() % 8, 0);
    assert_eq!(&bytes[..4], b"VWFB");

    let mut reader = LogReader::new(bytes.as_slice()).unwrap();
    let mut records = Vec::new();
    while let Some(record) = reader.next_record().unwrap() {
        assert_eq!(reader.position() % 8, 0);
        records.push(record);
    }
    assert_eq!(reader.position(), bytes.len());

    let mut expected = vec![
        LogRecord::Header(properties),
        LogRecord::Checkpoint(checkpoint),
    ];
    expected.extend(payloads.into_iter().map(LogRecord::Regular));
    assert_eq!(records, expected);
}

#[test]
fn log_without_eof_ends_cleanly() {
    let mut writer = LogWriter::new(Vec::new()).unwrap();
    writer.write_regular(b"abc").unwrap();
    let bytes = writer.inner;
    let records: Result<Vec<_>, _> = LogReader::new(bytes.as_slice()).unwrap().collect();
    assert_eq!(records.unwrap(), vec![LogRecord::Regular(b"abc".to_vec())]);
}

#[test]
fn missing_magic_is_fatal() {
    let bytes = [0xFFu8, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0];
    assert!(matches!(
        LogReader::new(&bytes[..]),
        Err(CodecError::MissingMagic)
    ));
    assert!(matches!(
        LogReader::new(&[][..]),
        Err(CodecError::MissingMagic)
    ));
}

#[test]
fn magic_mid_stream_is_fatal() {
    let mut writer = LogWriter::new(Vec::new()).unwrap();
    writer.write_regular(b"x").unwrap();
    let mut bytes = writer.inner;
    bytes.extend_from_slice(&FILE_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&LOG_VERSION.to_le_bytes());

    let mut reader = LogReader::new(bytes.as_slice()).unwrap();
    assert!(reader.next_record().unwrap().is_some());
    assert!(matches!(
        reader.next_record(),
        Err(CodecError::MagicMidStream)
    ));
}

#[test]
fn duplicate_header_is_rejected() {
    let props = BTreeMap::new();
    let mut writer = LogWriter::new(Vec::new()).unwrap();
    writer.write_header(&props).unwrap();
    assert!(matches!(
        writer.write_header(&props),
        Err(CodecError::DuplicateRecord("file header"))
    ));

    // Hand craft a second header record to check the reader too.
    let mut bytes = writer.inner;
    let payload = b"{}";
    bytes.extend_from_slice(&FILE_HEADER.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(&[0u8; 6]);
    let mut reader = LogReader::new(bytes.as_slice()).unwrap();
    assert!(reader.next_record().unwrap().is_some());
    assert!(matches!(
        reader.next_record(),
        Err(CodecError::DuplicateRecord("file header"))
    ));
}
