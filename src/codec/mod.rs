//! Byte level formats.
//!
//! [`preamble`] frames each transport payload, [`payload`] decodes
//! the event batch body behind it, and [`framing`] is the record
//! format used when joined batches are persisted to a log.

pub mod framing;
pub mod payload;
pub mod preamble;

pub use framing::LogReader;
pub use framing::LogRecord;
pub use framing::LogWriter;
pub use payload::decode_batch;
pub use payload::decode_joined_batch;
pub use payload::encode_event_message;
pub use payload::encode_joined_batch;
