//! Event batch bodies and joined batch records.
//!
//! An event batch body is a sequence of event records:
//!
//! ```text
//! [payload type: u8]
//! [enqueued time ms: i64][client time ms or i64::MIN: i64]
//! [app id len: u16][app id]
//! [event id len: u16][event id]
//! [payload len: u32][payload]
//! ```
//!
//! A joined batch record keeps full precision for every time, since
//! it is written by this process and read back by consumers that
//! compare against the original messages:
//!
//! ```text
//! [offset: i64][sequence number: i64]
//! [partition id len: u16][partition id]
//! [enqueued time: time]
//! [source event count: u32][group count: u32]
//! per group: [record count: u32] then event records with each
//!            `time ms: i64` replaced by `time: time`
//!
//! time = [seconds or i64::MIN: i64][subsecond nanos: u32]
//! ```
//!
//! All integers are big endian. Payloads are opaque.

use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;

use super::preamble::split_message;
use super::preamble::MessageType;
use super::preamble::Preamble;
use crate::errors::CodecError;
use crate::inputs::RawEvent;
use crate::model::JoinedBatch;
use crate::model::Message;
use crate::model::MessageBatch;
use crate::model::PartitionId;
use crate::model::PayloadType;

const NO_TIME: i64 = i64::MIN;

/// How record times are laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimePrecision {
    /// Event bodies: `i64` milliseconds.
    Millis,
    /// Joined batches: `i64` seconds and `u32` subsecond nanos.
    Nanos,
}

/// Wire tags for each payload type.
const PAYLOAD_TYPES: [(u8, PayloadType); 5] = [
    (1, PayloadType::Interaction),
    (2, PayloadType::MultiStepInteraction),
    (3, PayloadType::Observation),
    (4, PayloadType::EpisodeObservation),
    (5, PayloadType::Dictionary),
];

impl PayloadType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        PAYLOAD_TYPES
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, payload_type)| *payload_type)
    }

    pub fn tag(&self) -> u8 {
        PAYLOAD_TYPES
            .iter()
            .find(|(_, payload_type)| payload_type == self)
            .map(|(t, _)| *t)
            .unwrap_or_default()
    }
}

/// Cursor over a byte slice that reports where it ran out.
struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(CodecError::Truncated { what, at: self.pos })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, CodecError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, CodecError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, CodecError> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self, what: &'static str) -> Result<i64, CodecError> {
        let b = self.take(8, what)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(i64::from_be_bytes(arr))
    }

    fn short_str(&mut self, what: &'static str) -> Result<String, CodecError> {
        let len = self.u16(what)? as usize;
        let bytes = self.take(len, what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8(what))
    }

    /// Read a time that may be absent.
    fn opt_time(
        &mut self,
        precision: TimePrecision,
        what: &'static str,
    ) -> Result<Option<DateTime<Utc>>, CodecError> {
        match precision {
            TimePrecision::Millis => match self.i64(what)? {
                NO_TIME => Ok(None),
                millis => millis_to_time(millis).map(Some),
            },
            TimePrecision::Nanos => {
                let secs = self.i64(what)?;
                let nanos = self.u32(what)?;
                if secs == NO_TIME {
                    return Ok(None);
                }
                Utc.timestamp_opt(secs, nanos)
                    .single()
                    .map(Some)
                    .ok_or(CodecError::InvalidPreciseTimestamp { secs, nanos })
            }
        }
    }

    fn time(
        &mut self,
        precision: TimePrecision,
        what: &'static str,
    ) -> Result<DateTime<Utc>, CodecError> {
        self.opt_time(precision, what)?
            .ok_or(CodecError::MissingTimestamp(what))
    }
}

fn millis_to_time(millis: i64) -> Result<DateTime<Utc>, CodecError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(CodecError::InvalidTimestamp(millis))
}

fn put_time(out: &mut Vec<u8>, time: Option<DateTime<Utc>>, precision: TimePrecision) {
    match precision {
        TimePrecision::Millis => {
            let millis = time.map_or(NO_TIME, |t| t.timestamp_millis());
            out.extend_from_slice(&millis.to_be_bytes());
        }
        TimePrecision::Nanos => {
            let (secs, nanos) =
                time.map_or((NO_TIME, 0), |t| (t.timestamp(), t.timestamp_subsec_nanos()));
            out.extend_from_slice(&secs.to_be_bytes());
            out.extend_from_slice(&nanos.to_be_bytes());
        }
    }
}

fn put_short_str(out: &mut Vec<u8>, s: &str, what: &'static str) -> Result<(), CodecError> {
    let len = u16::try_from(s.len()).map_err(|_| CodecError::FieldTooLong {
        what,
        len: s.len(),
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_u32_len(out: &mut Vec<u8>, len: usize, what: &'static str) -> Result<(), CodecError> {
    let len = u32::try_from(len).map_err(|_| CodecError::FieldTooLong { what, len })?;
    out.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

/// Read one event record.
///
/// Returns `None` for records that should be skipped. The cursor is
/// always left at the start of the next record.
fn read_record(
    reader: &mut ByteReader,
    precision: TimePrecision,
) -> Result<Option<Message>, CodecError> {
    let tag = reader.u8("payload type")?;
    let enqueued_time_utc = reader.time(precision, "enqueued time")?;
    let client_time_utc = reader.opt_time(precision, "client time")?;
    let app_id = reader.short_str("app id")?;
    let event_id = reader.short_str("event id")?;
    let payload_len = reader.u32("payload length")? as usize;
    let payload = reader.take(payload_len, "payload")?.to_vec();

    let Some(payload_type) = PayloadType::from_tag(tag) else {
        tracing::warn!(tag, %event_id, "Skipping event with unknown payload type");
        return Ok(None);
    };
    if event_id.is_empty() {
        tracing::warn!(%app_id, ?payload_type, "Skipping event with empty event id");
        return Ok(None);
    }
    Ok(Some(Message {
        app_id,
        event_id,
        payload_type,
        enqueued_time_utc,
        client_time_utc,
        payload,
    }))
}

fn write_record(
    out: &mut Vec<u8>,
    msg: &Message,
    precision: TimePrecision,
) -> Result<(), CodecError> {
    out.push(msg.payload_type.tag());
    put_time(out, Some(msg.enqueued_time_utc), precision);
    put_time(out, msg.client_time_utc, precision);
    put_short_str(out, &msg.app_id, "app id")?;
    put_short_str(out, &msg.event_id, "event id")?;
    put_u32_len(out, msg.payload.len(), "payload")?;
    out.extend_from_slice(&msg.payload);
    Ok(())
}

/// Messages decoded from one event batch body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvents {
    pub messages: Vec<Message>,
    /// Every record in the body, including skipped ones.
    pub original_event_count: usize,
}

pub fn decode_event_body(body: &[u8]) -> Result<DecodedEvents, CodecError> {
    let mut reader = ByteReader::new(body);
    let mut messages = Vec::new();
    let mut original_event_count = 0;
    while !reader.is_empty() {
        original_event_count += 1;
        if let Some(msg) = read_record(&mut reader, TimePrecision::Millis)? {
            messages.push(msg);
        }
    }
    Ok(DecodedEvents {
        messages,
        original_event_count,
    })
}

pub fn encode_event_body(messages: &[Message]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    for msg in messages {
        write_record(&mut out, msg, TimePrecision::Millis)?;
    }
    Ok(out)
}

/// Encode messages as a full transport payload, preamble included.
pub fn encode_event_message(messages: &[Message]) -> Result<Vec<u8>, CodecError> {
    let body = encode_event_body(messages)?;
    let message_size = u32::try_from(body.len()).map_err(|_| CodecError::FieldTooLong {
        what: "event batch",
        len: body.len(),
    })?;
    let preamble = Preamble {
        message_type: MessageType::EventBatch,
        message_size,
    };
    let mut out = Vec::with_capacity(body.len() + preamble.to_bytes().len());
    out.extend_from_slice(&preamble.to_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Turn a raw transport event into a batch.
pub fn decode_batch(raw: RawEvent) -> Result<MessageBatch, CodecError> {
    let (preamble, body) = split_message(&raw.body)?;
    let decoded = match preamble.message_type {
        MessageType::EventBatch => decode_event_body(body)?,
    };
    Ok(MessageBatch {
        offset: raw.offset,
        sequence_number: raw.sequence_number,
        partition_id: raw.partition_id,
        enqueued_time_utc: raw.enqueued_time_utc,
        original_event_count: decoded.original_event_count,
        messages: decoded.messages,
    })
}

/// Encode a joined batch as the payload of a regular log record.
pub fn encode_joined_batch(batch: &JoinedBatch) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    out.extend_from_slice(&batch.offset.to_be_bytes());
    out.extend_from_slice(&batch.sequence_number.to_be_bytes());
    put_short_str(&mut out, &batch.partition_id.0, "partition id")?;
    put_time(&mut out, Some(batch.enqueued_time_utc), TimePrecision::Nanos);
    put_u32_len(&mut out, batch.source_message_event_count, "source event count")?;
    put_u32_len(&mut out, batch.messages.len(), "group count")?;
    for group in &batch.messages {
        put_u32_len(&mut out, group.len(), "group")?;
        for msg in group {
            write_record(&mut out, msg, TimePrecision::Nanos)?;
        }
    }
    Ok(out)
}

pub fn decode_joined_batch(bytes: &[u8]) -> Result<JoinedBatch, CodecError> {
    let mut reader = ByteReader::new(bytes);
    let offset = reader.i64("offset")?;
    let sequence_number = reader.i64("sequence number")?;
    let partition_id = PartitionId(reader.short_str("partition id")?);
    let enqueued_time_utc = reader.time(TimePrecision::Nanos, "enqueued time")?;
    let source_message_event_count = reader.u32("source event count")? as usize;
    let group_count = reader.u32("group count")? as usize;
    let mut messages = Vec::new();
    for _ in 0..group_count {
        let len = reader.u32("group")? as usize;
        let mut group = Vec::new();
        for _ in 0..len {
            if let Some(msg) = read_record(&mut reader, TimePrecision::Nanos)? {
                group.push(msg);
            }
        }
        messages.push(group);
    }
    Ok(JoinedBatch {
        offset,
        sequence_number,
        partition_id,
        enqueued_time_utc,
        source_message_event_count,
        messages,
    })
}

#[cfg(test)]
use crate::model::{test_message, ts};

#[test]
fn decode_batch_keeps_transport_metadata() {
    let mut interaction = test_message("e1", PayloadType::Interaction, 1);
    interaction.client_time_utc = Some(ts(-3));
    let msgs = vec![interaction, test_message("e2", PayloadType::Observation, 2)];
    let raw = RawEvent {
        offset: 512,
        sequence_number: 4,
        partition_id: PartitionId::from("7"),
        enqueued_time_utc: ts(2),
        body: encode_event_message(&msgs).unwrap(),
    };
    let batch = decode_batch(raw).unwrap();
    assert_eq!(batch.offset, 512);
    assert_eq!(batch.sequence_number, 4);
    assert_eq!(batch.partition_id, PartitionId::from("7"));
    assert_eq!(batch.original_event_count, 2);
    assert_eq!(batch.messages, msgs);
}

#[test]
fn unknown_payload_type_and_empty_event_id_are_skipped() {
    let good = test_message("keep", PayloadType::Interaction, 0);
    let empty = test_message("", PayloadType::Interaction, 0);
    let mut body = encode_event_body(&[good.clone()]).unwrap();
    let mut unknown = encode_event_body(&[test_message("x", PayloadType::Observation, 0)]).unwrap();
    unknown[0] = 42;
    body.extend_from_slice(&unknown);
    body.extend_from_slice(&encode_event_body(&[empty]).unwrap());
    body.extend_from_slice(&encode_event_body(&[good.clone()]).unwrap());

    let decoded = decode_event_body(&body).unwrap();
    assert_eq!(decoded.original_event_count, 4);
    assert_eq!(decoded.messages, vec![good.clone(), good]);
}

#[test]
fn truncated_body_is_an_error() {
    let body = encode_event_body(&[test_message("e", PayloadType::Interaction, 0)]).unwrap();
    let res = decode_event_body(&body[..body.len() - 1]);
    assert!(matches!(
        res,
        Err(CodecError::Truncated {
            what: "payload",
            ..
        })
    ));
}

#[test]
fn joined_batch_decodes_groups() {
    let batch = JoinedBatch {
        offset: 10,
        sequence_number: 2,
        partition_id: PartitionId::from("0"),
        enqueued_time_utc: ts(5),
        source_message_event_count: 3,
        messages: vec![
            vec![
                test_message("a", PayloadType::Interaction, 1),
                test_message("a", PayloadType::Observation, 2),
            ],
            vec![test_message("b", PayloadType::Interaction, 3)],
        ],
    };
    let bytes = encode_joined_batch(&batch).unwrap();
    assert_eq!(decode_joined_batch(&bytes).unwrap(), batch);
}

#[test]
fn joined_batch_keeps_subsecond_times() {
    let precise = |secs: i64, nanos: u32| Utc.timestamp_opt(secs, nanos).single().unwrap();
    let mut interaction = test_message("a", PayloadType::Interaction, 1);
    interaction.enqueued_time_utc = precise(1_700_000_000, 123_456_789);
    interaction.client_time_utc = Some(precise(1_699_999_999, 999_999_999));
    let mut observation = test_message("a", PayloadType::Observation, 2);
    observation.enqueued_time_utc = precise(1_700_000_001, 1);
    let batch = JoinedBatch {
        offset: 3,
        sequence_number: 1,
        partition_id: PartitionId::from("2"),
        enqueued_time_utc: precise(1_700_000_000, 500_000_001),
        source_message_event_count: 1,
        messages: vec![vec![interaction, observation]],
    };
    let bytes = encode_joined_batch(&batch).unwrap();
    assert_eq!(decode_joined_batch(&bytes).unwrap(), batch);
}

#[test]
fn event_body_times_are_milliseconds() {
    let mut msg = test_message("e", PayloadType::Interaction, 0);
    msg.enqueued_time_utc = Utc.timestamp_opt(10, 123_456_789).single().unwrap();
    let decoded = decode_event_body(&encode_event_body(&[msg]).unwrap()).unwrap();
    assert_eq!(
        decoded.messages[0].enqueued_time_utc,
        Utc.timestamp_opt(10, 123_000_000).single().unwrap()
    );
}
