//! Fixed 8 byte header in front of every transport payload.
//!
//! Layout, big endian:
//!
//! ```text
//! [reserved: u8][version: u8][message type: u16][message size: u32]
//! ```

use crate::errors::CodecError;

pub const PREAMBLE_LEN: usize = 8;

/// Message types understood by this reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    EventBatch,
}

impl MessageType {
    fn from_wire(value: u16) -> Result<Self, CodecError> {
        match value {
            1 => Ok(Self::EventBatch),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }

    fn to_wire(self) -> u16 {
        match self {
            Self::EventBatch => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub message_type: MessageType,
    pub message_size: u32,
}

impl Preamble {
    pub fn read(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < PREAMBLE_LEN {
            return Err(CodecError::ShortPreamble(bytes.len()));
        }
        let reserved = bytes[0];
        let version = bytes[1];
        if reserved != 0 || version != 0 {
            return Err(CodecError::UnsupportedPreamble { reserved, version });
        }
        let message_type = MessageType::from_wire(u16::from_be_bytes([bytes[2], bytes[3]]))?;
        let message_size = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self {
            message_type,
            message_size,
        })
    }

    pub fn to_bytes(&self) -> [u8; PREAMBLE_LEN] {
        let mut out = [0u8; PREAMBLE_LEN];
        out[2..4].copy_from_slice(&self.message_type.to_wire().to_be_bytes());
        out[4..8].copy_from_slice(&self.message_size.to_be_bytes());
        out
    }
}

/// Split a transport payload into its preamble and body.
pub fn split_message(bytes: &[u8]) -> Result<(Preamble, &[u8]), CodecError> {
    let preamble = Preamble::read(bytes)?;
    let body = &bytes[PREAMBLE_LEN..];
    let declared = preamble.message_size as usize;
    if body.len() != declared {
        return Err(CodecError::BodySizeMismatch {
            declared,
            actual: body.len(),
        });
    }
    Ok((preamble, body))
}

#[test]
fn preamble_layout_is_big_endian() {
    let preamble = Preamble {
        message_type: MessageType::EventBatch,
        message_size: 0x0102_0304,
    };
    assert_eq!(preamble.to_bytes(), [0, 0, 0, 1, 1, 2, 3, 4]);
    assert_eq!(Preamble::read(&preamble.to_bytes()).unwrap(), preamble);
}

#[test]
fn preamble_rejects_bad_headers() {
    assert!(matches!(
        Preamble::read(&[0, 0, 0]),
        Err(CodecError::ShortPreamble(3))
    ));
    assert!(matches!(
        Preamble::read(&[0, 1, 0, 1, 0, 0, 0, 0]),
        Err(CodecError::UnsupportedPreamble {
            reserved: 0,
            version: 1
        })
    ));
    assert!(matches!(
        Preamble::read(&[0, 0, 0, 9, 0, 0, 0, 0]),
        Err(CodecError::UnknownMessageType(9))
    ));
}

#[test]
fn split_message_checks_size() {
    let mut bytes = Preamble {
        message_type: MessageType::EventBatch,
        message_size: 3,
    }
    .to_bytes()
    .to_vec();
    bytes.extend_from_slice(b"abc");
    let (_, body) = split_message(&bytes).unwrap();
    assert_eq!(body, b"abc");

    bytes.push(b'd');
    assert!(matches!(
        split_message(&bytes),
        Err(CodecError::BodySizeMismatch {
            declared: 3,
            actual: 4
        })
    ));
}
