//! Wire frame carrying one opcode-addressed message.
//!
//! ```text
//! [Length(4, BE)] [Flags(1)] [Payload(N)]
//! Payload (plain):  [Opcode(1)] [Body(N-1)]
//! Payload (sealed): cipher envelope around [Opcode(1)] [Body(N-1)]
//! ```
//!
//! `Length` counts the flags byte plus the payload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::MAX_FRAME_SIZE;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::opcode::Opcode;

/// Length prefix plus flags byte.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Payload is sealed by the peer's frame cipher.
pub const FLAG_SEALED: u8 = 0b0000_0001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Plain frame for `opcode` with an encoded message body.
    pub fn plain(opcode: Opcode, body: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(1 + body.len());
        payload.put_u8(opcode);
        payload.extend_from_slice(body);
        Self {
            flags: 0,
            payload: payload.freeze(),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.flags & FLAG_SEALED != 0
    }

    /// Length as written in the header.
    pub fn wire_len(&self) -> usize {
        1 + self.payload.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.wire_len());
        out.extend_from_slice(&(self.wire_len() as u32).to_be_bytes());
        out.push(self.flags);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a single complete frame from `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::Decode(format!(
                "Frame header needs {FRAME_HEADER_SIZE} bytes, got {}",
                data.len()
            )));
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::OversizedFrame(len));
        }
        if len == 0 || data.len() < 4 + len {
            return Err(ProtocolError::Decode(format!(
                "Frame claims {len} bytes, buffer holds {}",
                data.len() - 4
            )));
        }
        Ok(Self {
            flags: data[4],
            payload: Bytes::copy_from_slice(&data[FRAME_HEADER_SIZE..4 + len]),
        })
    }
}

/// Seals and opens frame payloads once a peer has agreed on a key.
///
/// `open(seal(p)) == p` must hold, and `open` must fail on anything not
/// produced by the matching `seal`.
pub trait FrameCipher: Send + Sync {
    fn seal(&self, payload: &[u8]) -> Result<Vec<u8>>;
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>>;
}

/// Split a plain payload into its opcode and body.
pub fn split_opcode(mut payload: Bytes) -> Result<(Opcode, Bytes)> {
    if payload.is_empty() {
        return Err(ProtocolError::Decode(constants::ERR_EMPTY_FRAME.into()));
    }
    let body = payload.split_off(1);
    Ok((payload[0], body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_plain_frame_layout() {
        let frame = Frame::plain(3, b"abc");
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[..4], &5u32.to_be_bytes());
        assert_eq!(bytes[4], 0);
        assert_eq!(bytes[5], 3);
        assert_eq!(&bytes[6..], b"abc");

        let parsed = Frame::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, frame);
        let (opcode, body) = split_opcode(parsed.payload).unwrap();
        assert_eq!(opcode, 3);
        assert_eq!(&body[..], b"abc");
    }

    #[test]
    fn test_zero_length_rejected() {
        let bytes = [0, 0, 0, 0, 0];
        assert!(Frame::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_oversized_claim_rejected() {
        let mut bytes = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec();
        bytes.push(0);
        assert!(matches!(
            Frame::from_bytes(&bytes),
            Err(ProtocolError::OversizedFrame(_))
        ));
    }

    #[test]
    fn test_empty_payload_has_no_opcode() {
        assert!(split_opcode(Bytes::new()).is_err());
    }

    #[test]
    fn test_sealed_flag() {
        let mut frame = Frame::plain(1, &[]);
        assert!(!frame.is_sealed());
        frame.flags |= FLAG_SEALED;
        assert!(frame.is_sealed());
    }
}
