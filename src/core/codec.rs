//! Tokio codec that frames a byte stream into [`Frame`]s.
//!
//! Decoding is zero-copy: a complete frame is split off the read buffer and
//! frozen. Partial frames leave the buffer untouched. A header that claims more
//! than `max_frame_size` bytes is rejected before any allocation.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_FRAME_SIZE;
use crate::core::frame::{Frame, FRAME_HEADER_SIZE};
use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_size {
            return Err(ProtocolError::OversizedFrame(len));
        }
        if len == 0 {
            return Err(ProtocolError::Decode("Frame length is zero".into()));
        }

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut body = src.split_to(len);
        let flags = body.get_u8();
        Ok(Some(Frame {
            flags,
            payload: body.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let len = frame.wire_len();
        if len > self.max_frame_size {
            return Err(ProtocolError::OversizedFrame(len));
        }
        dst.reserve(FRAME_HEADER_SIZE + frame.payload.len());
        dst.put_u32(len as u32);
        dst.put_u8(frame.flags);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
