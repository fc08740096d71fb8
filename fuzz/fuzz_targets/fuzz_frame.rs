#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use peer_protocol::core::codec::FrameCodec;
use peer_protocol::core::frame::{split_opcode, Frame};
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Whole-buffer parse
    if let Ok(frame) = Frame::from_bytes(data) {
        let _ = split_opcode(frame.payload);
    }

    // Streaming parse with a small limit
    let mut codec = FrameCodec::new(4096);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(frame)) = codec.decode(&mut buf) {
        let _ = split_opcode(frame.payload);
    }
});
