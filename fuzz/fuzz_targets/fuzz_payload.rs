#![no_main]

use libfuzzer_sys::fuzz_target;
use peer_protocol::core::payload::Reader;
use peer_protocol::protocol::handshake::{HandshakeHello, HandshakeProof};
use peer_protocol::protocol::opcode::decode_message;
use peer_protocol::Message;

fuzz_target!(|data: &[u8]| {
    let _ = HandshakeHello::read(&mut Reader::new(data));
    let _ = HandshakeProof::read(&mut Reader::new(data));

    // Mixed field reads must fail cleanly on short or malformed input
    let mut reader = Reader::new(data);
    let _ = reader.read_u16();
    let _ = reader.read_string();
    let _ = reader.read_bool();
    while reader.read_bytes().is_ok() {}

    if let Some((&opcode, body)) = data.split_first() {
        let _ = decode_message(opcode, body);
    }
});
