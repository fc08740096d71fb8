//! # Protocol Layer
//!
//! Messages, their opcodes, and the pipeline of blocks every peer runs through.
//!
//! ## Components
//! - **Message**: the encode/decode contract of a wire message
//! - **Opcode**: process-wide registry from opcode to decoder
//! - **Block**: one stage of per-connection setup and teardown
//! - **Pipeline**: the ordered blocks enforced on a node
//! - **Handshake**: X25519 key agreement block
//! - **Secure**: XChaCha20-Poly1305 encryption block
//!
//! ## Ordering
//! Blocks run in registration order, so a deployment registers key agreement
//! before encryption before anything that trusts the remote.

pub mod block;
pub mod handshake;
pub mod message;
pub mod opcode;
pub mod pipeline;
pub mod secure;
