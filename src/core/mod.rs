//! # Core Wire Components
//!
//! Low-level frame handling, stream codec and field serialization.
//!
//! ## Components
//! - **Payload**: `Writer`/`Reader` pair for message bodies
//! - **Frame**: one opcode-addressed unit on the wire
//! - **Codec**: Tokio codec framing a byte stream into frames
//!
//! ## Wire Format
//! ```text
//! [Length(4)] [Flags(1)] [Opcode(1)] [Body(N)]
//! ```
//!
//! ## Security
//! - Maximum frame size: 16MB by default (prevents memory exhaustion)
//! - Length validation before allocation
//! - Every read is bounds-checked; malformed input yields an error, never a panic

pub mod codec;
pub mod frame;
pub mod payload;
