//! # Error Types
//!
//! Error handling for the peer runtime.
//!
//! This module defines every error variant that can surface from the node, its
//! peers, the opcode registry and the protocol pipeline.
//!
//! ## Error Categories
//! - **I/O Errors**: transport failures while accepting, dialing, reading or writing
//! - **Decode Errors**: malformed frames or message bodies; terminal for one peer only
//! - **Timeouts**: receive-wait, send-wait and send-queue-busy
//! - **Pipeline Rejection**: [`ProtocolError::DisconnectPeer`], a routine refusal of a peer
//! - **Registry Conflicts**: duplicate opcodes, messages or blocks; raised at startup
//!
//! ## Example Usage
//! ```rust
//! use peer_protocol::error::{ProtocolError, Result};
//!
//! fn check_key(key: Option<&[u8]>) -> Result<()> {
//!     match key {
//!         Some(k) if k.len() == 32 => Ok(()),
//!         _ => Err(ProtocolError::DisconnectPeer),
//!     }
//! }
//!
//! assert!(check_key(None).unwrap_err().is_disconnect());
//! ```

use crate::protocol::opcode::Opcode;
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Registry-related error messages
    pub const ERR_REGISTRY_WRITE_LOCK: &str = "Failed to acquire write lock on opcode registry";
    pub const ERR_REGISTRY_READ_LOCK: &str = "Failed to acquire read lock on opcode registry";

    /// Decode errors
    pub const ERR_UNEXPECTED_EOF: &str = "Unexpected end of payload";
    pub const ERR_LENGTH_OVERFLOW: &str = "Length prefix exceeds remaining payload";
    pub const ERR_INVALID_UTF8: &str = "String field is not valid UTF-8";
    pub const ERR_EMPTY_FRAME: &str = "Frame carries no opcode";
    pub const ERR_SEALED_WITHOUT_CIPHER: &str = "Sealed frame received but no cipher is installed";
    pub const ERR_PLAIN_AFTER_CIPHER: &str = "Plain frame received after a cipher was installed";

    /// Connection errors
    pub const ERR_NODE_KILLED: &str = "Node has been killed";
    pub const ERR_LISTENER_TAKEN: &str = "Listener is already running or was closed";
    pub const ERR_PROTOCOL_ENFORCED: &str = "A protocol is already enforced on this node";
    pub const ERR_PEER_LIMIT: &str = "Peer limit reached";

    /// Handshake-specific errors
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";
    pub const ERR_INVALID_TIMESTAMP: &str = "Invalid or stale timestamp";
    pub const ERR_MISSING_SHARED_KEY: &str = "Peer has no shared key";
    pub const ERR_AUTH_ATTRIBUTE_TYPE: &str =
        "Authentication attribute is set to a value of another type";
}

/// ProtocolError is the primary error type for all runtime operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unknown opcode: {0}")]
    UnknownOpcode(Opcode),

    #[error("Opcode {opcode} is already bound to {existing}")]
    DuplicateOpcode {
        opcode: Opcode,
        existing: &'static str,
    },

    #[error("Message type {message} is already bound to opcode {opcode}")]
    DuplicateMessage {
        message: &'static str,
        opcode: Opcode,
    },

    #[error("No opcodes left to assign")]
    OpcodeExhausted,

    #[error("Message type {0} is not registered")]
    UnregisteredMessage(&'static str),

    #[error("Block {0} is already registered")]
    DuplicateBlock(String),

    #[error("Peer disconnected by protocol")]
    DisconnectPeer,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Field too large for a u32 length prefix: {0} bytes")]
    OversizedField(usize),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Send queue is busy")]
    SendBusy,

    #[error("Unexpected message type")]
    UnexpectedMessage,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// True for the distinguished "reject this peer" signal.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ProtocolError::DisconnectPeer)
    }

    /// True for any of the timeout classes.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Timeout | ProtocolError::SendBusy)
    }

    /// True when the error means the peer is gone rather than misbehaving.
    pub fn is_closed(&self) -> bool {
        match self {
            ProtocolError::ConnectionClosed => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_predicate() {
        assert!(ProtocolError::DisconnectPeer.is_disconnect());
        assert!(!ProtocolError::Timeout.is_disconnect());
        assert!(!ProtocolError::Custom("boom".into()).is_disconnect());
    }

    #[test]
    fn test_timeout_predicate() {
        assert!(ProtocolError::Timeout.is_timeout());
        assert!(ProtocolError::SendBusy.is_timeout());
        assert!(!ProtocolError::ConnectionClosed.is_timeout());
    }

    #[test]
    fn test_closed_predicate() {
        assert!(ProtocolError::ConnectionClosed.is_closed());
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(ProtocolError::from(eof).is_closed());
        let other = io::Error::new(io::ErrorKind::InvalidData, "bad");
        assert!(!ProtocolError::from(other).is_closed());
    }

    #[test]
    fn test_display_messages() {
        let err = ProtocolError::DuplicateOpcode {
            opcode: 7,
            existing: "Ping",
        };
        assert_eq!(err.to_string(), "Opcode 7 is already bound to Ping");
        assert_eq!(ProtocolError::SendBusy.to_string(), "Send queue is busy");
    }
}
