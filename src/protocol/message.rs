//! # Messages
//!
//! The contract every wire message implements, plus helpers for recovering the
//! concrete type from a decoded `Box<dyn Message>`.
//!
//! A message writes its own body with [`Writer`](crate::core::payload::Writer)
//! and reads it back with [`Reader`]. The opcode is not part of the body; it is
//! assigned by the [opcode registry](crate::protocol::opcode).
//!
//! ```rust
//! use peer_protocol::core::payload::{Reader, Writer};
//! use peer_protocol::error::Result;
//! use peer_protocol::protocol::message::Message;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Chat {
//!     text: String,
//! }
//!
//! impl Message for Chat {
//!     fn write(&self) -> Vec<u8> {
//!         Writer::new().write_string(&self.text).into_bytes()
//!     }
//!
//!     fn read(reader: &mut Reader<'_>) -> Result<Self> {
//!         Ok(Self { text: reader.read_string()? })
//!     }
//! }
//! ```

use std::any::Any;
use std::fmt;

use crate::core::payload::Reader;
use crate::error::{ProtocolError, Result};

/// Type-erasure support for [`Message`]. Implemented for every sized type.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Any + Send> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// A typed value that can serialize and deserialize its own body.
pub trait Message: AsAny + Send + Sync + fmt::Debug + 'static {
    /// Encode the message body.
    fn write(&self) -> Vec<u8>;

    /// Decode a message body. Must fail, not panic, on malformed input.
    fn read(reader: &mut Reader<'_>) -> Result<Self>
    where
        Self: Sized;
}

impl dyn Message {
    pub fn is<M: Message>(&self) -> bool {
        self.as_any().is::<M>()
    }

    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.as_any().downcast_ref::<M>()
    }
}

/// Recover the concrete message from a decoded box.
pub fn downcast<M: Message>(message: Box<dyn Message>) -> Result<M> {
    let any: Box<dyn Any + Send> = message.into_any();
    any.downcast::<M>()
        .map(|boxed| *boxed)
        .map_err(|_| ProtocolError::UnexpectedMessage)
}

/// A message without a body, useful for signals and acknowledgements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmptyMessage;

impl Message for EmptyMessage {
    fn write(&self) -> Vec<u8> {
        Vec::new()
    }

    fn read(_reader: &mut Reader<'_>) -> Result<Self> {
        Ok(EmptyMessage)
    }
}
