//! # Opcode Registry
//!
//! Maps small integer opcodes to message decoders.
//!
//! Registration builds the wire contract of a deployment and must finish before
//! any peer starts decoding traffic. After that the registry is only read, so it
//! sits behind a read-mostly lock.
//!
//! Opcode `0` ([`OPCODE_NIL`]) is reserved: passing it to [`register_message`]
//! asks the registry to pick the next free opcode.
//!
//! ```rust
//! use peer_protocol::protocol::message::EmptyMessage;
//! use peer_protocol::protocol::opcode::{OpcodeRegistry, OPCODE_NIL};
//!
//! let mut registry = OpcodeRegistry::new();
//! let opcode = registry.register::<EmptyMessage>(OPCODE_NIL).unwrap();
//! assert_eq!(opcode, 1);
//! // Registering the same type again returns the same opcode.
//! assert_eq!(registry.register::<EmptyMessage>(OPCODE_NIL).unwrap(), opcode);
//! ```

use once_cell::sync::Lazy;
use std::any::{type_name, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use tracing::debug;

use crate::core::payload::Reader;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::Message;

/// Wire identifier of a message type.
pub type Opcode = u8;

/// Reserved opcode meaning "unassigned".
pub const OPCODE_NIL: Opcode = 0;

/// Decode routine for one registered message type.
pub type DecodeFn = fn(&mut Reader<'_>) -> Result<Box<dyn Message>>;

fn decode_boxed<M: Message>(reader: &mut Reader<'_>) -> Result<Box<dyn Message>> {
    Ok(Box::new(M::read(reader)?))
}

#[derive(Clone, Copy)]
struct Entry {
    type_id: TypeId,
    name: &'static str,
    decode: DecodeFn,
}

/// Opcode table. Most code uses the process-wide instance through the free
/// functions of this module.
#[derive(Default)]
pub struct OpcodeRegistry {
    by_opcode: BTreeMap<Opcode, Entry>,
    by_type: HashMap<TypeId, Opcode>,
}

impl OpcodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `opcode` to `M`, or the next free opcode when `opcode` is [`OPCODE_NIL`].
    ///
    /// Registering `M` again with `OPCODE_NIL` or with its own opcode returns the
    /// existing opcode.
    ///
    /// # Errors
    /// - `DuplicateOpcode` if `opcode` is bound to another type
    /// - `DuplicateMessage` if `M` is bound to a different explicit opcode
    /// - `OpcodeExhausted` if no opcode is left to assign
    pub fn register<M: Message>(&mut self, opcode: Opcode) -> Result<Opcode> {
        let type_id = TypeId::of::<M>();
        let name = type_name::<M>();

        if let Some(&existing) = self.by_type.get(&type_id) {
            if opcode == OPCODE_NIL || opcode == existing {
                return Ok(existing);
            }
            return Err(ProtocolError::DuplicateMessage {
                message: name,
                opcode: existing,
            });
        }

        let opcode = if opcode == OPCODE_NIL {
            self.next_available().ok_or(ProtocolError::OpcodeExhausted)?
        } else {
            opcode
        };

        if let Some(entry) = self.by_opcode.get(&opcode) {
            return Err(ProtocolError::DuplicateOpcode {
                opcode,
                existing: entry.name,
            });
        }

        self.by_opcode.insert(
            opcode,
            Entry {
                type_id,
                name,
                decode: decode_boxed::<M>,
            },
        );
        self.by_type.insert(type_id, opcode);
        debug!(opcode, message = name, "Registered message");
        Ok(opcode)
    }

    /// The opcode the next automatic registration would take.
    ///
    /// Follows the highest bound opcode; once `u8::MAX` is taken, the lowest gap
    /// is reused.
    pub fn next_available(&self) -> Option<Opcode> {
        match self.by_opcode.keys().next_back() {
            None => Some(OPCODE_NIL + 1),
            Some(&highest) if highest < Opcode::MAX => Some(highest + 1),
            Some(_) => (OPCODE_NIL + 1..=Opcode::MAX).find(|o| !self.by_opcode.contains_key(o)),
        }
    }

    pub fn decoder(&self, opcode: Opcode) -> Option<DecodeFn> {
        self.by_opcode.get(&opcode).map(|e| e.decode)
    }

    pub fn opcode_of<M: Message>(&self) -> Option<Opcode> {
        self.by_type.get(&TypeId::of::<M>()).copied()
    }

    /// Type name bound to `opcode`, for diagnostics.
    pub fn name_of(&self, opcode: Opcode) -> Option<&'static str> {
        self.by_opcode.get(&opcode).map(|e| e.name)
    }

    /// Decode a body received under `opcode`.
    pub fn decode(&self, opcode: Opcode, body: &[u8]) -> Result<Box<dyn Message>> {
        let decode = self
            .decoder(opcode)
            .ok_or(ProtocolError::UnknownOpcode(opcode))?;
        decode(&mut Reader::new(body))
    }

    /// Whether `opcode` is bound to `M`.
    pub fn is_bound_to<M: Message>(&self, opcode: Opcode) -> bool {
        self.by_opcode
            .get(&opcode)
            .is_some_and(|e| e.type_id == TypeId::of::<M>())
    }

    pub fn len(&self) -> usize {
        self.by_opcode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_opcode.is_empty()
    }
}

static REGISTRY: Lazy<RwLock<OpcodeRegistry>> = Lazy::new(|| RwLock::new(OpcodeRegistry::new()));

/// Register `M` in the process-wide registry. See [`OpcodeRegistry::register`].
pub fn register_message<M: Message>(opcode: Opcode) -> Result<Opcode> {
    REGISTRY
        .write()
        .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_WRITE_LOCK.into()))?
        .register::<M>(opcode)
}

/// Next opcode an automatic registration would take, or [`OPCODE_NIL`] when
/// every opcode is bound. Not itself a reservation.
pub fn next_available_opcode() -> Opcode {
    REGISTRY
        .read()
        .ok()
        .and_then(|r| r.next_available())
        .unwrap_or(OPCODE_NIL)
}

/// Decoder bound to `opcode` in the process-wide registry.
pub fn message_from_opcode(opcode: Opcode) -> Option<DecodeFn> {
    REGISTRY.read().ok().and_then(|r| r.decoder(opcode))
}

/// Opcode `M` is registered under in the process-wide registry.
pub fn opcode_of<M: Message>() -> Option<Opcode> {
    REGISTRY.read().ok().and_then(|r| r.opcode_of::<M>())
}

/// Opcode for `M`, or an error naming the unregistered type.
pub fn require_opcode<M: Message>() -> Result<Opcode> {
    opcode_of::<M>().ok_or(ProtocolError::UnregisteredMessage(type_name::<M>()))
}

/// Decode a frame body using the process-wide registry.
pub fn decode_message(opcode: Opcode, body: &[u8]) -> Result<Box<dyn Message>> {
    let decode = REGISTRY
        .read()
        .map_err(|_| ProtocolError::Custom(constants::ERR_REGISTRY_READ_LOCK.into()))?
        .decoder(opcode)
        .ok_or(ProtocolError::UnknownOpcode(opcode))?;
    decode(&mut Reader::new(body))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::core::payload::Writer;
    use crate::protocol::message::EmptyMessage;

    #[derive(Debug, PartialEq)]
    struct Alpha(u32);

    impl Message for Alpha {
        fn write(&self) -> Vec<u8> {
            Writer::new().write_u32(self.0).into_bytes()
        }

        fn read(reader: &mut Reader<'_>) -> Result<Self> {
            Ok(Self(reader.read_u32()?))
        }
    }

    #[derive(Debug)]
    struct Beta;

    impl Message for Beta {
        fn write(&self) -> Vec<u8> {
            Vec::new()
        }

        fn read(_reader: &mut Reader<'_>) -> Result<Self> {
            Ok(Beta)
        }
    }

    #[test]
    fn test_automatic_assignment_is_monotonic() {
        let mut registry = OpcodeRegistry::new();
        assert_eq!(registry.next_available(), Some(1));
        assert_eq!(registry.register::<Alpha>(OPCODE_NIL).unwrap(), 1);
        assert_eq!(registry.register::<Beta>(OPCODE_NIL).unwrap(), 2);
        assert_eq!(registry.next_available(), Some(3));
    }

    #[test]
    fn test_next_available_is_not_a_reservation() {
        let registry = OpcodeRegistry::new();
        assert_eq!(registry.next_available(), registry.next_available());
    }

    #[test]
    fn test_explicit_opcode_conflict() {
        let mut registry = OpcodeRegistry::new();
        registry.register::<Alpha>(10).unwrap();
        let err = registry.register::<Beta>(10).unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateOpcode { opcode: 10, .. }));
        // The failed registration left nothing behind.
        assert_eq!(registry.opcode_of::<Beta>(), None);
    }

    #[test]
    fn test_same_type_is_idempotent() {
        let mut registry = OpcodeRegistry::new();
        let first = registry.register::<Alpha>(OPCODE_NIL).unwrap();
        assert_eq!(registry.register::<Alpha>(OPCODE_NIL).unwrap(), first);
        assert_eq!(registry.register::<Alpha>(first).unwrap(), first);
        assert!(matches!(
            registry.register::<Alpha>(first + 5),
            Err(ProtocolError::DuplicateMessage { .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_gap_reuse_after_max() {
        let mut registry = OpcodeRegistry::new();
        registry.register::<Alpha>(Opcode::MAX).unwrap();
        assert_eq!(registry.next_available(), Some(1));
        registry.register::<Beta>(OPCODE_NIL).unwrap();
        assert_eq!(registry.next_available(), Some(2));
    }

    #[test]
    fn test_decode_dispatch() {
        let mut registry = OpcodeRegistry::new();
        let op = registry.register::<Alpha>(OPCODE_NIL).unwrap();
        let msg = registry.decode(op, &Alpha(99).write()).unwrap();
        assert_eq!(msg.downcast_ref::<Alpha>(), Some(&Alpha(99)));
        assert!(registry.is_bound_to::<Alpha>(op));
        assert!(!registry.is_bound_to::<Beta>(op));

        assert!(matches!(
            registry.decode(op + 1, &[]),
            Err(ProtocolError::UnknownOpcode(_))
        ));
        assert!(registry.decode(op, b"ab").is_err());
    }

    #[test]
    fn test_global_registry_functions() {
        let op = register_message::<EmptyMessage>(OPCODE_NIL).unwrap();
        assert_ne!(op, OPCODE_NIL);
        assert_eq!(opcode_of::<EmptyMessage>(), Some(op));
        assert!(message_from_opcode(op).is_some());
        assert_eq!(register_message::<EmptyMessage>(OPCODE_NIL).unwrap(), op);
        assert!(decode_message(op, &[]).unwrap().is::<EmptyMessage>());
    }
}
