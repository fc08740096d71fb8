//! # Network Runtime
//!
//! Nodes and the peers they manage.
//!
//! ## Concurrency
//! - One accept loop per listening node
//! - One read loop and one send worker per peer
//! - Bounded channels between all of them; no state is shared between peers
//!   except the node's registry, which sits behind its own lock

pub mod node;
pub mod peer;
