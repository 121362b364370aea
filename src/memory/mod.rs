//! Shared-memory management for arbor.
//!
//! This module owns everything below the bulk store: mmap-backed arenas,
//! the payload allocator that carves them, the payload descriptors shared
//! between server and clients, and the `SCM_RIGHTS` plumbing that moves
//! arena fds across process boundaries.

mod allocator;
mod arena;
pub mod fdpass;
mod payload;

pub use allocator::{Allocation, AllocatorKind, ArenaAllocator};
pub use arena::{Arena, ArenaKind};
pub use payload::{
    InstanceID, ObjectID, Payload, PlasmaID, PlasmaPayload, SessionID, ROOT_SESSION_ID,
    session_id_to_string,
};
