//! Object identifiers and payload descriptors.
//!
//! An [`ObjectID`] is an opaque 64-bit value. The top bit distinguishes
//! blob ids (raw byte ranges in shared memory) from composite ids
//! (metadata trees referencing blobs). Blob ids are generated from the
//! allocation's base address, so they are deterministic within one server
//! run and unique across live allocations.
//!
//! A [`PlasmaID`] is a caller-supplied content-addressable key that
//! coexists with [`ObjectID`] for compatibility; both index the same
//! payload shape.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bit that marks an id as a blob id.
const BLOB_BIT: u64 = 0x8000_0000_0000_0000;

/// An opaque 64-bit object identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ObjectID(pub u64);

impl ObjectID {
    /// The designated invalid id.
    pub const INVALID: ObjectID = ObjectID(u64::MAX);

    /// The reserved id of the zero-byte blob.
    pub const EMPTY_BLOB: ObjectID = ObjectID(BLOB_BIT);

    /// Generate a blob id from an allocation's base address.
    pub fn from_pointer(pointer: usize) -> ObjectID {
        ObjectID((pointer as u64 & !BLOB_BIT) | BLOB_BIT)
    }

    /// Whether this id denotes a blob (as opposed to a composite object).
    pub fn is_blob(&self) -> bool {
        self.0 & BLOB_BIT != 0 && *self != ObjectID::INVALID
    }

    /// Render as the canonical `o...` hex form.
    pub fn to_hex(&self) -> String {
        format!("o{:016x}", self.0)
    }

    /// Parse the canonical `o...` hex form.
    pub fn from_hex(repr: &str) -> Option<ObjectID> {
        let digits = repr.strip_prefix('o')?;
        u64::from_str_radix(digits, 16).ok().map(ObjectID)
    }
}

impl fmt::Display for ObjectID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A caller-supplied content-addressable key, parallel to [`ObjectID`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct PlasmaID(pub String);

impl PlasmaID {
    /// Wrap a caller-supplied key.
    pub fn new(key: impl Into<String>) -> PlasmaID {
        PlasmaID(key.into())
    }
}

impl fmt::Display for PlasmaID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a session served by the runner.
pub type SessionID = i64;

/// The reserved id of the root session.
pub const ROOT_SESSION_ID: SessionID = 0;

/// Render a session id as the canonical `s...` hex form used in socket
/// path suffixes.
pub fn session_id_to_string(id: SessionID) -> String {
    format!("s{:016x}", id as u64)
}

/// Identifier of a server instance within a deployment.
pub type InstanceID = u64;

/// Server-side descriptor of one allocation inside an arena.
///
/// The `pointer` field is the server's virtual address of the payload;
/// clients only ever use `pointer - data_offset` to recover the arena
/// base when registering their own mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Payload {
    /// Blob id of this payload.
    pub object_id: ObjectID,
    /// Bytes exposed to the user.
    pub data_size: usize,
    /// Integer handle of the backing arena, stable for the arena's lifetime.
    pub store_fd: i32,
    /// Arena size at the time of allocation.
    pub map_size: usize,
    /// Payload start within the arena mapping, in bytes.
    pub data_offset: usize,
    /// Server-side virtual address of the payload.
    pub pointer: u64,
    /// Set once by `Seal`; never cleared afterwards.
    pub is_sealed: bool,
    /// Whether the bytes currently live in a spill file instead of memory.
    pub is_spilled: bool,
    /// Server-side reference count across all connections.
    pub ref_cnt: i64,
}

impl Payload {
    /// Descriptor of a freshly carved, unsealed allocation.
    pub fn new(
        object_id: ObjectID,
        data_size: usize,
        pointer: usize,
        store_fd: i32,
        map_size: usize,
        data_offset: usize,
    ) -> Payload {
        Payload {
            object_id,
            data_size,
            store_fd,
            map_size,
            data_offset,
            pointer: pointer as u64,
            is_sealed: false,
            is_spilled: false,
            ref_cnt: 0,
        }
    }

    /// The descriptor of the reserved zero-byte blob.
    pub fn make_empty() -> Payload {
        Payload {
            object_id: ObjectID::EMPTY_BLOB,
            is_sealed: true,
            ..Payload::default()
        }
    }

    /// Reset the sharing state, keeping only the location of the bytes.
    /// Used when a payload is re-indexed under another session.
    pub fn reset(&mut self) {
        self.ref_cnt = 0;
        self.is_spilled = false;
    }
}

/// Payload variant indexed by a caller-supplied [`PlasmaID`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PlasmaPayload {
    /// The caller-supplied content-addressable key.
    pub plasma_id: PlasmaID,
    /// The size claimed by the caller's own accounting.
    pub plasma_size: usize,
    /// The underlying payload shape, shared with [`Payload`].
    #[serde(flatten)]
    pub base: Payload,
}

impl PlasmaPayload {
    /// Descriptor of a freshly carved, unsealed plasma allocation.
    pub fn new(plasma_id: PlasmaID, plasma_size: usize, base: Payload) -> PlasmaPayload {
        PlasmaPayload {
            plasma_id,
            plasma_size,
            base,
        }
    }

    /// The descriptor of the reserved zero-byte blob.
    pub fn make_empty() -> PlasmaPayload {
        PlasmaPayload {
            plasma_id: PlasmaID::default(),
            plasma_size: 0,
            base: Payload::make_empty(),
        }
    }
}
