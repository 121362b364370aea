//! # Arbor
//!
//! An in-memory immutable object store with zero-copy sharing between
//! processes on the same host.
//!
//! A daemon (`arbord`) owns large shared-memory arenas; clients allocate
//! *blobs* inside them, write their bytes through a direct mapping, and
//! *seal* them. Sealed blobs are immutable and can be mapped read-only by
//! any number of local readers — sharing is a matter of passing an arena
//! fd over the IPC socket, never of copying bytes. Remote hosts reach the
//! same store over TCP, where blob contents travel inline on the control
//! channel.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use arbor::client::Client;
//!
//! let client = Client::connect("/var/run/arbor.sock")?;
//!
//! // allocate, fill, seal
//! let mut writer = client.create_buffer(1 << 20)?;
//! writer.as_mut_slice().fill(42);
//! let id = writer.id();
//! client.seal(id)?;
//!
//! // any local process maps the same bytes, zero-copy
//! let buffers = client.get_buffers(&[id])?;
//! assert_eq!(buffers[&id].as_slice()[0], 42);
//! ```
//!
//! ## Layout
//!
//! - [`memory`]: arenas, the payload allocator, fd passing
//! - [`protocol`]: the framed JSON wire protocol
//! - [`server`]: the daemon — bulk stores, sessions, connection handlers
//! - [`client`]: the IPC, plasma and RPC client libraries
//! - [`config`]: the daemon's configuration surface

#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod server;

pub use error::{Error, Result};
pub use memory::{ObjectID, Payload, PlasmaID, PlasmaPayload, SessionID};
