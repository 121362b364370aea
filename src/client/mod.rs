//! Client libraries: the zero-copy IPC client, the plasma flavour, and
//! the copy-based RPC client for remote hosts.

mod base;
mod client;
mod plasma;
mod rpc;
mod shm;
mod usage;

pub use client::{Buffer, BufferWriter, Client};
pub use plasma::{PlasmaBufferWriter, PlasmaClient};
pub use rpc::RpcClient;
pub use shm::SharedMemoryManager;
pub use usage::{TrackedPayload, UsageAction, UsageTracker};

use crate::config::DEFAULT_IPC_SOCKET;
use crate::error::Result;
use once_cell::sync::OnceCell;
use std::sync::Arc;

static DEFAULT_CLIENT: OnceCell<Arc<Client>> = OnceCell::new();

/// The process-wide default client, connected lazily on first access.
///
/// The socket path comes from `ARBOR_IPC_SOCKET`, falling back to the
/// daemon's default. Library-style users that manage their own clients
/// never touch this.
pub fn default_client() -> Result<Arc<Client>> {
    DEFAULT_CLIENT
        .get_or_try_init(|| {
            let path = std::env::var("ARBOR_IPC_SOCKET")
                .unwrap_or_else(|_| DEFAULT_IPC_SOCKET.to_owned());
            Client::connect(path).map(Arc::new)
        })
        .cloned()
}
