//! The arbor daemon: bulk stores, sessions, and the IPC/RPC control plane.
//!
//! # Architecture
//!
//! ```text
//!                 ┌─────────────────────────────┐
//!                 │           Runner            │
//!                 │  root session + children    │
//!                 └──────┬───────────┬──────────┘
//!                        │           │
//!                  ┌─────┴────┐ ┌────┴─────┐
//!                  │ Session  │ │ Session  │   one bulk store and one
//!                  │ (root)   │ │ (child)  │   Unix socket per session
//!                  └────┬─────┘ └──────────┘
//!                       │ accept
//!              ┌────────┴────────┐
//!              │ SocketConnection│  read → dispatch → write,
//!              │  (one thread)   │  fds as ancillary messages
//!              └─────────────────┘
//! ```

pub mod bulk;
pub mod connection;
pub mod meta;
pub mod metrics;
pub mod session;
pub mod socket;
pub mod stream;

pub use bulk::{BulkStore, PlasmaStore};
pub use meta::MetaService;
pub use session::{Runner, Session};
pub use stream::StreamStore;
