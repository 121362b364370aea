//! The RPC client.
//!
//! Remote hosts reach the store over TCP. The control channel speaks the
//! same framed JSON protocol, but no ancillary data exists: blob bytes
//! travel inline on the socket, immediately after the reply that
//! describes them. Remote access is always a copy.

use super::base::ClientBase;
use crate::error::Result;
use crate::memory::{InstanceID, ObjectID, Payload, SessionID};
use crate::protocol::{self, StoreType};
use parking_lot::Mutex;

/// A client of the root session's TCP endpoint.
pub struct RpcClient {
    inner: Mutex<ClientBase>,
}

impl RpcClient {
    /// Connect to `host:port` and register.
    pub fn connect(endpoint: &str) -> Result<RpcClient> {
        let base = ClientBase::connect_tcp(endpoint, StoreType::Default)?;
        Ok(RpcClient {
            inner: Mutex::new(base),
        })
    }

    pub fn instance_id(&self) -> InstanceID {
        self.inner.lock().instance_id
    }

    pub fn session_id(&self) -> SessionID {
        self.inner.lock().session_id
    }

    /// The IPC socket path announced by the server, for co-located
    /// clients that can upgrade to zero-copy access.
    pub fn ipc_socket(&self) -> String {
        self.inner.lock().ipc_socket.clone()
    }

    pub fn connected(&self) -> bool {
        self.inner.lock().connected()
    }

    /// Create and seal a blob on the server, streaming `bytes` after the
    /// request. Returns the new blob id.
    pub fn create_remote_buffer(&self, bytes: &[u8]) -> Result<ObjectID> {
        let mut base = self.inner.lock();
        base.send_only(&protocol::write_create_remote_buffer_request(bytes.len()))?;
        if !bytes.is_empty() {
            base.write_raw(bytes)?;
        }
        let root = base.recv_reply()?;
        let (id, _payload, _fd) = protocol::read_create_buffer_reply(&root)?;
        Ok(id)
    }

    /// Fetch sealed blobs by copy. The reply is followed by each
    /// payload's bytes back-to-back, in payload-list order; zero-sized
    /// payloads contribute nothing.
    pub fn get_remote_buffers(&self, ids: &[ObjectID]) -> Result<Vec<(Payload, Vec<u8>)>> {
        let mut base = self.inner.lock();
        let root = base.do_request(&protocol::write_get_remote_buffers_request(ids, false))?;
        let (payloads, _fds) = protocol::read_get_buffers_reply(&root)?;

        let mut buffers = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let mut bytes = vec![0u8; payload.data_size];
            if payload.data_size > 0 {
                base.read_raw(&mut bytes)?;
            }
            buffers.push((payload, bytes));
        }
        Ok(buffers)
    }

    /// Delete a blob on the server, ignoring reference counts.
    pub fn drop_buffer(&self, id: ObjectID) -> Result<()> {
        let mut base = self.inner.lock();
        let root = base.do_request(&protocol::write_drop_buffer_request(id))?;
        protocol::read_drop_buffer_reply(&root)
    }

    pub fn instance_status(&self) -> Result<serde_json::Value> {
        let mut base = self.inner.lock();
        let root = base.do_request(&protocol::write_instance_status_request())?;
        protocol::read_instance_status_reply(&root)
    }

    pub fn disconnect(&self) {
        self.inner.lock().disconnect();
    }
}
