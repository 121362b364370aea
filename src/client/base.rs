//! Connection bootstrap and framed request/reply plumbing shared by the
//! IPC and RPC clients.

use crate::error::{Error, Result};
use crate::memory::{InstanceID, SessionID};
use crate::protocol::{self, StoreType};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// The transport under a client.
#[derive(Debug)]
pub enum ServerConn {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Read for ServerConn {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ServerConn::Unix(stream) => stream.read(buf),
            ServerConn::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for ServerConn {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            ServerConn::Unix(stream) => stream.write(buf),
            ServerConn::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            ServerConn::Unix(stream) => stream.flush(),
            ServerConn::Tcp(stream) => stream.flush(),
        }
    }
}

/// State every client holds after the registration handshake.
#[derive(Debug)]
pub struct ClientBase {
    conn: ServerConn,
    connected: bool,
    pub instance_id: InstanceID,
    pub session_id: SessionID,
    pub server_version: String,
    pub ipc_socket: String,
    pub rpc_endpoint: String,
}

impl ClientBase {
    /// Connect over the Unix transport and register.
    pub fn connect_unix(path: &Path, store_type: StoreType) -> Result<ClientBase> {
        let stream = UnixStream::connect(path).map_err(|err| {
            Error::ConnectionFailed(format!("connect to {}: {err}", path.display()))
        })?;
        Self::register(ServerConn::Unix(stream), store_type)
    }

    /// Connect over the TCP transport and register.
    pub fn connect_tcp(endpoint: &str, store_type: StoreType) -> Result<ClientBase> {
        let stream = TcpStream::connect(endpoint)
            .map_err(|err| Error::ConnectionFailed(format!("connect to {endpoint}: {err}")))?;
        stream.set_nodelay(true)?;
        Self::register(ServerConn::Tcp(stream), store_type)
    }

    fn register(mut conn: ServerConn, store_type: StoreType) -> Result<ClientBase> {
        protocol::write_message(&mut conn, &protocol::write_register_request(store_type))?;
        let root = protocol::read_json_message(&mut conn)?;
        let reply = protocol::read_register_reply(&root)?;
        if !reply.store_match {
            // a mismatched store type means every buffer op would fail
            return Err(Error::Invalid(format!(
                "the server serves another bulk-store type, expected {}",
                store_type.as_str()
            )));
        }
        Ok(ClientBase {
            conn,
            connected: true,
            instance_id: reply.instance_id,
            session_id: reply.session_id,
            server_version: reply.version,
            ipc_socket: reply.ipc_socket,
            rpc_endpoint: reply.rpc_endpoint,
        })
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::ConnectionError("the client has disconnected".into()))
        }
    }

    /// One framed request/reply exchange. The reply may still carry an
    /// error envelope; the per-operation readers surface it.
    pub fn do_request(&mut self, body: &str) -> Result<Value> {
        self.ensure_connected()?;
        let outcome = (|| {
            protocol::write_message(&mut self.conn, body)?;
            protocol::read_json_message(&mut self.conn)
        })();
        if outcome.is_err() {
            self.connected = false;
        }
        outcome
    }

    /// Fire a request without waiting for a reply (`exit_request`, or
    /// requests followed by inline bulk bytes).
    pub fn send_only(&mut self, body: &str) -> Result<()> {
        self.ensure_connected()?;
        protocol::write_message(&mut self.conn, body)
    }

    /// Read the reply of a request sent with [`ClientBase::send_only`].
    pub fn recv_reply(&mut self) -> Result<Value> {
        self.ensure_connected()?;
        let outcome = protocol::read_json_message(&mut self.conn);
        if outcome.is_err() {
            self.connected = false;
        }
        outcome
    }

    /// Write raw bytes after a request (remote buffer contents).
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        self.conn.write_all(bytes)?;
        self.conn.flush()?;
        Ok(())
    }

    /// Read exactly `buf.len()` raw bytes following a reply.
    pub fn read_raw(&mut self, buf: &mut [u8]) -> Result<()> {
        self.ensure_connected()?;
        self.conn.read_exact(buf)?;
        Ok(())
    }

    /// The Unix socket, for ancillary fd receives. RPC connections have
    /// none.
    pub fn unix_socket(&self) -> Result<&UnixStream> {
        match &self.conn {
            ServerConn::Unix(stream) => Ok(stream),
            ServerConn::Tcp(_) => Err(Error::Invalid(
                "file descriptors cannot cross the RPC transport".into(),
            )),
        }
    }

    /// Best-effort exit notification; the server replies nothing.
    pub fn disconnect(&mut self) {
        if self.connected {
            let _ = self.send_only(&protocol::write_exit_request());
            self.connected = false;
        }
    }
}

impl Drop for ClientBase {
    fn drop(&mut self) {
        self.disconnect();
    }
}
