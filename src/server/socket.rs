//! Socket acceptors.
//!
//! Each session listens on its own Unix socket; the root session may
//! additionally host the TCP (RPC) endpoint. Every accepted connection
//! runs its own sequential read → dispatch → write loop on a dedicated
//! thread.

use super::connection::{ClientStream, SocketConnection};
use super::session::{Runner, Session};
use crate::error::Result;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Monotonic connection ids across all sessions.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

/// One acceptor loop bound to a Unix path or TCP address.
pub struct SocketServer {
    endpoint: Endpoint,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SocketServer {
    /// Bind the session's Unix socket and start accepting.
    pub fn listen_unix(
        path: &Path,
        session: Arc<Session>,
        runner: Arc<Runner>,
    ) -> Result<SocketServer> {
        // a stale socket file from a previous run would fail the bind
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        let stop = Arc::new(AtomicBool::new(false));

        let accept_stop = stop.clone();
        let handle = std::thread::spawn(move || {
            for incoming in listener.incoming() {
                if accept_stop.load(Ordering::SeqCst) {
                    break;
                }
                match incoming {
                    Ok(stream) => spawn_connection(
                        ClientStream::Unix(stream),
                        session.clone(),
                        runner.clone(),
                    ),
                    Err(err) => {
                        warn!(error = %err, "failed to accept an IPC connection");
                        break;
                    }
                }
            }
        });

        Ok(SocketServer {
            endpoint: Endpoint::Unix(path.to_path_buf()),
            stop,
            handle: Some(handle),
        })
    }

    /// Bind the TCP endpoint and start accepting. Port 0 binds an
    /// ephemeral port, observable through [`SocketServer::tcp_addr`].
    pub fn listen_tcp(
        port: u16,
        session: Arc<Session>,
        runner: Arc<Runner>,
    ) -> Result<SocketServer> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        let addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));

        let accept_stop = stop.clone();
        let handle = std::thread::spawn(move || {
            for incoming in listener.incoming() {
                if accept_stop.load(Ordering::SeqCst) {
                    break;
                }
                match incoming {
                    Ok(stream) => spawn_connection(
                        ClientStream::Tcp(stream),
                        session.clone(),
                        runner.clone(),
                    ),
                    Err(err) => {
                        warn!(error = %err, "failed to accept an RPC connection");
                        break;
                    }
                }
            }
        });

        Ok(SocketServer {
            endpoint: Endpoint::Tcp(addr),
            stop,
            handle: Some(handle),
        })
    }

    /// The bound TCP address, when this acceptor serves TCP.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        match &self.endpoint {
            Endpoint::Tcp(addr) => Some(*addr),
            Endpoint::Unix(_) => None,
        }
    }

    /// Stop accepting: raise the flag, wake the blocked accept with a
    /// throwaway connection, join the loop, and clean up the socket file.
    pub fn stop(&mut self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        match &self.endpoint {
            Endpoint::Unix(path) => {
                let _ = UnixStream::connect(path);
            }
            Endpoint::Tcp(addr) => {
                let _ = TcpStream::connect(("127.0.0.1", addr.port()));
            }
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        if let Endpoint::Unix(path) = &self.endpoint {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_connection(stream: ClientStream, session: Arc<Session>, runner: Arc<Runner>) {
    let conn_id = next_conn_id();
    session.connection_opened();
    debug!(conn = conn_id, "accepted connection");
    std::thread::spawn(move || {
        match SocketConnection::new(stream, session.clone(), runner, conn_id) {
            Ok(connection) => connection.run(),
            Err(err) => {
                warn!(conn = conn_id, error = %err, "failed to set up the connection");
                session.connection_closed();
            }
        }
    });
}
