//! The session runner.
//!
//! A session is an independent bulk store served on its own socket path.
//! The runner keeps the root session (reserved id, base socket path, the
//! only one allowed to host the RPC endpoint) plus child sessions created
//! on demand with generated ids and derived socket paths. Deleting a
//! session stops its acceptor and drops its stores.

use super::bulk::{BulkStore, PlasmaStore};
use super::meta::MetaService;
use super::socket::SocketServer;
use super::stream::StreamStore;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::memory::{InstanceID, ROOT_SESSION_ID, SessionID, session_id_to_string};
use crate::protocol::StoreType;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::info;

/// One live session: its stores, its socket path, and its connection
/// bookkeeping.
pub struct Session {
    pub session_id: SessionID,
    pub store_type: StoreType,
    pub socket_path: PathBuf,
    pub rpc_endpoint: String,
    pub instance_id: InstanceID,
    /// The default bulk store; present unless this is a plasma session.
    pub bulk: Option<Arc<BulkStore>>,
    /// The plasma bulk store; present only for plasma sessions.
    pub plasma: Option<Arc<PlasmaStore>>,
    /// The stream store rides on the default bulk store.
    pub streams: Option<Arc<StreamStore>>,
    pub meta: Arc<MetaService>,
    pub runner: Weak<Runner>,
    /// Alive connections across the session's acceptors.
    connections: AtomicUsize,
    /// Set by `delete_session`: tear the session down once the last
    /// connection drops.
    closable: AtomicBool,
}

impl Session {
    fn new(
        config: &ServerConfig,
        session_id: SessionID,
        store_type: StoreType,
        runner: Weak<Runner>,
    ) -> Arc<Session> {
        let socket_path = if session_id == ROOT_SESSION_ID {
            config.socket.clone()
        } else {
            let mut path = config.socket.as_os_str().to_owned();
            path.push(format!(".{}", session_id_to_string(session_id)));
            PathBuf::from(path)
        };
        let rpc_endpoint = if session_id == ROOT_SESSION_ID && config.rpc {
            format!("0.0.0.0:{}", config.rpc_socket_port)
        } else {
            "0.0.0.0:0".to_owned()
        };

        let (bulk, plasma, streams) = match store_type {
            StoreType::Default => {
                let bulk = Arc::new(BulkStore::new(
                    config.allocator,
                    config.shared_memory_size,
                    config.spill_path.clone(),
                    config.spill_lower_rate,
                    config.spill_upper_rate,
                ));
                let streams = Arc::new(StreamStore::new(bulk.clone(), config.stream_threshold));
                (Some(bulk), None, Some(streams))
            }
            StoreType::Plasma => {
                let plasma = Arc::new(PlasmaStore::new(
                    config.allocator,
                    config.shared_memory_size,
                ));
                (None, Some(plasma), None)
            }
        };

        Arc::new(Session {
            session_id,
            store_type,
            socket_path,
            rpc_endpoint,
            instance_id: 0,
            bulk,
            plasma,
            streams,
            meta: Arc::new(MetaService::new(0)),
            runner,
            connections: AtomicUsize::new(0),
            closable: AtomicBool::new(false),
        })
    }

    /// The default bulk store, or an error on plasma sessions.
    pub fn bulk_store(&self) -> Result<&Arc<BulkStore>> {
        self.bulk
            .as_ref()
            .ok_or_else(|| Error::Invalid("this session does not host a default store".into()))
    }

    /// The plasma bulk store, or an error on default sessions.
    pub fn plasma_store(&self) -> Result<&Arc<PlasmaStore>> {
        self.plasma
            .as_ref()
            .ok_or_else(|| Error::Invalid("this session does not host a plasma store".into()))
    }

    /// The stream store, or an error on plasma sessions.
    pub fn stream_store(&self) -> Result<&Arc<StreamStore>> {
        self.streams
            .as_ref()
            .ok_or_else(|| Error::Invalid("this session does not host a stream store".into()))
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    /// Called as each connection winds down; tears the session down when
    /// it was marked closable and this was the last connection.
    pub fn connection_closed(&self) {
        let remaining = self.connections.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && self.closable.load(Ordering::SeqCst) {
            if let Some(runner) = self.runner.upgrade() {
                let session_id = self.session_id;
                // tear down from a fresh thread: the current one is still
                // inside this session's connection handler
                std::thread::spawn(move || {
                    let _ = runner.delete(session_id);
                });
            }
        }
    }

    pub fn alive_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Mark the session for deletion once its last connection drops.
    pub fn mark_closable(&self) {
        self.closable.store(true, Ordering::SeqCst);
    }
}

struct SessionEntry {
    session: Arc<Session>,
    ipc: SocketServer,
    rpc: Option<SocketServer>,
}

/// The process-wide registry of live sessions.
pub struct Runner {
    config: ServerConfig,
    sessions: RwLock<HashMap<SessionID, SessionEntry>>,
    stopped: AtomicBool,
}

fn generate_session_id() -> SessionID {
    rand::thread_rng().gen_range(1..i64::MAX)
}

impl Runner {
    pub fn new(config: ServerConfig) -> Result<Arc<Runner>> {
        config.validate()?;
        Ok(Arc::new(Runner {
            config,
            sessions: RwLock::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Start the root session and, when configured, the RPC endpoint.
    pub fn serve(self: &Arc<Runner>) -> Result<()> {
        {
            let sessions = self.sessions.read();
            if !sessions.is_empty() {
                return Err(Error::Invalid("the runner is already serving".into()));
            }
        }
        let session = Session::new(
            &self.config,
            ROOT_SESSION_ID,
            StoreType::Default,
            Arc::downgrade(self),
        );
        let ipc = SocketServer::listen_unix(&session.socket_path, session.clone(), self.clone())?;
        let rpc = if self.config.rpc {
            Some(SocketServer::listen_tcp(
                self.config.rpc_socket_port,
                session.clone(),
                self.clone(),
            )?)
        } else {
            None
        };
        info!(
            socket = %session.socket_path.display(),
            rpc = %session.rpc_endpoint,
            "serving the root session"
        );
        self.sessions.write().insert(
            ROOT_SESSION_ID,
            SessionEntry { session, ipc, rpc },
        );
        Ok(())
    }

    /// Spawn a child session. Returns its generated id and socket path.
    pub fn create_new_session(
        self: &Arc<Runner>,
        store_type: StoreType,
    ) -> Result<(SessionID, String)> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::ServerNotReady("the runner is shutting down".into()));
        }
        let session_id = generate_session_id();
        let session = Session::new(&self.config, session_id, store_type, Arc::downgrade(self));
        let socket_path = session.socket_path.to_string_lossy().into_owned();
        let ipc = SocketServer::listen_unix(&session.socket_path, session.clone(), self.clone())?;
        info!(session = %session_id_to_string(session_id), socket = %socket_path, "created session");
        self.sessions.write().insert(
            session_id,
            SessionEntry {
                session,
                ipc,
                rpc: None,
            },
        );
        Ok((session_id, socket_path))
    }

    /// Stop a session's acceptors and unregister it. Unknown ids are
    /// tolerated.
    pub fn delete(&self, session_id: SessionID) -> Result<()> {
        let Some(mut entry) = self.sessions.write().remove(&session_id) else {
            return Ok(());
        };
        entry.ipc.stop();
        if let Some(rpc) = entry.rpc.as_mut() {
            rpc.stop();
        }
        entry.session.meta.drop_deferred();
        if session_id != ROOT_SESSION_ID {
            info!(session = %session_id_to_string(session_id), "deleted session");
        }
        Ok(())
    }

    pub fn get(&self, session_id: SessionID) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .get(&session_id)
            .map(|entry| entry.session.clone())
            .ok_or_else(|| {
                Error::Invalid(format!(
                    "session (sid = {}) does not exist",
                    session_id_to_string(session_id)
                ))
            })
    }

    pub fn root(&self) -> Result<Arc<Session>> {
        self.get(ROOT_SESSION_ID)
    }

    pub fn running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    /// Delete every session, root included.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<SessionID> = self.sessions.read().keys().copied().collect();
        for id in ids {
            let _ = self.delete(id);
        }
    }

    /// The configuration this runner serves with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The bound RPC address of the root session, when RPC is enabled.
    /// Useful with port 0, which binds an ephemeral port.
    pub fn rpc_addr(&self) -> Option<std::net::SocketAddr> {
        self.sessions
            .read()
            .get(&ROOT_SESSION_ID)
            .and_then(|entry| entry.rpc.as_ref())
            .and_then(|rpc| rpc.tcp_addr())
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.stop();
    }
}
