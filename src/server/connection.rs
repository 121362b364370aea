//! Per-connection protocol handler.
//!
//! Each connection executes a sequential read-header → read-body →
//! dispatch → write loop. Replies are emitted in request order; arena
//! fds ride as ancillary messages strictly after their reply's bytes so
//! the client can correlate them positionally with the reply's `"fds"`
//! list. Remote (TCP) connections never receive fds: blob bytes travel
//! inline after the reply instead.
//!
//! On any I/O error, a malformed or oversized frame, or an explicit
//! `exit_request`, the handler drops the connection's dependency set and
//! stream subscriptions and closes the socket.

use super::meta::{self, MetaState};
use super::metrics;
use super::session::{Runner, Session};
use crate::error::{Error, Result};
use crate::memory::{fdpass, ObjectID, Payload, PlasmaID, PlasmaPayload};
use crate::protocol::{self, MoveOwnership, RegisterReply, StoreType};
use parking_lot::Mutex;
use rustix::fd::BorrowedFd;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// A client connection, local or remote.
pub enum ClientStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl ClientStream {
    fn try_clone(&self) -> std::io::Result<ClientStream> {
        match self {
            ClientStream::Unix(stream) => stream.try_clone().map(ClientStream::Unix),
            ClientStream::Tcp(stream) => stream.try_clone().map(ClientStream::Tcp),
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            ClientStream::Unix(stream) => stream.shutdown(std::net::Shutdown::Both),
            ClientStream::Tcp(stream) => stream.shutdown(std::net::Shutdown::Both),
        };
    }
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ClientStream::Unix(stream) => stream.read(buf),
            ClientStream::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            ClientStream::Unix(stream) => stream.write(buf),
            ClientStream::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            ClientStream::Unix(stream) => stream.flush(),
            ClientStream::Tcp(stream) => stream.flush(),
        }
    }
}

/// The shared write half of a connection. Deferred continuations clone
/// it to emit their reply after the dispatch loop has moved on.
pub struct ConnWriter {
    stream: Mutex<ClientStream>,
    fd_passing: bool,
}

impl ConnWriter {
    fn new(stream: ClientStream) -> ConnWriter {
        let fd_passing = matches!(stream, ClientStream::Unix(_));
        ConnWriter {
            stream: Mutex::new(stream),
            fd_passing,
        }
    }

    fn write_message(&self, body: &str) -> Result<()> {
        protocol::write_message(&mut *self.stream.lock(), body)
    }

    fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut stream = self.stream.lock();
        stream.write_all(bytes)?;
        stream.flush()?;
        Ok(())
    }

    /// Send an arena fd as an ancillary message. Only meaningful on the
    /// IPC socket.
    fn send_fd(&self, fd: i32) -> Result<()> {
        let stream = self.stream.lock();
        match &*stream {
            ClientStream::Unix(socket) => {
                // SAFETY: the fd indexes a live arena owned by the store,
                // which outlives this connection.
                fdpass::send_fd(socket, unsafe { BorrowedFd::borrow_raw(fd) })
            }
            ClientStream::Tcp(_) => Err(Error::Invalid(
                "file descriptors cannot cross the RPC transport".into(),
            )),
        }
    }

    fn supports_fd_passing(&self) -> bool {
        self.fd_passing
    }
}

/// State of one connection.
pub struct SocketConnection {
    reader: ClientStream,
    writer: Arc<ConnWriter>,
    session: Arc<Session>,
    runner: Arc<Runner>,
    conn_id: u64,
    /// Arena fds already sent to this client; duplicates are suppressed.
    used_fds: HashSet<i32>,
    /// Streams this connection pulls from; dropped on disconnect.
    associated_streams: HashSet<ObjectID>,
    running: Arc<AtomicBool>,
}

impl SocketConnection {
    pub fn new(
        stream: ClientStream,
        session: Arc<Session>,
        runner: Arc<Runner>,
        conn_id: u64,
    ) -> Result<SocketConnection> {
        let writer = Arc::new(ConnWriter::new(stream.try_clone()?));
        metrics::record_connection();
        Ok(SocketConnection {
            reader: stream,
            writer,
            session,
            runner,
            conn_id,
            used_fds: HashSet::new(),
            associated_streams: HashSet::new(),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// The sequential dispatch loop.
    pub fn run(mut self) {
        while self.running.load(Ordering::SeqCst) {
            // malformed or oversized frames close the connection silently
            let root = match protocol::read_json_message(&mut self.reader) {
                Ok(root) => root,
                Err(err) => {
                    debug!(conn = self.conn_id, error = %err, "closing connection");
                    break;
                }
            };
            match self.process(&root) {
                Ok(false) => continue,
                Ok(true) => break,
                Err(err) => {
                    // the handler failed mid-reply; the framing can no
                    // longer be trusted
                    warn!(conn = self.conn_id, error = %err, "dropping connection");
                    break;
                }
            }
        }
        self.teardown();
    }

    /// Dispatch one request. `Ok(true)` ends the connection; `Err` means
    /// the reply could not be written.
    fn process(&mut self, root: &Value) -> Result<bool> {
        let Some(kind) = root["type"].as_str() else {
            return Ok(true);
        };
        use crate::protocol::Command;
        let outcome = match Command::parse(kind) {
            Command::Register => self.do_register(root),
            Command::CreateBuffer => self.do_create_buffer(root),
            Command::CreateDiskBuffer => self.do_create_disk_buffer(root),
            Command::CreateRemoteBuffer => self.do_create_remote_buffer(root),
            Command::GetBuffers => self.do_get_buffers(root),
            Command::GetRemoteBuffers => self.do_get_remote_buffers(root),
            Command::DropBuffer => self.do_drop_buffer(root),
            Command::Seal => self.do_seal(root),
            Command::Release => self.do_release(root),
            Command::IncreaseReferenceCount => self.do_increase_reference_count(root),
            Command::IsInUse => self.do_is_in_use(root),
            Command::IsSpilled => self.do_is_spilled(root),
            Command::MakeArena => self.do_make_arena(root),
            Command::FinalizeArena => self.do_finalize_arena(root),
            Command::CreateBufferByPlasma => self.do_create_buffer_by_plasma(root),
            Command::GetBuffersByPlasma => self.do_get_buffers_by_plasma(root),
            Command::PlasmaSeal => self.do_plasma_seal(root),
            Command::PlasmaRelease => self.do_plasma_release(root),
            Command::PlasmaDelData => self.do_plasma_del_data(root),
            Command::MoveBuffersOwnership => self.do_move_buffers_ownership(root),
            Command::CreateGpuBuffer | Command::GetGpuBuffers => {
                Err(Error::Invalid("GPU support is not enabled".into()))
            }
            Command::GetData => self.do_get_data(root),
            Command::ListData => self.do_list_data(root),
            Command::CreateData => self.do_create_data(root),
            Command::Persist => self.do_persist(root),
            Command::IfPersist => self.do_if_persist(root),
            Command::Exists => self.do_exists(root),
            Command::ShallowCopy => self.do_shallow_copy(root),
            Command::DelData => self.do_del_data(root, false),
            Command::DelDataWithFeedbacks => self.do_del_data(root, true),
            Command::PutName => self.do_put_name(root),
            Command::GetName => self.do_get_name(root),
            Command::DropName => self.do_drop_name(root),
            Command::CreateStream => self.do_create_stream(root),
            Command::OpenStream => self.do_open_stream(root),
            Command::GetNextStreamChunk => self.do_get_next_stream_chunk(root),
            Command::PushNextStreamChunk => self.do_push_next_stream_chunk(root),
            Command::PullNextStreamChunk => self.do_pull_next_stream_chunk(root),
            Command::StopStream => self.do_stop_stream(root),
            Command::MigrateObject => {
                Err(Error::Invalid("migrate requests have been deprecated".into()))
            }
            Command::ClusterMeta => self.do_cluster_meta(root),
            Command::InstanceStatus => self.do_instance_status(root),
            Command::Clear => self.do_clear(root),
            Command::Debug => self.do_debug(root),
            Command::NewSession => self.do_new_session(root),
            Command::DeleteSession => self.do_delete_session(root),
            Command::Exit => return Ok(true),
            Command::Null => {
                warn!(conn = self.conn_id, kind, "unexpected command");
                return Ok(true);
            }
        };
        match outcome {
            Ok(exit) => Ok(exit),
            Err(err) => {
                // user-visible failure: report it and keep the loop alive
                self.writer
                    .write_message(&protocol::write_error_reply(&err))?;
                Ok(false)
            }
        }
    }

    fn teardown(self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(bulk) = &self.session.bulk {
            bulk.release_connection(self.conn_id);
        }
        if let Some(plasma) = &self.session.plasma {
            plasma.release_connection(self.conn_id);
        }
        if let Some(streams) = &self.session.streams {
            for stream_id in &self.associated_streams {
                streams.drop_stream(*stream_id);
            }
        }
        self.reader.shutdown();
        debug!(conn = self.conn_id, "connection closed");
        self.session.connection_closed();
    }

    /// Dedup arena fds per connection: returns the fd to attach to this
    /// reply, or -1 when the client already holds it (or cannot receive
    /// fds at all).
    fn stage_fd(&mut self, payload: &Payload) -> i32 {
        if payload.data_size == 0
            || !self.writer.supports_fd_passing()
            || self.used_fds.contains(&payload.store_fd)
        {
            return -1;
        }
        self.used_fds.insert(payload.store_fd);
        payload.store_fd
    }

    fn reply(&self, body: String) -> Result<bool> {
        self.writer.write_message(&body)?;
        Ok(false)
    }

    // -- registration and sessions ------------------------------------------

    fn do_register(&mut self, root: &Value) -> Result<bool> {
        let (client_version, store_type) = protocol::read_register_request(root)?;
        debug!(conn = self.conn_id, version = %client_version, "client registered");
        let reply = RegisterReply {
            ipc_socket: self.session.socket_path.to_string_lossy().into_owned(),
            rpc_endpoint: self.session.rpc_endpoint.clone(),
            instance_id: self.session.instance_id,
            session_id: self.session.session_id,
            version: protocol::server_version().to_owned(),
            store_match: store_type == self.session.store_type,
        };
        self.reply(protocol::write_register_reply(&reply))
    }

    fn do_new_session(&mut self, root: &Value) -> Result<bool> {
        let store_type = protocol::read_new_session_request(root)?;
        let (_session_id, socket_path) = self.runner.create_new_session(store_type)?;
        self.reply(protocol::write_new_session_reply(&socket_path))
    }

    fn do_delete_session(&mut self, _root: &Value) -> Result<bool> {
        self.session.mark_closable();
        self.writer
            .write_message(&protocol::write_delete_session_reply())?;
        Ok(true)
    }

    // -- buffers -------------------------------------------------------------

    fn do_create_buffer(&mut self, root: &Value) -> Result<bool> {
        let size = protocol::read_create_buffer_request(root)?;
        let bulk = self.session.bulk_store()?.clone();
        let (id, payload) = bulk.create(size)?;
        let fd_to_send = self.stage_fd(&payload);
        self.writer
            .write_message(&protocol::write_create_buffer_reply(id, &payload, fd_to_send))?;
        if fd_to_send != -1 {
            self.writer.send_fd(fd_to_send)?;
        }
        metrics::record_memory_usage(self.session.instance_id, bulk.footprint());
        Ok(false)
    }

    fn do_create_disk_buffer(&mut self, root: &Value) -> Result<bool> {
        let (size, path) = protocol::read_create_disk_buffer_request(root)?;
        if size == 0 && path.is_empty() {
            return Err(Error::Invalid(
                "create disk buffer: one of 'size' and 'path' must be specified".into(),
            ));
        }
        let bulk = self.session.bulk_store()?.clone();
        let (id, payload) = bulk.create_disk(size, std::path::Path::new(&path))?;
        let fd_to_send = self.stage_fd(&payload);
        self.writer.write_message(&protocol::write_create_disk_buffer_reply(
            id, &payload, fd_to_send,
        ))?;
        if fd_to_send != -1 {
            self.writer.send_fd(fd_to_send)?;
        }
        metrics::record_memory_usage(self.session.instance_id, bulk.footprint());
        Ok(false)
    }

    /// The remote mirror of `create_buffer`: allocate, seal, then read
    /// exactly `data_size` bytes off the control socket into the payload.
    fn do_create_remote_buffer(&mut self, root: &Value) -> Result<bool> {
        let size = protocol::read_create_remote_buffer_request(root)?;
        let bulk = self.session.bulk_store()?.clone();
        let (id, payload) = bulk.create(size)?;
        bulk.seal(id)?;

        if size > 0 {
            // SAFETY: the payload was just carved and is only reachable
            // from this handler until the reply is sent.
            let target = unsafe {
                std::slice::from_raw_parts_mut(payload.pointer as usize as *mut u8, size)
            };
            if let Err(err) = self.reader.read_exact(target) {
                // unconditionally drop the partial payload
                let _ = bulk.on_delete(id);
                return Err(Error::Io(std::io::Error::new(
                    err.kind(),
                    format!("short read while receiving a remote buffer: {err}"),
                )));
            }
        }
        metrics::record_memory_usage(self.session.instance_id, bulk.footprint());
        self.reply(protocol::write_create_buffer_reply(id, &payload, -1))
    }

    fn do_get_buffers(&mut self, root: &Value) -> Result<bool> {
        let (ids, unsafe_get) = protocol::read_get_buffers_request(root)?;
        let bulk = self.session.bulk_store()?.clone();
        let payloads = bulk.get(&ids, unsafe_get)?;
        bulk.add_dependency(&ids, self.conn_id)?;

        let mut fds_to_send = Vec::new();
        for payload in &payloads {
            let fd = self.stage_fd(payload);
            if fd != -1 {
                fds_to_send.push(fd);
            }
        }
        // the fds follow the reply bytes, in the order listed in "fds"
        self.writer
            .write_message(&protocol::write_get_buffers_reply(&payloads, &fds_to_send))?;
        for fd in fds_to_send {
            self.writer.send_fd(fd)?;
        }
        Ok(false)
    }

    /// Remote reads carry no fds: the payload bytes are written
    /// back-to-back right after the reply, in payload-list order.
    fn do_get_remote_buffers(&mut self, root: &Value) -> Result<bool> {
        let (ids, unsafe_get) = protocol::read_get_remote_buffers_request(root)?;
        let bulk = self.session.bulk_store()?.clone();
        let payloads = bulk.get(&ids, unsafe_get)?;
        bulk.add_dependency(&ids, self.conn_id)?;

        self.writer
            .write_message(&protocol::write_get_buffers_reply(&payloads, &[]))?;
        for payload in &payloads {
            if payload.data_size == 0 {
                continue;
            }
            // SAFETY: sealed payload in a live arena; readers only.
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    payload.pointer as usize as *const u8,
                    payload.data_size,
                )
            };
            self.writer.write_raw(bytes)?;
        }
        Ok(false)
    }

    fn do_drop_buffer(&mut self, root: &Value) -> Result<bool> {
        let id = protocol::read_drop_buffer_request(root)?;
        let bulk = self.session.bulk_store()?.clone();
        // deletion ignores outstanding reference counts
        bulk.on_delete(id)?;
        metrics::record_memory_usage(self.session.instance_id, bulk.footprint());
        self.reply(protocol::write_drop_buffer_reply())
    }

    fn do_seal(&mut self, root: &Value) -> Result<bool> {
        let id = protocol::read_seal_request(root)?;
        let bulk = self.session.bulk_store()?;
        bulk.seal(id)?;
        bulk.add_dependency(&[id], self.conn_id)?;
        self.reply(protocol::write_seal_reply())
    }

    fn do_release(&mut self, root: &Value) -> Result<bool> {
        let id = protocol::read_release_request(root)?;
        self.session.bulk_store()?.release(id, self.conn_id)?;
        self.reply(protocol::write_release_reply())
    }

    fn do_increase_reference_count(&mut self, root: &Value) -> Result<bool> {
        let ids = protocol::read_increase_reference_count_request(root)?;
        self.session
            .bulk_store()?
            .add_dependency(&ids, self.conn_id)?;
        self.reply(protocol::write_increase_reference_count_reply())
    }

    fn do_is_in_use(&mut self, root: &Value) -> Result<bool> {
        let id = protocol::read_is_in_use_request(root)?;
        let in_use = self.session.bulk_store()?.is_in_use(id);
        self.reply(protocol::write_is_in_use_reply(in_use))
    }

    fn do_is_spilled(&mut self, root: &Value) -> Result<bool> {
        let id = protocol::read_is_spilled_request(root)?;
        let spilled = self.session.bulk_store()?.is_spilled(id);
        self.reply(protocol::write_is_spilled_reply(spilled))
    }

    fn do_make_arena(&mut self, root: &Value) -> Result<bool> {
        let mut size = protocol::read_make_arena_request(root)?;
        let bulk = self.session.bulk_store()?;
        if size == usize::MAX {
            size = bulk.footprint_limit();
        }
        let (fd, base) = bulk.make_arena(size)?;
        let fd_to_send = if self.writer.supports_fd_passing() && !self.used_fds.contains(&fd) {
            self.used_fds.insert(fd);
            fd
        } else {
            -1
        };
        self.writer
            .write_message(&protocol::write_make_arena_reply(fd, size, base))?;
        if fd_to_send != -1 {
            self.writer.send_fd(fd_to_send)?;
        }
        Ok(false)
    }

    fn do_finalize_arena(&mut self, root: &Value) -> Result<bool> {
        let (fd, offsets, sizes) = protocol::read_finalize_arena_request(root)?;
        self.session
            .bulk_store()?
            .finalize_arena(fd, &offsets, &sizes)?;
        self.reply(protocol::write_finalize_arena_reply())
    }

    // -- plasma --------------------------------------------------------------

    fn do_create_buffer_by_plasma(&mut self, root: &Value) -> Result<bool> {
        let (plasma_id, size, plasma_size) = protocol::read_create_buffer_by_plasma_request(root)?;
        let plasma = self.session.plasma_store()?.clone();
        let (object_id, payload) = plasma.create(size, plasma_size, plasma_id)?;
        let fd_to_send = self.stage_fd(&payload.base);
        self.writer
            .write_message(&protocol::write_create_buffer_by_plasma_reply(
                object_id, &payload, fd_to_send,
            ))?;
        if fd_to_send != -1 {
            self.writer.send_fd(fd_to_send)?;
        }
        metrics::record_memory_usage(self.session.instance_id, plasma.footprint());
        Ok(false)
    }

    fn do_get_buffers_by_plasma(&mut self, root: &Value) -> Result<bool> {
        let (plasma_ids, unsafe_get) = protocol::read_get_buffers_by_plasma_request(root)?;
        let plasma = self.session.plasma_store()?.clone();
        let payloads = plasma.get(&plasma_ids, unsafe_get)?;
        plasma.add_dependency(&plasma_ids, self.conn_id)?;

        // the reply lists no fds; both ends dedup by store fd in payload
        // order
        self.writer
            .write_message(&protocol::write_get_buffers_by_plasma_reply(&payloads))?;
        for payload in &payloads {
            let fd = self.stage_fd(&payload.base);
            if fd != -1 {
                self.writer.send_fd(fd)?;
            }
        }
        Ok(false)
    }

    fn do_plasma_seal(&mut self, root: &Value) -> Result<bool> {
        let plasma_id = protocol::read_plasma_seal_request(root)?;
        let plasma = self.session.plasma_store()?;
        plasma.seal(&plasma_id)?;
        plasma.add_dependency(std::slice::from_ref(&plasma_id), self.conn_id)?;
        self.reply(protocol::write_seal_reply())
    }

    fn do_plasma_release(&mut self, root: &Value) -> Result<bool> {
        let plasma_id = protocol::read_plasma_release_request(root)?;
        self.session
            .plasma_store()?
            .release(&plasma_id, self.conn_id)?;
        self.reply(protocol::write_plasma_release_reply())
    }

    fn do_plasma_del_data(&mut self, root: &Value) -> Result<bool> {
        let plasma_id = protocol::read_plasma_del_data_request(root)?;
        // plasma data is not composable, no metadata plane involved
        self.session.plasma_store()?.on_delete(&plasma_id)?;
        self.reply(protocol::write_plasma_del_data_reply())
    }

    // -- ownership movement --------------------------------------------------

    fn do_move_buffers_ownership(&mut self, root: &Value) -> Result<bool> {
        let request = protocol::read_move_buffers_ownership_request(root)?;
        if request.session_id == self.session.session_id {
            return Err(Error::Invalid(
                "cannot move buffers within a single session".into(),
            ));
        }
        let source = self.runner.get(request.session_id)?;
        self.move_buffers(&request, &source)?;
        self.reply(protocol::write_move_buffers_ownership_reply())
    }

    /// The shared handoff algorithm for all four id-space pairings:
    /// detach from the source index, re-key into the target's scheme with
    /// a reset sharing state, insert, then bump both sides' counters so
    /// neither session ever frees a payload whose arena may still be live
    /// in client mappings.
    fn move_buffers(&self, request: &MoveOwnership, source: &Arc<Session>) -> Result<()> {
        let target = &self.session;
        if !request.id_to_id.is_empty() {
            let mapping: HashMap<ObjectID, ObjectID> = request.id_to_id.iter().copied().collect();
            let ids: Vec<ObjectID> = mapping.keys().copied().collect();
            let source_store = source.bulk_store()?;
            let target_store = target.bulk_store()?;
            let mut moved = Vec::new();
            for mut payload in source_store.remove_ownership(&ids) {
                let target_id = mapping[&payload.object_id];
                payload.reset();
                payload.object_id = target_id;
                moved.push(payload);
            }
            target_store.move_ownership(moved);
            for (src, dst) in &request.id_to_id {
                source_store.fetch_and_modify(*src, 1)?;
                target_store.fetch_and_modify(*dst, 1)?;
            }
        } else if !request.id_to_pid.is_empty() {
            let mapping: HashMap<ObjectID, PlasmaID> = request.id_to_pid.iter().cloned().collect();
            let ids: Vec<ObjectID> = mapping.keys().copied().collect();
            let source_store = source.bulk_store()?;
            let target_store = target.plasma_store()?;
            let mut moved = Vec::new();
            for mut payload in source_store.remove_ownership(&ids) {
                let target_id = mapping[&payload.object_id].clone();
                payload.reset();
                moved.push(PlasmaPayload::new(target_id, payload.data_size, payload));
            }
            target_store.move_ownership(moved);
            for (src, dst) in &request.id_to_pid {
                source_store.fetch_and_modify(*src, 1)?;
                target_store.fetch_and_modify(dst, 1)?;
            }
        } else if !request.pid_to_id.is_empty() {
            let mapping: HashMap<PlasmaID, ObjectID> = request.pid_to_id.iter().cloned().collect();
            let ids: Vec<PlasmaID> = mapping.keys().cloned().collect();
            let source_store = source.plasma_store()?;
            let target_store = target.bulk_store()?;
            let mut moved = Vec::new();
            for payload in source_store.remove_ownership(&ids) {
                let target_id = mapping[&payload.plasma_id];
                let mut base = payload.base;
                base.reset();
                base.object_id = target_id;
                moved.push(base);
            }
            target_store.move_ownership(moved);
            for (src, dst) in &request.pid_to_id {
                source_store.fetch_and_modify(src, 1)?;
                target_store.fetch_and_modify(*dst, 1)?;
            }
        } else if !request.pid_to_pid.is_empty() {
            let mapping: HashMap<PlasmaID, PlasmaID> = request.pid_to_pid.iter().cloned().collect();
            let ids: Vec<PlasmaID> = mapping.keys().cloned().collect();
            let source_store = source.plasma_store()?;
            let target_store = target.plasma_store()?;
            let mut moved = Vec::new();
            for mut payload in source_store.remove_ownership(&ids) {
                let target_id = mapping[&payload.plasma_id].clone();
                payload.base.reset();
                payload.plasma_id = target_id;
                moved.push(payload);
            }
            target_store.move_ownership(moved);
            for (src, dst) in &request.pid_to_pid {
                source_store.fetch_and_modify(src, 1)?;
                target_store.fetch_and_modify(dst, 1)?;
            }
        }
        Ok(())
    }

    // -- metadata plane ------------------------------------------------------

    /// Compose the `get_data` content group: blob entries come from the
    /// bulk store, composite entries from the metadata tree.
    fn compose_data_group(
        session: &Session,
        state: &MetaState,
        ids: &[ObjectID],
    ) -> Value {
        let mut group = json!({});
        for id in ids {
            if id.is_blob() {
                let Some(bulk) = &session.bulk else { continue };
                if let Ok(payloads) = bulk.get(&[*id], false) {
                    group[id.to_hex()] = json!({
                        "id": id.to_hex(),
                        "typename": "arbor::Blob",
                        "length": payloads[0].data_size,
                        "nbytes": payloads[0].data_size,
                        "transient": true,
                        "instance_id": session.instance_id,
                    });
                }
            } else if let Some(tree) = state.data.get(id) {
                group[id.to_hex()] = tree.clone();
            }
        }
        group
    }

    fn do_get_data(&mut self, root: &Value) -> Result<bool> {
        let (ids, _sync_remote, wait) = protocol::read_get_data_request(root)?;
        metrics::record_data_request("get");

        let session = self.session.clone();
        let writer = self.writer.clone();
        let running = self.running.clone();
        let test_session = session.clone();
        let test_ids = ids.clone();
        self.session.meta.request(
            wait,
            Box::new(move || running.load(Ordering::SeqCst)),
            Box::new(move |state| {
                test_ids.iter().all(|id| {
                    if id.is_blob() {
                        test_session
                            .bulk
                            .as_ref()
                            .map(|bulk| bulk.exists(*id))
                            .unwrap_or(false)
                    } else {
                        state.exists(*id)
                    }
                })
            }),
            Box::new(move |state| {
                let group = Self::compose_data_group(&session, state, &ids);
                let _ = writer.write_message(&protocol::write_get_data_reply(&group));
            }),
        );
        Ok(false)
    }

    fn do_list_data(&mut self, root: &Value) -> Result<bool> {
        let (pattern, regex, limit) = protocol::read_list_data_request(root)?;
        let mut group = self.session.meta.list_data(&pattern, regex, limit)?;
        let mut current = group.as_object().map(|o| o.len()).unwrap_or(0);
        // blobs are transient and live outside the metadata tree; list
        // them when the pattern covers them and the limit leaves room
        if current < limit && meta::type_name_matches(&pattern, regex, "arbor::Blob") {
            if let Some(bulk) = &self.session.bulk {
                for payload in bulk.list() {
                    if current >= limit {
                        break;
                    }
                    // unsealed blobs would fail a follow-up get_buffers
                    if !payload.is_sealed || payload.object_id == ObjectID::EMPTY_BLOB {
                        continue;
                    }
                    group[payload.object_id.to_hex()] = json!({
                        "id": payload.object_id.to_hex(),
                        "typename": "arbor::Blob",
                        "length": payload.data_size,
                        "nbytes": payload.data_size,
                        "transient": true,
                        "instance_id": self.session.instance_id,
                    });
                    current += 1;
                }
            }
        }
        self.reply(protocol::write_get_data_reply(&group))
    }

    fn do_create_data(&mut self, root: &Value) -> Result<bool> {
        let content = protocol::read_create_data_request(root)?;
        metrics::record_data_request("create");
        let (id, signature) = self.session.meta.create_data(content)?;
        self.reply(protocol::write_create_data_reply(
            id,
            signature,
            self.session.instance_id,
        ))
    }

    fn do_persist(&mut self, root: &Value) -> Result<bool> {
        let id = protocol::read_persist_request(root)?;
        self.session.meta.persist(id)?;
        self.reply(protocol::write_persist_reply())
    }

    fn do_if_persist(&mut self, root: &Value) -> Result<bool> {
        let id = protocol::read_if_persist_request(root)?;
        let persist = self.session.meta.if_persist(id);
        self.reply(protocol::write_if_persist_reply(persist))
    }

    fn do_exists(&mut self, root: &Value) -> Result<bool> {
        let id = protocol::read_exists_request(root)?;
        let exists = if id.is_blob() {
            self.session
                .bulk
                .as_ref()
                .map(|bulk| bulk.exists(id))
                .unwrap_or(false)
        } else {
            self.session.meta.exists(id)
        };
        self.reply(protocol::write_exists_reply(exists))
    }

    fn do_shallow_copy(&mut self, root: &Value) -> Result<bool> {
        let (id, extra) = protocol::read_shallow_copy_request(root)?;
        let target = self.session.meta.shallow_copy(id, &extra)?;
        self.reply(protocol::write_shallow_copy_reply(target))
    }

    fn do_del_data(&mut self, root: &Value, with_feedbacks: bool) -> Result<bool> {
        let (ids, force, deep, _fastpath) = if with_feedbacks {
            protocol::read_del_data_with_feedbacks_request(root)?
        } else {
            protocol::read_del_data_request(root)?
        };
        metrics::record_data_request("delete");
        let deleted = self.session.meta.del_data(&ids, force, deep)?;
        let mut deleted_blobs = Vec::new();
        for id in &deleted {
            if id.is_blob() {
                if let Some(bulk) = &self.session.bulk {
                    if bulk.on_delete(*id).is_ok() {
                        deleted_blobs.push(*id);
                    }
                }
            }
        }
        if with_feedbacks {
            self.reply(protocol::write_del_data_with_feedbacks_reply(&deleted_blobs))
        } else {
            self.reply(protocol::write_del_data_reply())
        }
    }

    // -- names ---------------------------------------------------------------

    fn do_put_name(&mut self, root: &Value) -> Result<bool> {
        let (object_id, name) = protocol::read_put_name_request(root)?;
        self.session.meta.put_name(object_id, &name)?;
        self.reply(protocol::write_put_name_reply())
    }

    fn do_get_name(&mut self, root: &Value) -> Result<bool> {
        let (name, wait) = protocol::read_get_name_request(root)?;
        let writer = self.writer.clone();
        let running = self.running.clone();
        let test_name = name.clone();
        self.session.meta.request(
            wait,
            Box::new(move || running.load(Ordering::SeqCst)),
            Box::new(move |state| state.name(&test_name).is_some()),
            Box::new(move |state| {
                let body = match state.name(&name) {
                    Some(object_id) => protocol::write_get_name_reply(object_id),
                    None => protocol::write_error_reply(&Error::ObjectNotExists(format!(
                        "failed to find name: {name}"
                    ))),
                };
                let _ = writer.write_message(&body);
            }),
        );
        Ok(false)
    }

    fn do_drop_name(&mut self, root: &Value) -> Result<bool> {
        let name = protocol::read_drop_name_request(root)?;
        self.session.meta.drop_name(&name)?;
        self.reply(protocol::write_drop_name_reply())
    }

    // -- streams -------------------------------------------------------------

    fn do_create_stream(&mut self, root: &Value) -> Result<bool> {
        let stream_id = protocol::read_create_stream_request(root)?;
        self.session.stream_store()?.create(stream_id)?;
        self.reply(protocol::write_create_stream_reply())
    }

    fn do_open_stream(&mut self, root: &Value) -> Result<bool> {
        let (stream_id, mode) = protocol::read_open_stream_request(root)?;
        self.session.stream_store()?.open(stream_id, mode)?;
        self.reply(protocol::write_open_stream_reply())
    }

    fn do_get_next_stream_chunk(&mut self, root: &Value) -> Result<bool> {
        let (stream_id, size) = protocol::read_get_next_stream_chunk_request(root)?;
        let chunk = self.session.stream_store()?.get(stream_id, size)?;
        let payload = self.session.bulk_store()?.get(&[chunk], true)?.remove(0);
        let fd_to_send = self.stage_fd(&payload);
        self.writer
            .write_message(&protocol::write_get_next_stream_chunk_reply(
                &payload, fd_to_send,
            ))?;
        if fd_to_send != -1 {
            self.writer.send_fd(fd_to_send)?;
        }
        Ok(false)
    }

    fn do_push_next_stream_chunk(&mut self, root: &Value) -> Result<bool> {
        let (stream_id, chunk) = protocol::read_push_next_stream_chunk_request(root)?;
        self.session.stream_store()?.push(stream_id, chunk)?;
        self.reply(protocol::write_push_next_stream_chunk_reply())
    }

    fn do_pull_next_stream_chunk(&mut self, root: &Value) -> Result<bool> {
        let stream_id = protocol::read_pull_next_stream_chunk_request(root)?;
        self.associated_streams.insert(stream_id);
        match self.session.stream_store()?.pull(stream_id) {
            Ok(chunk) => self.reply(protocol::write_pull_next_stream_chunk_reply(chunk)),
            Err(err) => {
                if !err.is_stream_drained() {
                    debug!(stream = %stream_id, error = %err, "pull failed");
                }
                Err(err)
            }
        }
    }

    fn do_stop_stream(&mut self, root: &Value) -> Result<bool> {
        let (stream_id, failed) = protocol::read_stop_stream_request(root)?;
        // the metadata entry survives: readers may still be listening
        self.session.stream_store()?.stop(stream_id, failed)?;
        self.reply(protocol::write_stop_stream_reply())
    }

    // -- status and maintenance ---------------------------------------------

    fn do_cluster_meta(&mut self, _root: &Value) -> Result<bool> {
        let info = self.session.meta.cluster_info();
        self.reply(protocol::write_cluster_meta_reply(&info))
    }

    fn do_instance_status(&mut self, _root: &Value) -> Result<bool> {
        let (usage, limit) = match self.session.store_type {
            StoreType::Default => {
                let bulk = self.session.bulk_store()?;
                (bulk.footprint(), bulk.footprint_limit())
            }
            StoreType::Plasma => {
                let plasma = self.session.plasma_store()?;
                (plasma.footprint(), plasma.footprint_limit())
            }
        };
        let status = json!({
            "instance_id": self.session.instance_id,
            "deployment": self.runner.config().deployment,
            "memory_usage": usage,
            "memory_limit": limit,
            "deferred_requests": self.session.meta.deferred_count(),
            "ipc_connections": self.session.alive_connections(),
            "rpc_connections": 0,
        });
        self.reply(protocol::write_instance_status_reply(&status))
    }

    /// Clear is a full wipe: every metadata tree goes, and every blob is
    /// force-freed irrespective of outstanding references.
    fn do_clear(&mut self, _root: &Value) -> Result<bool> {
        let meta_ids = self.session.meta.all_data_ids();
        let deleted = self.session.meta.del_data(&meta_ids, true, true)?;
        if let Some(bulk) = &self.session.bulk {
            for id in deleted.iter().filter(|id| id.is_blob()).copied() {
                let _ = bulk.on_delete(id);
            }
            for payload in bulk.list() {
                let _ = bulk.on_delete(payload.object_id);
            }
            metrics::record_memory_usage(self.session.instance_id, bulk.footprint());
        }
        self.reply(protocol::write_clear_reply())
    }

    fn do_debug(&mut self, _root: &Value) -> Result<bool> {
        self.reply(protocol::write_debug_reply(&json!({})))
    }
}
