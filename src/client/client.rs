//! The IPC client.
//!
//! Connects to a session's Unix socket, exchanges framed JSON messages,
//! receives arena fds out-of-band, and exposes blobs as slices over the
//! shared mapping. One mutex serializes the socket, the mmap cache and
//! the usage tracker; public methods lock once and drive the lock-free
//! inner state, so nested operations never re-enter the lock.

use super::base::ClientBase;
use super::shm::SharedMemoryManager;
use super::usage::{ObjectUsageTracker, UsageAction};
use crate::error::{Error, Result};
use crate::memory::{InstanceID, ObjectID, Payload, SessionID};
use crate::protocol::{self, MoveOwnership, StoreType};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// A read-only view of a sealed blob.
///
/// The view borrows the client's cached mapping: it stays valid until the
/// client drops or its cache is cleared explicitly.
#[derive(Debug)]
pub struct Buffer {
    id: ObjectID,
    ptr: *const u8,
    len: usize,
}

impl Buffer {
    pub(crate) fn from_mapping(id: ObjectID, ptr: *const u8, len: usize) -> Buffer {
        Buffer { id, ptr, len }
    }

    fn empty(id: ObjectID) -> Buffer {
        Buffer {
            id,
            ptr: std::ptr::NonNull::<u8>::dangling().as_ptr(),
            len: 0,
        }
    }

    pub fn id(&self) -> ObjectID {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the pointer addresses `len` bytes of a mapping the
        // client keeps alive; the blob is sealed, so no writer exists.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

// SAFETY: the view is read-only over shared memory kept mapped by the
// owning client.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

/// A writable view of an unsealed blob, valid until it is sealed.
#[derive(Debug)]
pub struct BufferWriter {
    id: ObjectID,
    payload: Payload,
    ptr: *mut u8,
    len: usize,
}

impl BufferWriter {
    pub fn id(&self) -> ObjectID {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the blob is unsealed, so this writer is the only
        // accessor; the mapping is kept alive by the owning client.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

unsafe impl Send for BufferWriter {}

fn fd_mismatch(operation: &str, fd_sent: i32, fd_recv: i32, response: &Value) -> Error {
    Error::Invalid(
        serde_json::json!({
            "error": format!("{operation}: the fd is not matched between client and server"),
            "fd_sent": fd_sent,
            "fd_recv": fd_recv,
            "response": response,
        })
        .to_string(),
    )
}

#[derive(Debug)]
struct ClientInner {
    base: ClientBase,
    shm: SharedMemoryManager,
    usage: ObjectUsageTracker,
}

/// A client of one default-store session.
#[derive(Debug)]
pub struct Client {
    inner: Mutex<ClientInner>,
}

impl Client {
    /// Connect to the session listening at `path` and register.
    pub fn connect(path: impl AsRef<Path>) -> Result<Client> {
        let base = ClientBase::connect_unix(path.as_ref(), StoreType::Default)?;
        Ok(Client {
            inner: Mutex::new(ClientInner {
                base,
                shm: SharedMemoryManager::default(),
                usage: ObjectUsageTracker::default(),
            }),
        })
    }

    /// Reconnect to the same socket path with fresh client state.
    ///
    /// Only the socket path carries over: per-id usage counts are not
    /// replicated, which callers may observe through release timing.
    pub fn fork(&self) -> Result<Client> {
        let path = self.inner.lock().base.ipc_socket.clone();
        Client::connect(path)
    }

    pub fn instance_id(&self) -> InstanceID {
        self.inner.lock().base.instance_id
    }

    pub fn session_id(&self) -> SessionID {
        self.inner.lock().base.session_id
    }

    pub fn rpc_endpoint(&self) -> String {
        self.inner.lock().base.rpc_endpoint.clone()
    }

    pub fn connected(&self) -> bool {
        self.inner.lock().base.connected()
    }

    // -- blobs ---------------------------------------------------------------

    /// Allocate an unsealed blob of exactly `size` bytes and map it
    /// writable.
    pub fn create_buffer(&self, size: usize) -> Result<BufferWriter> {
        self.inner.lock().create_buffer(size)
    }

    /// Allocate a blob backed by a named file on the server's disk.
    pub fn create_disk_buffer(&self, size: usize, path: &str) -> Result<BufferWriter> {
        self.inner.lock().create_disk_buffer(size, path)
    }

    /// Seal a blob, making it immutable and shareable.
    pub fn seal(&self, id: ObjectID) -> Result<()> {
        self.inner.lock().seal(id)
    }

    /// Fetch sealed blobs as read-only views, mapping arenas on first
    /// contact.
    pub fn get_buffers(&self, ids: &[ObjectID]) -> Result<HashMap<ObjectID, Buffer>> {
        self.inner.lock().get_buffers(ids, false)
    }

    /// Like [`Client::get_buffers`], but unsealed blobs are returned too.
    pub fn get_buffers_unsafe(&self, ids: &[ObjectID]) -> Result<HashMap<ObjectID, Buffer>> {
        self.inner.lock().get_buffers(ids, true)
    }

    /// Drop one local reference; the last one issues the release upcall.
    pub fn release(&self, id: ObjectID) -> Result<()> {
        self.inner.lock().release(id)
    }

    /// Force-delete a blob on the server, ignoring reference counts.
    pub fn drop_buffer(&self, id: ObjectID) -> Result<()> {
        self.inner.lock().drop_buffer(id)
    }

    pub fn is_in_use(&self, id: ObjectID) -> Result<bool> {
        let mut inner = self.inner.lock();
        let root = inner.base.do_request(&protocol::write_is_in_use_request(id))?;
        protocol::read_is_in_use_reply(&root)
    }

    pub fn is_spilled(&self, id: ObjectID) -> Result<bool> {
        let mut inner = self.inner.lock();
        let root = inner.base.do_request(&protocol::write_is_spilled_request(id))?;
        protocol::read_is_spilled_reply(&root)
    }

    /// Mirror local references on the server, batched.
    pub fn increase_reference_count(&self, ids: &[ObjectID]) -> Result<()> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_increase_reference_count_request(ids))?;
        protocol::read_increase_reference_count_reply(&root)
    }

    /// Resolve a raw pointer back to the blob containing it, if any.
    pub fn is_shared_memory(&self, pointer: usize) -> Option<ObjectID> {
        self.inner.lock().shm.exists(pointer)
    }

    // -- external arenas -----------------------------------------------------

    /// Pre-reserve a whole arena for a user-space allocator. Returns
    /// `(fd, size, base, space)`: `base` is the server-side address the
    /// blob ids are derived from, `space` the arena mapped writable in
    /// this process.
    pub fn create_arena(&self, size: usize) -> Result<(i32, usize, usize, usize)> {
        let inner = &mut *self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_make_arena_request(size))?;
        let (fd, available, base) = protocol::read_make_arena_reply(&root)?;
        let socket = inner.base.unix_socket()?;
        let space = inner.shm.mmap_arena(socket, fd, available, false, false)?;
        Ok((fd, available, base, space as usize))
    }

    /// Report the carving of a pre-reserved arena back to the server.
    pub fn release_arena(&self, fd: i32, offsets: &[usize], sizes: &[usize]) -> Result<()> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_finalize_arena_request(fd, offsets, sizes))?;
        protocol::read_finalize_arena_reply(&root)
    }

    // -- sessions ------------------------------------------------------------

    /// Ask the root session to spawn a new session; returns its socket
    /// path.
    pub fn new_session(&self, store_type: StoreType) -> Result<String> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_new_session_request(store_type))?;
        protocol::read_new_session_reply(&root)
    }

    /// Delete the session this client is connected to. The connection is
    /// unusable afterwards.
    pub fn delete_session(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_delete_session_request())?;
        protocol::read_delete_session_reply(&root)?;
        inner.base.disconnect();
        Ok(())
    }

    /// Hand payloads over to this client's session from `source_session`,
    /// re-keying each source id to the paired target id. Zero-copy: the
    /// bytes and their arena stay in place.
    pub fn move_buffers_ownership(
        &self,
        mapping: &[(ObjectID, ObjectID)],
        source_session: SessionID,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let request = MoveOwnership {
            id_to_id: mapping.to_vec(),
            session_id: source_session,
            ..MoveOwnership::default()
        };
        let root = inner
            .base
            .do_request(&protocol::write_move_buffers_ownership_request(&request))?;
        protocol::read_move_buffers_ownership_reply(&root)
    }

    // -- names ---------------------------------------------------------------

    pub fn put_name(&self, id: ObjectID, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_put_name_request(id, name))?;
        protocol::read_put_name_reply(&root)
    }

    /// Resolve a name. With `wait`, the call blocks until another client
    /// publishes the name.
    pub fn get_name(&self, name: &str, wait: bool) -> Result<ObjectID> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_get_name_request(name, wait))?;
        protocol::read_get_name_reply(&root)
    }

    pub fn drop_name(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_drop_name_request(name))?;
        protocol::read_drop_name_reply(&root)
    }

    // -- metadata ------------------------------------------------------------

    /// Register a composite metadata tree. Returns (id, signature,
    /// instance id).
    pub fn create_data(&self, content: &Value) -> Result<(ObjectID, u64, InstanceID)> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_create_data_request(content))?;
        protocol::read_create_data_reply(&root)
    }

    pub fn get_data(&self, ids: &[ObjectID], sync_remote: bool, wait: bool) -> Result<Value> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_get_data_request(ids, sync_remote, wait))?;
        protocol::read_get_data_reply(&root)
    }

    pub fn list_data(&self, pattern: &str, regex: bool, limit: usize) -> Result<Value> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_list_data_request(pattern, regex, limit))?;
        protocol::read_get_data_reply(&root)
    }

    pub fn persist(&self, id: ObjectID) -> Result<()> {
        let mut inner = self.inner.lock();
        let root = inner.base.do_request(&protocol::write_persist_request(id))?;
        protocol::read_persist_reply(&root)
    }

    pub fn if_persist(&self, id: ObjectID) -> Result<bool> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_if_persist_request(id))?;
        protocol::read_if_persist_reply(&root)
    }

    pub fn exists(&self, id: ObjectID) -> Result<bool> {
        let mut inner = self.inner.lock();
        let root = inner.base.do_request(&protocol::write_exists_request(id))?;
        protocol::read_exists_reply(&root)
    }

    pub fn shallow_copy(&self, id: ObjectID, extra: &Value) -> Result<ObjectID> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_shallow_copy_request(id, extra))?;
        protocol::read_shallow_copy_reply(&root)
    }

    /// Delete composite objects (and, with `deep`, their members).
    pub fn del_data(&self, ids: &[ObjectID], force: bool, deep: bool) -> Result<()> {
        let inner = &mut *self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_del_data_request(ids, force, deep, false))?;
        protocol::read_del_data_reply(&root)?;
        for id in ids {
            inner.usage.delete_usage(id);
        }
        Ok(())
    }

    /// Like [`Client::del_data`], returning the blob ids the server
    /// actually freed.
    pub fn del_data_with_feedbacks(
        &self,
        ids: &[ObjectID],
        force: bool,
        deep: bool,
    ) -> Result<Vec<ObjectID>> {
        let inner = &mut *self.inner.lock();
        let root = inner.base.do_request(
            &protocol::write_del_data_with_feedbacks_request(ids, force, deep, false),
        )?;
        let deleted = protocol::read_del_data_with_feedbacks_reply(&root)?;
        for id in &deleted {
            inner.usage.delete_usage(id);
        }
        Ok(deleted)
    }

    // -- streams -------------------------------------------------------------

    pub fn create_stream(&self, stream_id: ObjectID) -> Result<()> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_create_stream_request(stream_id))?;
        protocol::read_create_stream_reply(&root)
    }

    pub fn open_stream(&self, stream_id: ObjectID, mode: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_open_stream_request(stream_id, mode))?;
        protocol::read_open_stream_reply(&root)
    }

    /// Ask the stream store for the next writable chunk of `size` bytes.
    pub fn get_next_stream_chunk(&self, stream_id: ObjectID, size: usize) -> Result<BufferWriter> {
        self.inner.lock().get_next_stream_chunk(stream_id, size)
    }

    pub fn push_next_stream_chunk(&self, stream_id: ObjectID, chunk: ObjectID) -> Result<()> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_push_next_stream_chunk_request(
                stream_id, chunk,
            ))?;
        protocol::read_push_next_stream_chunk_reply(&root)
    }

    /// Block until the stream's next chunk is ready and return its id.
    pub fn pull_next_stream_chunk(&self, stream_id: ObjectID) -> Result<ObjectID> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_pull_next_stream_chunk_request(stream_id))?;
        protocol::read_pull_next_stream_chunk_reply(&root)
    }

    pub fn stop_stream(&self, stream_id: ObjectID, failed: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_stop_stream_request(stream_id, failed))?;
        protocol::read_stop_stream_reply(&root)
    }

    // -- status and maintenance ---------------------------------------------

    pub fn instance_status(&self) -> Result<Value> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_instance_status_request())?;
        protocol::read_instance_status_reply(&root)
    }

    pub fn cluster_meta(&self) -> Result<Value> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_cluster_meta_request())?;
        protocol::read_cluster_meta_reply(&root)
    }

    /// Wipe the session's store: every metadata tree and every blob,
    /// including blobs other connections still reference.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let root = inner.base.do_request(&protocol::write_clear_request())?;
        protocol::read_clear_reply(&root)
    }

    pub fn debug(&self, payload: &Value) -> Result<Value> {
        let mut inner = self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_debug_request(payload))?;
        protocol::read_debug_reply(&root)
    }

    /// Drop all cached mappings and usage entries. Outstanding views
    /// become invalid.
    pub fn clear_cache(&self) {
        let mut inner = self.inner.lock();
        inner.usage.clear();
        inner.shm.clear();
    }

    /// Disconnect from the server; further calls fail.
    pub fn disconnect(&self) {
        self.inner.lock().base.disconnect();
    }
}

impl ClientInner {
    fn create_buffer(&mut self, size: usize) -> Result<BufferWriter> {
        let root = self
            .base
            .do_request(&protocol::write_create_buffer_request(size))?;
        let (id, payload, fd_sent) = protocol::read_create_buffer_reply(&root)?;
        if payload.data_size != size {
            return Err(Error::Invalid(format!(
                "the created buffer has {} bytes, expected {size}",
                payload.data_size
            )));
        }
        self.map_writable("create buffer", &root, id, payload, fd_sent)
    }

    fn create_disk_buffer(&mut self, size: usize, path: &str) -> Result<BufferWriter> {
        let root = self
            .base
            .do_request(&protocol::write_create_disk_buffer_request(size, path))?;
        let (id, payload, fd_sent) = protocol::read_create_disk_buffer_reply(&root)?;
        self.map_writable("create disk buffer", &root, id, payload, fd_sent)
    }

    /// Map a freshly created payload writable and take a usage reference.
    fn map_writable(
        &mut self,
        operation: &str,
        root: &Value,
        id: ObjectID,
        payload: Payload,
        fd_sent: i32,
    ) -> Result<BufferWriter> {
        let mut ptr = std::ptr::NonNull::<u8>::dangling().as_ptr();
        if payload.data_size > 0 {
            let fd_recv = self.shm.pre_mmap(payload.store_fd);
            if fd_recv != fd_sent {
                return Err(fd_mismatch(operation, fd_sent, fd_recv, root));
            }
            let socket = self.base.unix_socket()?;
            let base = self.shm.mmap(
                socket,
                payload.store_fd,
                id,
                payload.map_size,
                payload.data_size,
                payload.data_offset,
                false,
                false,
            )?;
            // SAFETY: the offset stays within the arena mapping
            ptr = unsafe { base.add(payload.data_offset) };
        }
        if id != ObjectID::EMPTY_BLOB {
            self.usage.add_usage(id, payload.clone());
        }
        Ok(BufferWriter {
            id,
            len: payload.data_size,
            payload,
            ptr,
        })
    }

    fn seal(&mut self, id: ObjectID) -> Result<()> {
        let root = self.base.do_request(&protocol::write_seal_request(id))?;
        protocol::read_seal_reply(&root)?;
        let _ = self.usage.seal_usage(&id);
        Ok(())
    }

    fn get_buffers(
        &mut self,
        ids: &[ObjectID],
        unsafe_get: bool,
    ) -> Result<HashMap<ObjectID, Buffer>> {
        let mut known: HashMap<ObjectID, Payload> = HashMap::new();
        let mut missing: Vec<ObjectID> = Vec::new();
        for id in ids {
            if known.contains_key(id) {
                continue;
            }
            match self.usage.fetch_on_local(id) {
                Ok(payload) => {
                    known.insert(*id, payload);
                }
                Err(_) => missing.push(*id),
            }
        }

        if !missing.is_empty() {
            let root = self
                .base
                .do_request(&protocol::write_get_buffers_request(&missing, unsafe_get))?;
            let (payloads, fds_sent) = protocol::read_get_buffers_reply(&root)?;

            // cross-check the announced fds against what this client
            // still needs; a mismatch would desynchronize the ancillary
            // stream
            let mut expected = Vec::new();
            let mut dedup = HashSet::new();
            for payload in &payloads {
                if payload.data_size > 0 {
                    self.shm
                        .pre_mmap_dedup(payload.store_fd, &mut expected, &mut dedup);
                }
            }
            if expected != fds_sent {
                return Err(Error::Invalid(
                    serde_json::json!({
                        "error": "get buffers: the fd lists do not match",
                        "fd_expected": expected,
                        "fd_sent": fds_sent,
                        "response": root,
                    })
                    .to_string(),
                ));
            }

            for payload in payloads {
                known.insert(payload.object_id, payload);
            }
        }

        let mut buffers = HashMap::with_capacity(ids.len());
        for id in ids {
            let Some(payload) = known.get(id) else { continue };
            if payload.data_size == 0 {
                buffers.insert(*id, Buffer::empty(*id));
                continue;
            }
            let socket = self.base.unix_socket()?;
            let base = self.shm.mmap(
                socket,
                payload.store_fd,
                payload.object_id,
                payload.map_size,
                payload.data_size,
                payload.data_offset,
                true,
                false,
            )?;
            // SAFETY: the offset stays within the arena mapping
            let ptr = unsafe { base.add(payload.data_offset) } as *const u8;
            if *id != ObjectID::EMPTY_BLOB {
                self.usage.add_usage(*id, payload.clone());
            }
            buffers.insert(
                *id,
                Buffer {
                    id: *id,
                    ptr,
                    len: payload.data_size,
                },
            );
        }
        Ok(buffers)
    }

    fn release(&mut self, id: ObjectID) -> Result<()> {
        if id == ObjectID::EMPTY_BLOB {
            return Ok(());
        }
        match self.usage.remove_usage(&id)? {
            UsageAction::StillInUse => Ok(()),
            UsageAction::Release => {
                let root = self.base.do_request(&protocol::write_release_request(id))?;
                protocol::read_release_reply(&root)
            }
        }
    }

    fn drop_buffer(&mut self, id: ObjectID) -> Result<()> {
        let root = self
            .base
            .do_request(&protocol::write_drop_buffer_request(id))?;
        protocol::read_drop_buffer_reply(&root)?;
        self.usage.delete_usage(&id);
        Ok(())
    }

    fn get_next_stream_chunk(&mut self, stream_id: ObjectID, size: usize) -> Result<BufferWriter> {
        let root = self
            .base
            .do_request(&protocol::write_get_next_stream_chunk_request(
                stream_id, size,
            ))?;
        let (payload, fd_sent) = protocol::read_get_next_stream_chunk_reply(&root)?;
        if payload.data_size != size {
            return Err(Error::Invalid(format!(
                "the next chunk has {} bytes, expected {size}",
                payload.data_size
            )));
        }
        let mut ptr = std::ptr::NonNull::<u8>::dangling().as_ptr();
        if payload.data_size > 0 {
            let fd_recv = self.shm.pre_mmap(payload.store_fd);
            if fd_recv != fd_sent {
                return Err(fd_mismatch("get next stream chunk", fd_sent, fd_recv, &root));
            }
            let socket = self.base.unix_socket()?;
            let base = self.shm.mmap(
                socket,
                payload.store_fd,
                payload.object_id,
                payload.map_size,
                payload.data_size,
                payload.data_offset,
                false,
                false,
            )?;
            // SAFETY: the offset stays within the arena mapping
            ptr = unsafe { base.add(payload.data_offset) };
        }
        Ok(BufferWriter {
            id: payload.object_id,
            len: payload.data_size,
            payload,
            ptr,
        })
    }
}
