//! The plasma-flavoured IPC client.
//!
//! Speaks to sessions whose bulk store is indexed by caller-supplied
//! content-addressable keys. The payload shape and the shared-memory
//! plumbing are the same as the default client's; only the id space and
//! the release semantics differ (a plasma payload is deleted when its
//! last reference drops).

use super::base::ClientBase;
use super::client::Buffer;
use super::shm::SharedMemoryManager;
use super::usage::{PlasmaUsageTracker, UsageAction};
use crate::error::{Error, Result};
use crate::memory::{ObjectID, PlasmaID, PlasmaPayload};
use crate::protocol::{self, StoreType};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;

/// A writable view of an unsealed plasma blob.
#[derive(Debug)]
pub struct PlasmaBufferWriter {
    plasma_id: PlasmaID,
    object_id: ObjectID,
    payload: PlasmaPayload,
    ptr: *mut u8,
    len: usize,
}

impl PlasmaBufferWriter {
    pub fn plasma_id(&self) -> &PlasmaID {
        &self.plasma_id
    }

    pub fn object_id(&self) -> ObjectID {
        self.object_id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn payload(&self) -> &PlasmaPayload {
        &self.payload
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the blob is unsealed, so this writer is the only
        // accessor; the mapping is kept alive by the owning client.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

unsafe impl Send for PlasmaBufferWriter {}

struct PlasmaInner {
    base: ClientBase,
    shm: SharedMemoryManager,
    usage: PlasmaUsageTracker,
}

/// A client of one plasma-store session.
pub struct PlasmaClient {
    inner: Mutex<PlasmaInner>,
}

impl PlasmaClient {
    /// Connect to the plasma session listening at `path` and register.
    pub fn connect(path: impl AsRef<Path>) -> Result<PlasmaClient> {
        let base = ClientBase::connect_unix(path.as_ref(), StoreType::Plasma)?;
        Ok(PlasmaClient {
            inner: Mutex::new(PlasmaInner {
                base,
                shm: SharedMemoryManager::default(),
                usage: PlasmaUsageTracker::default(),
            }),
        })
    }

    /// Allocate an unsealed blob registered under `plasma_id` and map it
    /// writable.
    pub fn create(
        &self,
        plasma_id: PlasmaID,
        size: usize,
        plasma_size: usize,
    ) -> Result<PlasmaBufferWriter> {
        let inner = &mut *self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_create_buffer_by_plasma_request(
                &plasma_id,
                size,
                plasma_size,
            ))?;
        let (object_id, payload, fd_sent) = protocol::read_create_buffer_by_plasma_reply(&root)?;

        let mut ptr = std::ptr::NonNull::<u8>::dangling().as_ptr();
        if payload.base.data_size > 0 {
            let fd_recv = inner.shm.pre_mmap(payload.base.store_fd);
            if fd_recv != fd_sent {
                return Err(Error::Invalid(
                    serde_json::json!({
                        "error": "create plasma buffer: the fd is not matched between client and server",
                        "fd_sent": fd_sent,
                        "fd_recv": fd_recv,
                        "response": root,
                    })
                    .to_string(),
                ));
            }
            let socket = inner.base.unix_socket()?;
            let base = inner.shm.mmap(
                socket,
                payload.base.store_fd,
                payload.base.object_id,
                payload.base.map_size,
                payload.base.data_size,
                payload.base.data_offset,
                false,
                false,
            )?;
            // SAFETY: the offset stays within the arena mapping
            ptr = unsafe { base.add(payload.base.data_offset) };
        }
        inner.usage.add_usage(plasma_id.clone(), payload.clone());
        Ok(PlasmaBufferWriter {
            plasma_id,
            object_id,
            len: payload.base.data_size,
            payload,
            ptr,
        })
    }

    /// Seal a plasma blob, making it immutable and shareable.
    pub fn seal(&self, plasma_id: &PlasmaID) -> Result<()> {
        let inner = &mut *self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_plasma_seal_request(plasma_id))?;
        protocol::read_seal_reply(&root)?;
        let _ = inner.usage.seal_usage(plasma_id);
        Ok(())
    }

    /// Fetch sealed plasma blobs as read-only views.
    ///
    /// The reply lists no fds; both ends walk the payloads in order and
    /// dedup by arena fd, so the ancillary reads line up.
    pub fn get_buffers(&self, plasma_ids: &[PlasmaID]) -> Result<HashMap<PlasmaID, Buffer>> {
        let inner = &mut *self.inner.lock();
        let mut known: HashMap<PlasmaID, PlasmaPayload> = HashMap::new();
        let mut missing: Vec<PlasmaID> = Vec::new();
        for plasma_id in plasma_ids {
            if known.contains_key(plasma_id) {
                continue;
            }
            match inner.usage.fetch_on_local(plasma_id) {
                Ok(payload) => {
                    known.insert(plasma_id.clone(), payload);
                }
                Err(_) => missing.push(plasma_id.clone()),
            }
        }

        if !missing.is_empty() {
            let root = inner
                .base
                .do_request(&protocol::write_get_buffers_by_plasma_request(
                    &missing, false,
                ))?;
            let payloads = protocol::read_get_buffers_by_plasma_reply(&root)?;
            for payload in payloads {
                known.insert(payload.plasma_id.clone(), payload);
            }
        }

        let mut buffers = HashMap::with_capacity(plasma_ids.len());
        for plasma_id in plasma_ids {
            let Some(payload) = known.get(plasma_id) else {
                continue;
            };
            if payload.base.data_size == 0 {
                continue;
            }
            let socket = inner.base.unix_socket()?;
            let base = inner.shm.mmap(
                socket,
                payload.base.store_fd,
                payload.base.object_id,
                payload.base.map_size,
                payload.base.data_size,
                payload.base.data_offset,
                true,
                false,
            )?;
            let buffer = Buffer::from_mapping(
                payload.base.object_id,
                // SAFETY: the offset stays within the arena mapping
                unsafe { base.add(payload.base.data_offset) } as *const u8,
                payload.base.data_size,
            );
            inner.usage.add_usage(plasma_id.clone(), payload.clone());
            buffers.insert(plasma_id.clone(), buffer);
        }
        Ok(buffers)
    }

    /// Drop one local reference; the last one issues the release upcall,
    /// upon which the server deletes the payload.
    pub fn release(&self, plasma_id: &PlasmaID) -> Result<()> {
        let inner = &mut *self.inner.lock();
        match inner.usage.remove_usage(plasma_id)? {
            UsageAction::StillInUse => Ok(()),
            UsageAction::Release => {
                let root = inner
                    .base
                    .do_request(&protocol::write_plasma_release_request(plasma_id))?;
                protocol::read_plasma_release_reply(&root)
            }
        }
    }

    /// Force-delete a plasma blob on the server.
    pub fn delete(&self, plasma_id: &PlasmaID) -> Result<()> {
        let inner = &mut *self.inner.lock();
        let root = inner
            .base
            .do_request(&protocol::write_plasma_del_data_request(plasma_id))?;
        protocol::read_plasma_del_data_reply(&root)?;
        inner.usage.delete_usage(plasma_id);
        Ok(())
    }

    pub fn connected(&self) -> bool {
        self.inner.lock().base.connected()
    }

    pub fn disconnect(&self) {
        self.inner.lock().base.disconnect();
    }
}
