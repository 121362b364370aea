//! Client-side shared-memory manager.
//!
//! Caches one entry per distinct arena fd received from the server, maps
//! each arena at most once per (readonly, writable) view, and keeps an
//! interval table from mapped base addresses to object ids so a raw
//! pointer can be resolved back to the blob that contains it.

use crate::error::{Error, Result};
use crate::memory::{ObjectID, fdpass};
use rustix::fd::OwnedFd;
use rustix::mm::{MapFlags, ProtFlags};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::os::unix::net::UnixStream;
use std::ptr::NonNull;

/// Per-arena record: the received fd and its lazily created mappings.
#[derive(Debug)]
struct MmapEntry {
    fd: OwnedFd,
    length: usize,
    readonly: Option<NonNull<u8>>,
    writable: Option<NonNull<u8>>,
}

impl MmapEntry {
    /// `realign` compensates for an allocator that pads the map size by a
    /// word to restore page alignment.
    fn new(fd: OwnedFd, map_size: usize, realign: bool) -> MmapEntry {
        let length = if realign {
            map_size - std::mem::size_of::<usize>()
        } else {
            map_size
        };
        MmapEntry {
            fd,
            length,
            readonly: None,
            writable: None,
        }
    }

    fn map(&self, prot: ProtFlags) -> Result<NonNull<u8>> {
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                self.length,
                prot,
                MapFlags::SHARED,
                &self.fd,
                0,
            )?
        };
        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::Io(std::io::Error::other("mmap returned null")))
    }

    fn map_readonly(&mut self) -> Result<NonNull<u8>> {
        if let Some(ptr) = self.readonly {
            return Ok(ptr);
        }
        let ptr = self.map(ProtFlags::READ)?;
        self.readonly = Some(ptr);
        Ok(ptr)
    }

    fn map_writable(&mut self) -> Result<NonNull<u8>> {
        if let Some(ptr) = self.writable {
            return Ok(ptr);
        }
        let ptr = self.map(ProtFlags::READ | ProtFlags::WRITE)?;
        self.writable = Some(ptr);
        Ok(ptr)
    }
}

impl Drop for MmapEntry {
    fn drop(&mut self) {
        unsafe {
            if let Some(ptr) = self.readonly {
                let _ = rustix::mm::munmap(ptr.as_ptr().cast(), self.length);
            }
            if let Some(ptr) = self.writable {
                let _ = rustix::mm::munmap(ptr.as_ptr().cast(), self.length);
            }
        }
        // the received fd closes with the OwnedFd
    }
}

// SAFETY: the mapped pointers address shared memory kept alive by the
// fd they're derived from; access is serialized by the client's Mutex.
unsafe impl Send for MmapEntry {}

/// The per-client cache of received arenas and the segment interval map.
#[derive(Default, Debug)]
pub struct SharedMemoryManager {
    /// Keyed by the *server-side* fd value, which names the arena on the
    /// wire. The entry holds the client-side fd actually received.
    mmap_table: HashMap<i32, MmapEntry>,
    /// Mapped payload intervals: base address -> (size, id).
    segments: BTreeMap<usize, (usize, ObjectID)>,
}

impl SharedMemoryManager {
    /// Whether an fd receive must be scheduled for this arena: returns
    /// the fd when it is not yet known, -1 when the ancillary read must
    /// be skipped.
    pub fn pre_mmap(&self, store_fd: i32) -> i32 {
        if self.mmap_table.contains_key(&store_fd) {
            -1
        } else {
            store_fd
        }
    }

    /// Batched variant: append the fd to `fds` unless it is already
    /// known or already staged in `dedup`.
    pub fn pre_mmap_dedup(&self, store_fd: i32, fds: &mut Vec<i32>, dedup: &mut HashSet<i32>) {
        if !dedup.contains(&store_fd) && !self.mmap_table.contains_key(&store_fd) {
            fds.push(store_fd);
            dedup.insert(store_fd);
        }
    }

    /// Obtain the arena's mapping, receiving the fd over the socket on
    /// first contact, and record the payload's interval for pointer
    /// resolution. Returns the arena base pointer.
    #[allow(clippy::too_many_arguments)]
    pub fn mmap(
        &mut self,
        socket: &UnixStream,
        store_fd: i32,
        id: ObjectID,
        map_size: usize,
        data_size: usize,
        data_offset: usize,
        readonly: bool,
        realign: bool,
    ) -> Result<*mut u8> {
        let base = self.mmap_arena(socket, store_fd, map_size, readonly, realign)?;
        if id != ObjectID::INVALID && data_size > 0 {
            self.segments
                .insert(base as usize + data_offset, (data_size, id));
        }
        Ok(base)
    }

    /// Map an arena without registering a segment (used for whole-arena
    /// reservations).
    pub fn mmap_arena(
        &mut self,
        socket: &UnixStream,
        store_fd: i32,
        map_size: usize,
        readonly: bool,
        realign: bool,
    ) -> Result<*mut u8> {
        if !self.mmap_table.contains_key(&store_fd) {
            let received = fdpass::recv_fd(socket)?;
            self.mmap_table
                .insert(store_fd, MmapEntry::new(received, map_size, realign));
        }
        let entry = self.mmap_table.get_mut(&store_fd).expect("inserted above");
        let ptr = if readonly {
            entry.map_readonly()?
        } else {
            entry.map_writable()?
        };
        Ok(ptr.as_ptr())
    }

    /// Resolve a raw pointer to the blob containing it, via predecessor
    /// lookup over the segment intervals.
    pub fn exists(&self, target: usize) -> Option<ObjectID> {
        let (&base, &(size, id)) = self.segments.range(..=target).next_back()?;
        if base <= target && target < base + size {
            Some(id)
        } else {
            None
        }
    }

    /// Drop every mapping and segment. Outstanding buffer views become
    /// dangling, so this is only called on disconnect or explicit cache
    /// clears.
    pub fn clear(&mut self) {
        self.segments.clear();
        self.mmap_table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Arena;

    #[test]
    fn test_pre_mmap_reports_unknown_fds() {
        let manager = SharedMemoryManager::default();
        assert_eq!(manager.pre_mmap(5), 5);
    }

    #[test]
    fn test_pre_mmap_dedup() {
        let manager = SharedMemoryManager::default();
        let mut fds = Vec::new();
        let mut dedup = HashSet::new();
        manager.pre_mmap_dedup(4, &mut fds, &mut dedup);
        manager.pre_mmap_dedup(4, &mut fds, &mut dedup);
        manager.pre_mmap_dedup(9, &mut fds, &mut dedup);
        assert_eq!(fds, vec![4, 9]);
    }

    #[test]
    fn test_mmap_receives_fd_once_and_resolves_pointers() {
        let (server_side, client_side) = UnixStream::pair().unwrap();
        let arena = Arena::anonymous("shm-test", 1 << 16).unwrap();
        unsafe {
            arena.slice_mut(4096, 4).copy_from_slice(b"ping");
        }

        fdpass::send_fd(&server_side, &arena).unwrap();

        let mut manager = SharedMemoryManager::default();
        let id = ObjectID::from_pointer(arena.base() + 4096);
        let base = manager
            .mmap(&client_side, arena.raw_fd(), id, 1 << 16, 128, 4096, true, false)
            .unwrap();
        unsafe {
            assert_eq!(std::slice::from_raw_parts(base.add(4096), 4), b"ping");
        }

        // the fd is cached now; a second mmap performs no ancillary read
        assert_eq!(manager.pre_mmap(arena.raw_fd()), -1);
        let again = manager
            .mmap(&client_side, arena.raw_fd(), id, 1 << 16, 128, 4096, true, false)
            .unwrap();
        assert_eq!(base, again);

        // pointer resolution over the recorded interval
        let inside = base as usize + 4096;
        assert_eq!(manager.exists(inside), Some(id));
        assert_eq!(manager.exists(inside + 127), Some(id));
        assert_eq!(manager.exists(inside + 128), None);
        assert_eq!(manager.exists(base as usize), None);
    }

    #[test]
    fn test_exists_on_empty_table() {
        let manager = SharedMemoryManager::default();
        assert_eq!(manager.exists(0x1234), None);
    }

    #[test]
    fn test_readonly_and_writable_views_are_distinct() {
        let (server_side, client_side) = UnixStream::pair().unwrap();
        let arena = Arena::anonymous("shm-views", 1 << 16).unwrap();
        fdpass::send_fd(&server_side, &arena).unwrap();

        let mut manager = SharedMemoryManager::default();
        let ro = manager
            .mmap_arena(&client_side, arena.raw_fd(), 1 << 16, true, false)
            .unwrap();
        let rw = manager
            .mmap_arena(&client_side, arena.raw_fd(), 1 << 16, false, false)
            .unwrap();
        assert_ne!(ro, rw);

        // a write through the writable view is visible through both
        unsafe {
            *rw = 42;
            assert_eq!(*ro, 42);
        }
    }
}
