//! Shared-memory arenas.
//!
//! An arena is a single contiguous mmap region owned by the server and
//! identified by its backing file descriptor. Anonymous arenas are created
//! with `memfd_create`, so they can be handed to clients over `SCM_RIGHTS`;
//! disk-backed arenas map a named file instead. Arenas are carved into
//! payloads by the allocator, never shrunk, and only unmapped at server
//! shutdown.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;

/// How the arena's bytes are backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaKind {
    /// Anonymous shared memory (`memfd_create`).
    Anonymous,
    /// A named file on disk.
    DiskBacked,
}

/// A contiguous mmap region owned by the server.
pub struct Arena {
    fd: OwnedFd,
    base: NonNull<u8>,
    size: usize,
    kind: ArenaKind,
}

impl Arena {
    /// Create an anonymous shared-memory arena of `size` bytes.
    ///
    /// The mapping reserves virtual address space immediately; physical
    /// pages are committed lazily as payloads are written.
    pub fn anonymous(name: &str, size: usize) -> Result<Arena> {
        if size == 0 {
            return Err(Error::Invalid("arena size must be greater than 0".into()));
        }
        let fd = rustix::fs::memfd_create(name, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;
        let base = Self::map(&fd, size)?;
        Ok(Arena {
            fd,
            base,
            size,
            kind: ArenaKind::Anonymous,
        })
    }

    /// Create an arena backed by a named file, creating or truncating it.
    pub fn disk_backed(path: &Path, size: usize) -> Result<Arena> {
        if size == 0 {
            return Err(Error::Invalid("arena size must be greater than 0".into()));
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size as u64)?;
        let fd = OwnedFd::from(file);
        let base = Self::map(&fd, size)?;
        Ok(Arena {
            fd,
            base,
            size,
            kind: ArenaKind::DiskBacked,
        })
    }

    fn map(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )?
        };
        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::NotEnoughMemory("mmap returned null".into()))
    }

    /// The raw value of the backing fd, stable for the arena's lifetime.
    #[inline]
    pub fn raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    /// The base address of the mapping.
    #[inline]
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Total size of the arena in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// How this arena is backed.
    #[inline]
    pub fn kind(&self) -> ArenaKind {
        self.kind
    }

    /// A byte slice over a payload range.
    ///
    /// # Safety
    ///
    /// The caller must ensure the range stays within the arena and that no
    /// conflicting mutable access exists.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.size);
        unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(offset), len) }
    }

    /// A mutable byte slice over a payload range.
    ///
    /// # Safety
    ///
    /// The caller must ensure the range stays within the arena and that it
    /// has exclusive access to it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.size);
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(offset), len) }
    }
}

impl AsFd for Arena {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.size);
        }
        // fd is closed when OwnedFd is dropped
    }
}

// SAFETY: the mapping is shared memory valid from any thread, and the fd is
// reference-counted by the kernel. No thread-local state is held.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_arena() {
        let arena = Arena::anonymous("arbor-test", 1 << 16).unwrap();
        assert_eq!(arena.size(), 1 << 16);
        assert_eq!(arena.kind(), ArenaKind::Anonymous);
        assert!(arena.raw_fd() >= 0);
        assert_ne!(arena.base(), 0);

        unsafe {
            arena.slice_mut(128, 4).copy_from_slice(b"abcd");
            assert_eq!(arena.slice(128, 4), b"abcd");
        }
    }

    #[test]
    fn test_zero_sized_arena_fails() {
        assert!(Arena::anonymous("arbor-test", 0).is_err());
    }

    #[test]
    fn test_disk_backed_arena() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.bin");
        let arena = Arena::disk_backed(&path, 4096).unwrap();
        assert_eq!(arena.kind(), ArenaKind::DiskBacked);
        unsafe {
            arena.slice_mut(0, 5).copy_from_slice(b"hello");
        }
        drop(arena);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
    }
}
