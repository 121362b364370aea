//! Payload allocation inside store-owned arenas.
//!
//! The allocator carves mmap-backed arenas into payload slots with a
//! first-fit free list per arena, and records `(fd, map_size, offset)` for
//! each allocation so the connection handler can describe it to clients.
//! Arenas are grown on demand: when no existing region can satisfy a
//! request and the footprint ceiling leaves room, another mmap region is
//! requested from the kernel. Regions are never shrunk and never returned
//! to the OS while the server is running.
//!
//! Two allocator variants are supported, selected by configuration; they
//! share the free-list core and differ in block granularity.

use super::arena::Arena;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashMap};

/// Default chunk size for on-demand arena growth.
const ARENA_CHUNK_SIZE: usize = 256 << 20;

/// Which allocator variant carves the arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocatorKind {
    /// dlmalloc-style carving with 64-byte blocks.
    #[default]
    Dlmalloc,
    /// mimalloc-style carving with 8-byte blocks.
    Mimalloc,
}

impl AllocatorKind {
    /// Allocation granularity in bytes. Every payload size is rounded up
    /// to a multiple of this.
    #[inline]
    pub fn block_size(&self) -> usize {
        match self {
            AllocatorKind::Dlmalloc => 64,
            AllocatorKind::Mimalloc => 8,
        }
    }
}

impl std::str::FromStr for AllocatorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<AllocatorKind> {
        match s {
            "dlmalloc" => Ok(AllocatorKind::Dlmalloc),
            "mimalloc" => Ok(AllocatorKind::Mimalloc),
            other => Err(Error::Invalid(format!("unknown allocator: {other}"))),
        }
    }
}

/// The location of one carved payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Server-side virtual address of the payload.
    pub pointer: usize,
    /// Backing arena fd.
    pub store_fd: i32,
    /// Size of the backing arena.
    pub map_size: usize,
    /// Offset of the payload within the arena.
    pub data_offset: usize,
}

/// One growable region with its free list, keyed by offset.
struct Region {
    arena: Arena,
    /// Free ranges: offset -> length. Adjacent ranges are coalesced on free.
    free: BTreeMap<usize, usize>,
}

impl Region {
    fn new(arena: Arena) -> Region {
        let mut free = BTreeMap::new();
        free.insert(0, arena.size());
        Region { arena, free }
    }

    /// First-fit search. Returns the offset on success.
    fn carve(&mut self, size: usize) -> Option<usize> {
        let (&offset, &len) = self.free.iter().find(|(_, &len)| len >= size)?;
        self.free.remove(&offset);
        if len > size {
            self.free.insert(offset + size, len - size);
        }
        Some(offset)
    }

    /// Return a range to the free list, merging with its neighbours.
    fn reclaim(&mut self, offset: usize, size: usize) {
        let mut start = offset;
        let mut len = size;
        // merge with the predecessor if it ends exactly at `start`
        if let Some((&prev_off, &prev_len)) = self.free.range(..start).next_back() {
            if prev_off + prev_len == start {
                self.free.remove(&prev_off);
                start = prev_off;
                len += prev_len;
            }
        }
        // merge with the successor if it begins exactly at the end
        if let Some(&next_len) = self.free.get(&(start + len)) {
            self.free.remove(&(start + len));
            len += next_len;
        }
        self.free.insert(start, len);
    }
}

/// The arena set and its carving state.
///
/// Not internally synchronized; the bulk store serializes access.
pub struct ArenaAllocator {
    kind: AllocatorKind,
    limit: usize,
    allocated: usize,
    sequence: u64,
    regions: Vec<Region>,
    /// Whole arenas pre-reserved for external user-space allocators,
    /// keyed by fd, waiting to be finalized.
    external: HashMap<i32, Arena>,
    /// Arenas whose layout is owned elsewhere (finalized external arenas,
    /// disk-backed buffers). Kept alive until shutdown.
    pinned: Vec<Arena>,
}

impl ArenaAllocator {
    /// Create an allocator with the given variant and footprint ceiling.
    pub fn new(kind: AllocatorKind, limit: usize) -> ArenaAllocator {
        ArenaAllocator {
            kind,
            limit,
            allocated: 0,
            sequence: 0,
            regions: Vec::new(),
            external: HashMap::new(),
            pinned: Vec::new(),
        }
    }

    /// Bytes currently carved out of the arenas.
    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// The configured footprint ceiling.
    #[inline]
    pub fn footprint_limit(&self) -> usize {
        self.limit
    }

    fn round_up(&self, size: usize) -> usize {
        let block = self.kind.block_size();
        size.div_ceil(block) * block
    }

    fn next_arena_name(&mut self) -> String {
        self.sequence += 1;
        format!("arbor-arena-{}", self.sequence)
    }

    /// Carve a payload of exactly `size` bytes (rounded up internally to
    /// the block granularity; the caller keeps using `size`).
    ///
    /// Fails with [`Error::NotEnoughMemory`] when the ceiling is reached
    /// or no region can be grown to fit the request.
    pub fn allocate(&mut self, size: usize) -> Result<Allocation> {
        let rounded = self.round_up(size);
        if self.allocated + rounded > self.limit {
            return Err(Error::NotEnoughMemory(format!(
                "allocating {} bytes would exceed the limit: {} in use of {}",
                rounded, self.allocated, self.limit
            )));
        }

        for region in &mut self.regions {
            if let Some(offset) = region.carve(rounded) {
                self.allocated += rounded;
                return Ok(Allocation {
                    pointer: region.arena.base() + offset,
                    store_fd: region.arena.raw_fd(),
                    map_size: region.arena.size(),
                    data_offset: offset,
                });
            }
        }

        // grow: request another region large enough for this payload
        let chunk = rounded.max(ARENA_CHUNK_SIZE.min(self.limit));
        let name = self.next_arena_name();
        let arena = Arena::anonymous(&name, chunk)?;
        let mut region = Region::new(arena);
        let offset = region
            .carve(rounded)
            .expect("fresh region always fits its own request");
        let allocation = Allocation {
            pointer: region.arena.base() + offset,
            store_fd: region.arena.raw_fd(),
            map_size: region.arena.size(),
            data_offset: offset,
        };
        self.regions.push(region);
        self.allocated += rounded;
        Ok(allocation)
    }

    /// Return a payload's bytes to its region's free list.
    ///
    /// Allocations from pinned arenas (disk-backed or finalized external
    /// ones) are not carved from a free list and do not count toward the
    /// footprint, so freeing them is a no-op here.
    pub fn free(&mut self, allocation: &Allocation, size: usize) {
        let rounded = self.round_up(size);
        if let Some(region) = self
            .regions
            .iter_mut()
            .find(|r| r.arena.raw_fd() == allocation.store_fd)
        {
            region.reclaim(allocation.data_offset, rounded);
            self.allocated = self.allocated.saturating_sub(rounded);
        }
    }

    /// Create a dedicated disk-backed arena holding a single payload.
    /// Disk arenas live outside the shared-memory footprint.
    pub fn allocate_disk(&mut self, size: usize, path: &std::path::Path) -> Result<Allocation> {
        let arena = Arena::disk_backed(path, size)?;
        let allocation = Allocation {
            pointer: arena.base(),
            store_fd: arena.raw_fd(),
            map_size: arena.size(),
            data_offset: 0,
        };
        self.pinned.push(arena);
        Ok(allocation)
    }

    /// Pre-reserve a whole arena for an external user-space allocator.
    /// Returns `(fd, base)`; the caller later reports its carving through
    /// [`ArenaAllocator::take_external`].
    pub fn make_arena(&mut self, size: usize) -> Result<(i32, usize)> {
        let name = self.next_arena_name();
        let arena = Arena::anonymous(&name, size)?;
        let fd = arena.raw_fd();
        let base = arena.base();
        self.external.insert(fd, arena);
        Ok((fd, base))
    }

    /// Detach a pre-reserved arena for finalization. The arena stays
    /// mapped (moved into the pinned set) and its `(base, size)` is
    /// returned so the store can register the carved payloads.
    pub fn take_external(&mut self, fd: i32) -> Result<(usize, usize)> {
        let arena = self.external.remove(&fd).ok_or_else(|| {
            Error::ObjectNotExists(format!("arena for fd {fd} cannot be found"))
        })?;
        let info = (arena.base(), arena.size());
        self.pinned.push(arena);
        Ok(info)
    }
}
