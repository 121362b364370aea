//! The server-side bulk store.
//!
//! Owns the lifecycle of payloads: create → seal → release → delete.
//! Two instantiations share one generic core: the default store indexed
//! by [`ObjectID`] and the plasma store indexed by caller-supplied
//! [`PlasmaID`]s. Server-side reachability is tracked as per-connection
//! dependency sets, decoupled from the advisory reference counts each
//! client keeps for itself.
//!
//! The default store additionally evicts cold payloads to disk: when the
//! footprint crosses the high watermark, sealed payloads that no
//! connection references are written out in least-recently-used order
//! until the low watermark is reached. A spilled payload is transparently
//! reloaded on the next `get`.

use crate::error::{Error, Result};
use crate::memory::{
    Allocation, AllocatorKind, ArenaAllocator, ObjectID, Payload, PlasmaID, PlasmaPayload,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Connection identifier used to key dependency sets.
pub type ConnId = u64;

/// Capability set a payload exposes to the generic store core.
pub trait StorePayload: Clone + std::fmt::Debug {
    /// The id space this payload is indexed under.
    type Id: Clone + Eq + Hash + std::fmt::Debug + std::fmt::Display;

    /// The id of this payload in its own index.
    fn id(&self) -> Self::Id;
    /// The underlying payload shape.
    fn base(&self) -> &Payload;
    /// Mutable access to the underlying payload shape.
    fn base_mut(&mut self) -> &mut Payload;
    /// The descriptor of the reserved zero-byte blob.
    fn make_empty() -> Self;
    /// Whether the id denotes the empty blob or the invalid sentinel,
    /// which never reach the object index.
    fn is_reserved_id(id: &Self::Id) -> bool;
}

impl StorePayload for Payload {
    type Id = ObjectID;

    fn id(&self) -> ObjectID {
        self.object_id
    }

    fn base(&self) -> &Payload {
        self
    }

    fn base_mut(&mut self) -> &mut Payload {
        self
    }

    fn make_empty() -> Payload {
        Payload::make_empty()
    }

    fn is_reserved_id(id: &ObjectID) -> bool {
        *id == ObjectID::EMPTY_BLOB || *id == ObjectID::INVALID
    }
}

impl StorePayload for PlasmaPayload {
    type Id = PlasmaID;

    fn id(&self) -> PlasmaID {
        self.plasma_id.clone()
    }

    fn base(&self) -> &Payload {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Payload {
        &mut self.base
    }

    fn make_empty() -> PlasmaPayload {
        PlasmaPayload::make_empty()
    }

    fn is_reserved_id(id: &PlasmaID) -> bool {
        id.0.is_empty()
    }
}

/// The generic object index and dependency bookkeeping shared by both
/// store flavours. Not internally synchronized; the owning store wraps
/// it in a mutex.
struct StoreCore<P: StorePayload> {
    objects: HashMap<P::Id, P>,
    dependencies: HashMap<ConnId, HashSet<P::Id>>,
    allocator: ArenaAllocator,
}

impl<P: StorePayload> StoreCore<P> {
    fn new(allocator: ArenaAllocator) -> StoreCore<P> {
        StoreCore {
            objects: HashMap::new(),
            dependencies: HashMap::new(),
            allocator,
        }
    }

    fn seal(&mut self, id: &P::Id) -> Result<()> {
        if P::is_reserved_id(id) {
            return Ok(());
        }
        match self.objects.get_mut(id) {
            Some(payload) => {
                payload.base_mut().is_sealed = true;
                Ok(())
            }
            None => Err(Error::ObjectNotExists(format!("seal: id = {id}"))),
        }
    }

    fn exists(&self, id: &P::Id) -> bool {
        self.objects.contains_key(id)
    }

    fn is_in_use(&self, id: &P::Id) -> bool {
        self.objects
            .get(id)
            .map(|payload| payload.base().ref_cnt > 0)
            .unwrap_or(false)
    }

    /// Bind each id to the connection, bumping the server-side reference
    /// count once per (connection, id) pair.
    ///
    /// Returns the ids that were newly bound.
    fn add_dependency(&mut self, ids: &[P::Id], conn: ConnId) -> Result<Vec<P::Id>> {
        let mut bound = Vec::new();
        for id in ids {
            if P::is_reserved_id(id) {
                continue;
            }
            if !self.objects.contains_key(id) {
                return Err(Error::ObjectNotExists(format!("add dependency: id = {id}")));
            }
            let entry = self.dependencies.entry(conn).or_default();
            if entry.insert(id.clone()) {
                if let Some(payload) = self.objects.get_mut(id) {
                    payload.base_mut().ref_cnt += 1;
                }
                bound.push(id.clone());
            }
        }
        Ok(bound)
    }

    /// Remove one dependency. Returns true when the payload dropped to
    /// zero references and is now eligible for reclamation.
    fn remove_dependency(&mut self, id: &P::Id, conn: ConnId) -> Result<bool> {
        if P::is_reserved_id(id) {
            return Ok(false);
        }
        let held = self
            .dependencies
            .get_mut(&conn)
            .map(|set| set.remove(id))
            .unwrap_or(false);
        if !held {
            return Err(Error::KeyError(format!(
                "connection {conn} does not hold a dependency on {id}"
            )));
        }
        // tolerate ids force-freed while the dependency was outstanding
        if let Some(payload) = self.objects.get_mut(id) {
            payload.base_mut().ref_cnt -= 1;
            Ok(payload.base().ref_cnt == 0)
        } else {
            Ok(false)
        }
    }

    /// Drop every dependency the connection holds. Returns the ids that
    /// became unused.
    fn release_connection(&mut self, conn: ConnId) -> Vec<P::Id> {
        let Some(held) = self.dependencies.remove(&conn) else {
            return Vec::new();
        };
        let mut unused = Vec::new();
        for id in held {
            if let Some(payload) = self.objects.get_mut(&id) {
                payload.base_mut().ref_cnt -= 1;
                if payload.base().ref_cnt == 0 {
                    unused.push(id);
                }
            }
        }
        unused
    }

    fn fetch_and_modify(&mut self, id: &P::Id, delta: i64) -> Result<i64> {
        match self.objects.get_mut(id) {
            // absent ids are tolerated, consistent with `get`
            None => Ok(0),
            Some(payload) => {
                payload.base_mut().ref_cnt += delta;
                Ok(payload.base().ref_cnt)
            }
        }
    }

    /// Insert payloads handed over from another session, keeping any id
    /// that already exists.
    fn move_ownership(&mut self, payloads: Vec<P>) {
        for mut payload in payloads {
            let id = payload.id();
            if self.objects.contains_key(&id) {
                continue;
            }
            payload.base_mut().is_sealed = true;
            self.objects.insert(id, payload);
        }
    }

    /// Atomically detach payloads from this index, returning the removed
    /// descriptors. Ids that are missing, reserved, or still referenced
    /// by a connection are skipped.
    fn remove_ownership(&mut self, ids: &[P::Id]) -> Vec<P> {
        let mut removed = Vec::new();
        for id in ids {
            if P::is_reserved_id(id) {
                continue;
            }
            let still_referenced = self
                .objects
                .get(id)
                .map(|payload| payload.base().ref_cnt > 0)
                .unwrap_or(true);
            if still_referenced {
                continue;
            }
            if let Some(payload) = self.objects.remove(id) {
                removed.push(payload);
            }
        }
        removed
    }

    fn allocation_of(payload: &Payload) -> Allocation {
        Allocation {
            pointer: payload.pointer as usize,
            store_fd: payload.store_fd,
            map_size: payload.map_size,
            data_offset: payload.data_offset,
        }
    }
}

/// Least-recently-used order over payloads eligible for spilling.
#[derive(Default)]
struct ColdList {
    order: BTreeMap<u64, ObjectID>,
    index: HashMap<ObjectID, u64>,
    sequence: u64,
}

impl ColdList {
    fn push(&mut self, id: ObjectID) {
        if self.index.contains_key(&id) {
            return;
        }
        self.sequence += 1;
        self.order.insert(self.sequence, id);
        self.index.insert(id, self.sequence);
    }

    fn remove(&mut self, id: &ObjectID) {
        if let Some(sequence) = self.index.remove(id) {
            self.order.remove(&sequence);
        }
    }

    fn pop_oldest(&mut self) -> Option<ObjectID> {
        let (&sequence, &id) = self.order.iter().next()?;
        self.order.remove(&sequence);
        self.index.remove(&id);
        Some(id)
    }
}

/// Spill configuration of the default store.
struct SpillConfig {
    path: PathBuf,
    lower: f64,
    upper: f64,
}

struct BulkInner {
    core: StoreCore<Payload>,
    cold: ColdList,
    spill: Option<SpillConfig>,
}

/// The default bulk store, indexed by [`ObjectID`].
pub struct BulkStore {
    inner: Mutex<BulkInner>,
}

impl BulkStore {
    /// Create a store with the given allocator variant, footprint ceiling
    /// and spill policy. An empty spill path disables spilling.
    pub fn new(
        kind: AllocatorKind,
        limit: usize,
        spill_path: Option<PathBuf>,
        spill_lower_rate: f64,
        spill_upper_rate: f64,
    ) -> BulkStore {
        let spill = spill_path.map(|path| SpillConfig {
            path,
            lower: spill_lower_rate,
            upper: spill_upper_rate,
        });
        BulkStore {
            inner: Mutex::new(BulkInner {
                core: StoreCore::new(ArenaAllocator::new(kind, limit)),
                cold: ColdList::default(),
                spill,
            }),
        }
    }

    /// Carve an unsealed payload of exactly `size` bytes.
    ///
    /// A zero-byte request returns the reserved empty blob without
    /// allocating memory.
    pub fn create(&self, size: usize) -> Result<(ObjectID, Payload)> {
        if size == 0 {
            return Ok((ObjectID::EMPTY_BLOB, Payload::make_empty()));
        }
        let mut inner = self.inner.lock();
        let allocation = inner.allocate_with_spill(size)?;
        let object_id = ObjectID::from_pointer(allocation.pointer);
        let payload = Payload::new(
            object_id,
            size,
            allocation.pointer,
            allocation.store_fd,
            allocation.map_size,
            allocation.data_offset,
        );
        inner.core.objects.insert(object_id, payload.clone());
        inner.maybe_spill_for_watermark();
        debug!(
            id = %object_id,
            footprint = inner.core.allocator.allocated(),
            limit = inner.core.allocator.footprint_limit(),
            "created payload"
        );
        Ok((object_id, payload))
    }

    /// Carve a payload backed by a named file instead of anonymous shared
    /// memory.
    pub fn create_disk(&self, size: usize, path: &std::path::Path) -> Result<(ObjectID, Payload)> {
        if size == 0 {
            return Ok((ObjectID::EMPTY_BLOB, Payload::make_empty()));
        }
        let mut inner = self.inner.lock();
        let allocation = inner.core.allocator.allocate_disk(size, path)?;
        let object_id = ObjectID::from_pointer(allocation.pointer);
        let payload = Payload::new(
            object_id,
            size,
            allocation.pointer,
            allocation.store_fd,
            allocation.map_size,
            allocation.data_offset,
        );
        inner.core.objects.insert(object_id, payload.clone());
        Ok((object_id, payload))
    }

    /// Mark a payload sealed. Idempotent.
    pub fn seal(&self, id: ObjectID) -> Result<()> {
        self.inner.lock().core.seal(&id)
    }

    /// Fetch payload descriptors, transparently reloading spilled ones.
    ///
    /// Fails with [`Error::ObjectNotSealed`] on any unsealed id unless
    /// `unsafe_get` is set, and with [`Error::ObjectNotExists`] on ids
    /// the store does not know.
    pub fn get(&self, ids: &[ObjectID], unsafe_get: bool) -> Result<Vec<Payload>> {
        let mut inner = self.inner.lock();
        let mut payloads = Vec::with_capacity(ids.len());
        for id in ids {
            if *id == ObjectID::EMPTY_BLOB {
                payloads.push(Payload::make_empty());
                continue;
            }
            if !inner.core.objects.contains_key(id) {
                return Err(Error::ObjectNotExists(format!("get: id = {id}")));
            }
            inner.reload_if_spilled(id)?;
            let payload = inner.core.objects.get(id).expect("checked above");
            if !unsafe_get && !payload.is_sealed {
                return Err(Error::ObjectNotSealed(format!(
                    "failed to get blob with id {id}"
                )));
            }
            payloads.push(payload.clone());
        }
        Ok(payloads)
    }

    /// Bind sealed ids to a connection's dependency set.
    pub fn add_dependency(&self, ids: &[ObjectID], conn: ConnId) -> Result<()> {
        let mut inner = self.inner.lock();
        let bound = inner.core.add_dependency(ids, conn)?;
        for id in bound {
            inner.cold.remove(&id);
        }
        Ok(())
    }

    /// Remove one dependency; the payload turns cold when the last
    /// reference across all connections drops.
    pub fn release(&self, id: ObjectID, conn: ConnId) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.core.remove_dependency(&id, conn)? {
            inner.mark_cold(id);
        }
        Ok(())
    }

    /// Called on disconnect: drop every dependency the connection held.
    pub fn release_connection(&self, conn: ConnId) {
        let mut inner = self.inner.lock();
        for id in inner.core.release_connection(conn) {
            inner.mark_cold(id);
        }
    }

    /// Force-free an id irrespective of outstanding references. Used by
    /// the metadata deletion pipeline.
    pub fn on_delete(&self, id: ObjectID) -> Result<()> {
        self.inner.lock().delete_payload(id)
    }

    pub fn exists(&self, id: ObjectID) -> bool {
        self.inner.lock().core.exists(&id)
    }

    pub fn is_in_use(&self, id: ObjectID) -> bool {
        self.inner.lock().core.is_in_use(&id)
    }

    pub fn is_spilled(&self, id: ObjectID) -> bool {
        self.inner
            .lock()
            .core
            .objects
            .get(&id)
            .map(|payload| payload.is_spilled)
            .unwrap_or(false)
    }

    /// Bytes currently in use.
    pub fn footprint(&self) -> usize {
        self.inner.lock().core.allocator.allocated()
    }

    /// The configured ceiling.
    pub fn footprint_limit(&self) -> usize {
        self.inner.lock().core.allocator.footprint_limit()
    }

    /// Adjust a payload's reference count directly, returning the new
    /// value. Missing ids are tolerated.
    pub fn fetch_and_modify(&self, id: ObjectID, delta: i64) -> Result<i64> {
        self.inner.lock().core.fetch_and_modify(&id, delta)
    }

    /// Pre-reserve a whole arena for an external user-space allocator.
    pub fn make_arena(&self, size: usize) -> Result<(i32, usize)> {
        self.inner.lock().core.allocator.make_arena(size)
    }

    /// Register the sub-allocations an external allocator carved inside a
    /// pre-reserved arena. The resulting payloads are sealed: the carving
    /// is final by the time it is reported.
    pub fn finalize_arena(
        &self,
        fd: i32,
        offsets: &[usize],
        sizes: &[usize],
    ) -> Result<Vec<ObjectID>> {
        if offsets.len() != sizes.len() {
            return Err(Error::Invalid(
                "the offsets and sizes of carved blobs do not match".into(),
            ));
        }
        let mut inner = self.inner.lock();
        let (base, map_size) = inner.core.allocator.take_external(fd)?;
        let mut ids = Vec::with_capacity(offsets.len());
        for (&offset, &size) in offsets.iter().zip(sizes) {
            if offset + size > map_size {
                return Err(Error::Invalid(format!(
                    "carved blob at {offset}+{size} exceeds the arena of {map_size} bytes"
                )));
            }
            let pointer = base + offset;
            let object_id = ObjectID::from_pointer(pointer);
            let mut payload = Payload::new(object_id, size, pointer, fd, map_size, offset);
            payload.is_sealed = true;
            inner.core.objects.insert(object_id, payload);
            ids.push(object_id);
        }
        Ok(ids)
    }

    /// Insert payloads handed over from another session.
    pub fn move_ownership(&self, payloads: Vec<Payload>) {
        self.inner.lock().core.move_ownership(payloads);
    }

    /// Detach payloads from this index; see [`StoreCore::remove_ownership`]
    /// semantics: referenced or unknown ids are skipped.
    pub fn remove_ownership(&self, ids: &[ObjectID]) -> Vec<Payload> {
        let mut inner = self.inner.lock();
        let removed = inner.core.remove_ownership(ids);
        for payload in &removed {
            inner.cold.remove(&payload.object_id);
        }
        removed
    }

    /// Sealed payloads currently registered, for listings.
    pub fn list(&self) -> Vec<Payload> {
        self.inner.lock().core.objects.values().cloned().collect()
    }
}

impl BulkInner {
    fn allocate_with_spill(&mut self, size: usize) -> Result<Allocation> {
        match self.core.allocator.allocate(size) {
            Ok(allocation) => Ok(allocation),
            Err(Error::NotEnoughMemory(_)) if self.spill.is_some() => {
                let limit = self.core.allocator.footprint_limit();
                let target = limit.saturating_sub(size);
                self.spill_until(target)?;
                self.core.allocator.allocate(size)
            }
            Err(err) => Err(err),
        }
    }

    fn mark_cold(&mut self, id: ObjectID) {
        let eligible = self
            .core
            .objects
            .get(&id)
            .map(|payload| payload.is_sealed && !payload.is_spilled)
            .unwrap_or(false);
        if eligible {
            self.cold.push(id);
        }
    }

    fn maybe_spill_for_watermark(&mut self) {
        let Some(spill) = &self.spill else { return };
        let limit = self.core.allocator.footprint_limit() as f64;
        let high = (limit * spill.upper) as usize;
        let low = (limit * spill.lower) as usize;
        if self.core.allocator.allocated() > high {
            if let Err(err) = self.spill_until(low) {
                warn!(error = %err, "failed to spill down to the low watermark");
            }
        }
    }

    /// Spill cold payloads, oldest first, until the footprint drops to
    /// `target` bytes or no candidates remain.
    fn spill_until(&mut self, target: usize) -> Result<()> {
        while self.core.allocator.allocated() > target {
            let Some(id) = self.cold.pop_oldest() else {
                break;
            };
            self.spill_payload(id)?;
        }
        Ok(())
    }

    fn spill_payload(&mut self, id: ObjectID) -> Result<()> {
        let Some(payload) = self.core.objects.get(&id).cloned() else {
            return Ok(());
        };
        if payload.is_spilled || !payload.is_sealed || payload.ref_cnt > 0 {
            return Ok(());
        }
        let spill = self
            .spill
            .as_ref()
            .expect("spill_payload is only reachable with spilling configured");
        let file = spill.path.join(id.to_hex());
        // SAFETY: the pointer addresses a live arena mapping owned by this
        // store, and the payload is sealed so no writer mutates it.
        let bytes = unsafe {
            std::slice::from_raw_parts(payload.pointer as usize as *const u8, payload.data_size)
        };
        std::fs::create_dir_all(&spill.path)?;
        std::fs::write(&file, bytes)?;

        let allocation = StoreCore::<Payload>::allocation_of(&payload);
        self.core.allocator.free(&allocation, payload.data_size);
        if let Some(stored) = self.core.objects.get_mut(&id) {
            stored.is_spilled = true;
        }
        debug!(id = %id, file = %file.display(), "spilled payload");
        Ok(())
    }

    fn reload_if_spilled(&mut self, id: &ObjectID) -> Result<()> {
        let needs_reload = self
            .core
            .objects
            .get(id)
            .map(|payload| payload.is_spilled)
            .unwrap_or(false);
        if !needs_reload {
            return Ok(());
        }
        let spill_dir = self
            .spill
            .as_ref()
            .map(|spill| spill.path.clone())
            .ok_or_else(|| Error::ObjectSpilled(format!("{id} is spilled but spilling is off")))?;

        let data_size = self.core.objects.get(id).expect("checked above").data_size;
        let allocation = self.allocate_with_spill(data_size)?;
        let file = spill_dir.join(id.to_hex());
        let bytes = std::fs::read(&file)?;
        if bytes.len() != data_size {
            return Err(Error::Io(std::io::Error::other(format!(
                "spill file for {id} holds {} bytes, expected {data_size}",
                bytes.len()
            ))));
        }
        // SAFETY: the allocation was just carved for this payload and is
        // not yet visible to any client.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                allocation.pointer as *mut u8,
                data_size,
            );
        }
        let payload = self.core.objects.get_mut(id).expect("checked above");
        payload.pointer = allocation.pointer as u64;
        payload.store_fd = allocation.store_fd;
        payload.map_size = allocation.map_size;
        payload.data_offset = allocation.data_offset;
        payload.is_spilled = false;
        let _ = std::fs::remove_file(&file);
        debug!(id = %id, "reloaded spilled payload");
        Ok(())
    }

    fn delete_payload(&mut self, id: ObjectID) -> Result<()> {
        if id == ObjectID::EMPTY_BLOB || id == ObjectID::INVALID {
            return Ok(());
        }
        self.cold.remove(&id);
        let Some(payload) = self.core.objects.remove(&id) else {
            return Err(Error::ObjectNotExists(format!("delete: id = {id}")));
        };
        if payload.is_spilled {
            if let Some(spill) = &self.spill {
                let _ = std::fs::remove_file(spill.path.join(id.to_hex()));
            }
            return Ok(());
        }
        let allocation = StoreCore::<Payload>::allocation_of(&payload);
        self.core.allocator.free(&allocation, payload.data_size);
        debug!(
            id = %id,
            footprint = self.core.allocator.allocated(),
            "deleted payload"
        );
        Ok(())
    }
}

/// The plasma bulk store, indexed by caller-supplied keys.
///
/// Plasma payloads are not composable with the metadata plane, so a
/// payload whose last dependency drops is deleted immediately rather
/// than turning cold.
pub struct PlasmaStore {
    inner: Mutex<StoreCore<PlasmaPayload>>,
}

impl PlasmaStore {
    pub fn new(kind: AllocatorKind, limit: usize) -> PlasmaStore {
        PlasmaStore {
            inner: Mutex::new(StoreCore::new(ArenaAllocator::new(kind, limit))),
        }
    }

    /// Carve an unsealed payload registered under `plasma_id`.
    pub fn create(
        &self,
        size: usize,
        plasma_size: usize,
        plasma_id: PlasmaID,
    ) -> Result<(ObjectID, PlasmaPayload)> {
        if size == 0 {
            return Ok((ObjectID::EMPTY_BLOB, PlasmaPayload::make_empty()));
        }
        let mut inner = self.inner.lock();
        if inner.objects.contains_key(&plasma_id) {
            return Err(Error::Invalid(format!(
                "plasma id already exists: {plasma_id}"
            )));
        }
        let allocation = inner.allocator.allocate(size)?;
        let object_id = ObjectID::from_pointer(allocation.pointer);
        let base = Payload::new(
            object_id,
            size,
            allocation.pointer,
            allocation.store_fd,
            allocation.map_size,
            allocation.data_offset,
        );
        let payload = PlasmaPayload::new(plasma_id.clone(), plasma_size, base);
        inner.objects.insert(plasma_id, payload.clone());
        Ok((object_id, payload))
    }

    pub fn seal(&self, id: &PlasmaID) -> Result<()> {
        self.inner.lock().seal(id)
    }

    pub fn get(&self, ids: &[PlasmaID], unsafe_get: bool) -> Result<Vec<PlasmaPayload>> {
        let inner = self.inner.lock();
        let mut payloads = Vec::with_capacity(ids.len());
        for id in ids {
            if PlasmaPayload::is_reserved_id(id) {
                payloads.push(PlasmaPayload::make_empty());
                continue;
            }
            let Some(payload) = inner.objects.get(id) else {
                return Err(Error::ObjectNotExists(format!("get: id = {id}")));
            };
            if !unsafe_get && !payload.base.is_sealed {
                return Err(Error::ObjectNotSealed(format!(
                    "failed to get blob with id {id}"
                )));
            }
            payloads.push(payload.clone());
        }
        Ok(payloads)
    }

    pub fn add_dependency(&self, ids: &[PlasmaID], conn: ConnId) -> Result<()> {
        self.inner.lock().add_dependency(ids, conn).map(|_| ())
    }

    /// Remove one dependency; the payload is deleted outright when the
    /// last reference drops.
    pub fn release(&self, id: &PlasmaID, conn: ConnId) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.remove_dependency(id, conn)? {
            Self::delete_locked(&mut inner, id)?;
        }
        Ok(())
    }

    pub fn release_connection(&self, conn: ConnId) {
        let mut inner = self.inner.lock();
        for id in inner.release_connection(conn) {
            let _ = Self::delete_locked(&mut inner, &id);
        }
    }

    /// Force-free a payload irrespective of outstanding references.
    pub fn on_delete(&self, id: &PlasmaID) -> Result<()> {
        Self::delete_locked(&mut self.inner.lock(), id)
    }

    pub fn exists(&self, id: &PlasmaID) -> bool {
        self.inner.lock().exists(id)
    }

    pub fn footprint(&self) -> usize {
        self.inner.lock().allocator.allocated()
    }

    pub fn footprint_limit(&self) -> usize {
        self.inner.lock().allocator.footprint_limit()
    }

    pub fn fetch_and_modify(&self, id: &PlasmaID, delta: i64) -> Result<i64> {
        self.inner.lock().fetch_and_modify(id, delta)
    }

    pub fn move_ownership(&self, payloads: Vec<PlasmaPayload>) {
        self.inner.lock().move_ownership(payloads);
    }

    pub fn remove_ownership(&self, ids: &[PlasmaID]) -> Vec<PlasmaPayload> {
        self.inner.lock().remove_ownership(ids)
    }

    fn delete_locked(inner: &mut StoreCore<PlasmaPayload>, id: &PlasmaID) -> Result<()> {
        let Some(payload) = inner.objects.remove(id) else {
            return Err(Error::ObjectNotExists(format!("delete: id = {id}")));
        };
        let allocation = StoreCore::<PlasmaPayload>::allocation_of(payload.base());
        inner.allocator.free(&allocation, payload.base.data_size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_limit(limit: usize) -> BulkStore {
        BulkStore::new(AllocatorKind::Dlmalloc, limit, None, 0.3, 0.8)
    }

    fn write_payload(payload: &Payload, bytes: &[u8]) {
        // test-only direct write through the server-side mapping
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                payload.pointer as usize as *mut u8,
                bytes.len(),
            );
        }
    }

    fn read_payload(payload: &Payload) -> Vec<u8> {
        unsafe {
            std::slice::from_raw_parts(payload.pointer as usize as *const u8, payload.data_size)
                .to_vec()
        }
    }

    #[test]
    fn test_create_seal_get() {
        let store = store_with_limit(1 << 20);
        let (id, payload) = store.create(64).unwrap();
        assert!(!payload.is_sealed);

        // unsealed payloads are invisible to ordinary gets
        let err = store.get(&[id], false).unwrap_err();
        assert!(matches!(err, Error::ObjectNotSealed(_)));
        // but reachable via the unsafe path
        assert_eq!(store.get(&[id], true).unwrap().len(), 1);

        store.seal(id).unwrap();
        store.seal(id).unwrap(); // idempotent
        let fetched = store.get(&[id], false).unwrap();
        assert!(fetched[0].is_sealed);
    }

    #[test]
    fn test_get_unknown_id_fails() {
        let store = store_with_limit(1 << 20);
        let err = store.get(&[ObjectID(0x8000_0000_0000_1234)], false).unwrap_err();
        assert!(matches!(err, Error::ObjectNotExists(_)));
    }

    #[test]
    fn test_zero_byte_create_returns_empty_blob() {
        let store = store_with_limit(1 << 20);
        let (id, payload) = store.create(0).unwrap();
        assert_eq!(id, ObjectID::EMPTY_BLOB);
        assert_eq!(payload.data_size, 0);
        assert_eq!(store.footprint(), 0);
        // the empty blob is always gettable
        assert_eq!(store.get(&[id], false).unwrap()[0].data_size, 0);
    }

    #[test]
    fn test_dependency_counting_is_conservative() {
        let store = store_with_limit(1 << 20);
        let (id, _) = store.create(64).unwrap();
        store.seal(id).unwrap();

        store.add_dependency(&[id], 1).unwrap();
        store.add_dependency(&[id], 1).unwrap(); // same connection: no double count
        store.add_dependency(&[id], 2).unwrap();
        assert!(store.is_in_use(id));

        store.release(id, 1).unwrap();
        assert!(store.is_in_use(id));
        store.release(id, 2).unwrap();
        assert!(!store.is_in_use(id));

        // releasing again is a visible error
        assert!(store.release(id, 1).is_err());
    }

    #[test]
    fn test_release_connection_drops_all_dependencies() {
        let store = store_with_limit(1 << 20);
        let (a, _) = store.create(64).unwrap();
        let (b, _) = store.create(64).unwrap();
        store.seal(a).unwrap();
        store.seal(b).unwrap();
        store.add_dependency(&[a, b], 7).unwrap();
        assert!(store.is_in_use(a));

        store.release_connection(7);
        assert!(!store.is_in_use(a));
        assert!(!store.is_in_use(b));
    }

    #[test]
    fn test_on_delete_ignores_references() {
        let store = store_with_limit(1 << 20);
        let (id, _) = store.create(64).unwrap();
        store.seal(id).unwrap();
        store.add_dependency(&[id], 1).unwrap();

        store.on_delete(id).unwrap();
        assert!(!store.exists(id));
        assert_eq!(store.footprint(), 0);
    }

    #[test]
    fn test_remove_ownership_skips_referenced_payloads() {
        let store = store_with_limit(1 << 20);
        let (kept, _) = store.create(64).unwrap();
        let (moved, _) = store.create(64).unwrap();
        store.seal(kept).unwrap();
        store.seal(moved).unwrap();
        store.add_dependency(&[kept], 1).unwrap();

        let removed = store.remove_ownership(&[kept, moved]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].object_id, moved);
        assert!(store.exists(kept));
        assert!(!store.exists(moved));
    }

    #[test]
    fn test_move_ownership_preserves_bytes() {
        let source = store_with_limit(1 << 20);
        let target = store_with_limit(1 << 20);
        let (id, payload) = source.create(8).unwrap();
        write_payload(&payload, &b"byteshere"[..8]);
        source.seal(id).unwrap();

        let mut removed = source.remove_ownership(&[id]);
        assert_eq!(removed.len(), 1);
        let mut handed = removed.pop().unwrap();
        handed.reset();
        let (fd, offset, size) = (handed.store_fd, handed.data_offset, handed.data_size);
        target.move_ownership(vec![handed]);

        assert!(!source.exists(id));
        let fetched = &target.get(&[id], false).unwrap()[0];
        assert_eq!(
            (fetched.store_fd, fetched.data_offset, fetched.data_size),
            (fd, offset, size)
        );
        assert_eq!(read_payload(fetched), b"byteshere"[..8].to_vec());
    }

    #[test]
    fn test_finalize_arena_registers_carved_ranges() {
        let store = store_with_limit(1 << 20);
        let (fd, _base) = store.make_arena(1 << 16).unwrap();
        let ids = store
            .finalize_arena(fd, &[0, 8192], &[4096, 1024])
            .unwrap();
        assert_eq!(ids.len(), 2);
        let payloads = store.get(&ids, false).unwrap();
        assert_eq!(payloads[0].data_size, 4096);
        assert_eq!(payloads[1].data_offset, 8192);
        assert_eq!(payloads[1].store_fd, fd);
    }

    #[test]
    fn test_finalize_arena_rejects_mismatched_lists() {
        let store = store_with_limit(1 << 20);
        let (fd, _) = store.make_arena(1 << 16).unwrap();
        assert!(store.finalize_arena(fd, &[0, 1], &[16]).is_err());
    }

    #[test]
    fn test_spill_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let limit = 1 << 20;
        let store = BulkStore::new(
            AllocatorKind::Dlmalloc,
            limit,
            Some(dir.path().to_path_buf()),
            0.3,
            0.8,
        );

        // five 200 KiB blobs; the fifth crosses the 0.8 watermark
        let blob_size = 200 << 10;
        let mut ids = Vec::new();
        for index in 0..5u8 {
            let (id, payload) = store.create(blob_size).unwrap();
            write_payload(&payload, &vec![index + 1; blob_size]);
            store.seal(id).unwrap();
            store.add_dependency(&[id], 1).unwrap();
            store.release(id, 1).unwrap();
            ids.push(id);
        }

        // the low watermark leaves at most 0.3 * 1 MiB in memory
        assert!(store.footprint() <= (limit as f64 * 0.3) as usize);
        assert!(store.is_spilled(ids[0]));

        // spill files are named by the hex id
        assert!(dir.path().join(ids[0].to_hex()).exists());

        // reload restores the exact bytes and clears the spilled bit
        let fetched = &store.get(&[ids[0]], false).unwrap()[0];
        assert!(!store.is_spilled(ids[0]));
        assert_eq!(read_payload(fetched), vec![1u8; blob_size]);
        assert!(!dir.path().join(ids[0].to_hex()).exists());
    }

    #[test]
    fn test_allocation_failure_without_spill_path() {
        let store = store_with_limit(1 << 16);
        let (id, _) = store.create(1 << 16).unwrap();
        store.seal(id).unwrap();
        let err = store.create(64).unwrap_err();
        assert!(matches!(err, Error::NotEnoughMemory(_)));
    }

    #[test]
    fn test_plasma_store_roundtrip() {
        let store = PlasmaStore::new(AllocatorKind::Dlmalloc, 1 << 20);
        let key = PlasmaID::new("content-hash-1");
        let (object_id, payload) = store.create(32, 32, key.clone()).unwrap();
        assert!(object_id.is_blob());
        assert_eq!(payload.plasma_size, 32);

        // duplicate keys are rejected
        assert!(store.create(32, 32, key.clone()).is_err());

        store.seal(&key).unwrap();
        let fetched = store.get(&[key.clone()], false).unwrap();
        assert_eq!(fetched[0].base.data_size, 32);

        // plasma payloads die when their last dependency drops
        store.add_dependency(&[key.clone()], 3).unwrap();
        store.release(&key, 3).unwrap();
        assert!(!store.exists(&key));
        assert_eq!(store.footprint(), 0);
    }
}
