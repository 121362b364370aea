//! Client-side usage tracking.
//!
//! Keeps a per-process reference count next to a copy of each payload
//! descriptor. The tracker decouples client-side liveness (when it is
//! safe to reuse a cached mapping) from server-side liveness (when the
//! server may evict): only when the local count reaches zero does the
//! owner issue the release upcall to the server.

use crate::error::{Error, Result};
use crate::memory::{ObjectID, Payload, PlasmaID, PlasmaPayload};
use std::collections::HashMap;
use std::hash::Hash;

/// Payload capability needed by the tracker, shared by both id spaces.
pub trait TrackedPayload: Clone {
    fn is_sealed(&self) -> bool;
    fn mark_sealed(&mut self);
}

impl TrackedPayload for Payload {
    fn is_sealed(&self) -> bool {
        self.is_sealed
    }

    fn mark_sealed(&mut self) {
        self.is_sealed = true;
    }
}

impl TrackedPayload for PlasmaPayload {
    fn is_sealed(&self) -> bool {
        self.base.is_sealed
    }

    fn mark_sealed(&mut self) {
        self.base.is_sealed = true;
    }
}

/// What the owner must do after a `remove_usage`.
#[derive(Debug, PartialEq, Eq)]
pub enum UsageAction {
    /// Other local references remain.
    StillInUse,
    /// The last local reference dropped: issue the release upcall.
    Release,
}

#[derive(Debug)]
struct UsageEntry<P> {
    payload: P,
    ref_cnt: i64,
}

/// Per-id usage entries of one client.
#[derive(Debug)]
pub struct UsageTracker<I, P> {
    in_use: HashMap<I, UsageEntry<P>>,
}

impl<I, P> Default for UsageTracker<I, P> {
    fn default() -> Self {
        UsageTracker {
            in_use: HashMap::new(),
        }
    }
}

impl<I: Eq + Hash + Clone + std::fmt::Display, P: TrackedPayload> UsageTracker<I, P> {
    /// The cached payload, when present and sealed.
    pub fn fetch_on_local(&self, id: &I) -> Result<P> {
        match self.in_use.get(id) {
            Some(entry) if entry.payload.is_sealed() => Ok(entry.payload.clone()),
            Some(_) => Err(Error::ObjectNotSealed(format!("local fetch: id = {id}"))),
            None => Err(Error::ObjectNotExists(format!("local fetch: id = {id}"))),
        }
    }

    /// Insert the payload if absent, then take one local reference.
    pub fn add_usage(&mut self, id: I, payload: P) {
        let entry = self.in_use.entry(id).or_insert(UsageEntry {
            payload,
            ref_cnt: 0,
        });
        entry.ref_cnt += 1;
    }

    /// Drop one local reference. At zero the entry is deleted first, and
    /// the caller performs the release upcall: once the count hits zero
    /// the server may spill the payload, so the cached descriptor can no
    /// longer be trusted.
    pub fn remove_usage(&mut self, id: &I) -> Result<UsageAction> {
        let Some(entry) = self.in_use.get_mut(id) else {
            return Err(Error::ObjectNotExists(format!("remove usage: id = {id}")));
        };
        entry.ref_cnt -= 1;
        if entry.ref_cnt > 0 {
            return Ok(UsageAction::StillInUse);
        }
        self.in_use.remove(id);
        Ok(UsageAction::Release)
    }

    /// Hard removal after the server confirmed deletion. Missing entries
    /// are tolerated: the count may already have reached zero.
    pub fn delete_usage(&mut self, id: &I) {
        self.in_use.remove(id);
    }

    /// Mark a cached payload sealed.
    pub fn seal_usage(&mut self, id: &I) -> Result<()> {
        match self.in_use.get_mut(id) {
            Some(entry) => {
                entry.payload.mark_sealed();
                Ok(())
            }
            None => Err(Error::ObjectNotExists(format!("seal usage: id = {id}"))),
        }
    }

    pub fn clear(&mut self) {
        self.in_use.clear();
    }
}

/// The default-store tracker.
pub type ObjectUsageTracker = UsageTracker<ObjectID, Payload>;
/// The plasma-store tracker.
pub type PlasmaUsageTracker = UsageTracker<PlasmaID, PlasmaPayload>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed_payload(id: ObjectID) -> Payload {
        let mut payload = Payload::new(id, 64, 0x1000, 3, 1 << 20, 0);
        payload.is_sealed = true;
        payload
    }

    #[test]
    fn test_paired_add_remove_returns_to_zero() {
        let mut tracker = ObjectUsageTracker::default();
        let id = ObjectID::from_pointer(0x1000);
        let payload = sealed_payload(id);

        tracker.add_usage(id, payload.clone());
        tracker.add_usage(id, payload);
        assert_eq!(tracker.remove_usage(&id).unwrap(), UsageAction::StillInUse);
        assert_eq!(tracker.remove_usage(&id).unwrap(), UsageAction::Release);

        // the entry is gone after the release transition
        assert!(tracker.fetch_on_local(&id).is_err());
        assert!(tracker.remove_usage(&id).is_err());
    }

    #[test]
    fn test_fetch_on_local_distinguishes_missing_from_unsealed() {
        let mut tracker = ObjectUsageTracker::default();
        let id = ObjectID::from_pointer(0x2000);

        let err = tracker.fetch_on_local(&id).unwrap_err();
        assert!(matches!(err, Error::ObjectNotExists(_)));

        let unsealed = Payload::new(id, 64, 0x2000, 3, 1 << 20, 0);
        tracker.add_usage(id, unsealed);
        let err = tracker.fetch_on_local(&id).unwrap_err();
        assert!(matches!(err, Error::ObjectNotSealed(_)));

        tracker.seal_usage(&id).unwrap();
        assert!(tracker.fetch_on_local(&id).is_ok());
    }

    #[test]
    fn test_delete_usage_is_idempotent() {
        let mut tracker = ObjectUsageTracker::default();
        let id = ObjectID::from_pointer(0x3000);
        tracker.add_usage(id, sealed_payload(id));
        tracker.delete_usage(&id);
        tracker.delete_usage(&id);
        assert!(tracker.fetch_on_local(&id).is_err());
    }
}
