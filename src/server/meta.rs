//! The coordinated metadata plane, local backend.
//!
//! Composite objects are JSON metadata trees that reference blob ids; the
//! trees live here, next to the name index. The core only ever inspects
//! `typename`, `instance_id` and blob-id references inside the trees.
//!
//! Requests that ask to `wait` for metadata that does not exist yet are
//! parked as *deferred requests*: an aliveness probe, a predicate over the
//! metadata state, and a continuation. Every metadata change re-scans the
//! parked list; requests whose connection died are garbage-collected by
//! the probe, and server shutdown drops whatever is still pending.
//!
//! The etcd/redis backends live behind the same seam but are provided by
//! the deployment, not by this crate.

use crate::error::{Error, Result};
use crate::memory::{InstanceID, ObjectID};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Probe telling whether the requester is still interested.
pub type AliveFn = Box<dyn Fn() -> bool + Send>;
/// Predicate over the metadata state.
pub type TestFn = Box<dyn Fn(&MetaState) -> bool + Send>;
/// Continuation run once the predicate holds.
pub type EvalFn = Box<dyn FnOnce(&MetaState) + Send>;

struct DeferredReq {
    alive: AliveFn,
    test: TestFn,
    eval: Option<EvalFn>,
}

/// The metadata tree and name index.
#[derive(Default)]
pub struct MetaState {
    /// Composite object trees, keyed by id.
    pub data: HashMap<ObjectID, Value>,
    /// Well-known names pointing at composite ids.
    pub names: HashMap<String, ObjectID>,
    /// Ids whose metadata has been persisted (non-transient).
    pub persisted: HashSet<ObjectID>,
}

impl MetaState {
    /// Look up a name in the index.
    pub fn name(&self, name: &str) -> Option<ObjectID> {
        self.names.get(name).copied()
    }

    /// Whether metadata exists for the id.
    pub fn exists(&self, id: ObjectID) -> bool {
        self.data.contains_key(&id)
    }
}

struct MetaInner {
    state: MetaState,
    deferred: Vec<DeferredReq>,
}

/// The in-process metadata service.
pub struct MetaService {
    inner: Mutex<MetaInner>,
    instance_id: InstanceID,
}

/// Generate a composite object id: random, blob bit clear, never the
/// invalid sentinel.
fn generate_object_id() -> ObjectID {
    let id = rand::thread_rng().gen_range(1..u64::MAX >> 1);
    ObjectID(id)
}

impl MetaService {
    pub fn new(instance_id: InstanceID) -> MetaService {
        MetaService {
            inner: Mutex::new(MetaInner {
                state: MetaState::default(),
                deferred: Vec::new(),
            }),
            instance_id,
        }
    }

    /// Read-only access to the metadata state.
    pub fn read<R>(&self, f: impl FnOnce(&MetaState) -> R) -> R {
        f(&self.inner.lock().state)
    }

    /// Mutate the metadata state, then re-scan the deferred requests.
    pub fn update<R>(&self, f: impl FnOnce(&mut MetaState) -> R) -> R {
        let mut inner = self.inner.lock();
        let result = f(&mut inner.state);
        Self::process_deferred(&mut inner);
        result
    }

    /// Evaluate now if the predicate holds (or `wait` is off), otherwise
    /// park the request.
    pub fn request(&self, wait: bool, alive: AliveFn, test: TestFn, eval: EvalFn) {
        let mut inner = self.inner.lock();
        if !wait || test(&inner.state) {
            eval(&inner.state);
            return;
        }
        inner.deferred.push(DeferredReq {
            alive,
            test,
            eval: Some(eval),
        });
        debug!(pending = inner.deferred.len(), "deferred a metadata request");
    }

    fn process_deferred(inner: &mut MetaInner) {
        let state = &inner.state;
        inner.deferred.retain_mut(|req| {
            if !(req.alive)() {
                return false;
            }
            if (req.test)(state) {
                if let Some(eval) = req.eval.take() {
                    eval(state);
                }
                return false;
            }
            true
        });
    }

    /// Number of parked requests, for instance status.
    pub fn deferred_count(&self) -> usize {
        self.inner.lock().deferred.len()
    }

    /// Drop all parked requests without evaluating them.
    pub fn drop_deferred(&self) {
        self.inner.lock().deferred.clear();
    }

    // -- metadata tree operations ------------------------------------------

    /// Register a composite metadata tree. Returns (id, signature).
    pub fn create_data(&self, mut content: Value) -> Result<(ObjectID, u64)> {
        if !content.is_object() {
            return Err(Error::MetaTreeInvalid(
                "metadata must be a JSON object".into(),
            ));
        }
        let id = generate_object_id();
        let signature: u64 = rand::thread_rng().r#gen();
        content["id"] = json!(id.to_hex());
        content["signature"] = json!(signature);
        content["instance_id"] = json!(self.instance_id);
        if content.get("transient").is_none() {
            content["transient"] = json!(true);
        }
        self.update(move |state| {
            state.data.insert(id, content);
        });
        Ok((id, signature))
    }

    /// Fetch metadata trees. Blob ids are resolved by the caller against
    /// the bulk store; this only serves composite trees.
    pub fn get_data(&self, ids: &[ObjectID]) -> Value {
        self.read(|state| {
            let mut group = json!({});
            for id in ids {
                if let Some(tree) = state.data.get(id) {
                    group[id.to_hex()] = tree.clone();
                }
            }
            group
        })
    }

    /// List metadata trees whose `typename` matches the pattern. Globs
    /// use `*`/`?`; `regex = true` interprets the pattern verbatim.
    pub fn list_data(&self, pattern: &str, regex: bool, limit: usize) -> Result<Value> {
        let matcher = build_matcher(pattern, regex)?;
        self.read(|state| {
            let mut group = json!({});
            let mut count = 0usize;
            for (id, tree) in &state.data {
                if count >= limit {
                    break;
                }
                let type_name = tree["typename"].as_str().unwrap_or_default();
                if matcher.is_match(type_name) {
                    group[id.to_hex()] = tree.clone();
                    count += 1;
                }
            }
            Ok(group)
        })
    }

    /// Mark metadata as persisted (non-transient).
    pub fn persist(&self, id: ObjectID) -> Result<()> {
        self.update(|state| {
            let Some(tree) = state.data.get_mut(&id) else {
                return Err(Error::MetaTreeSubtreeNotExists(format!(
                    "persist: id = {id}"
                )));
            };
            tree["transient"] = json!(false);
            state.persisted.insert(id);
            Ok(())
        })
    }

    pub fn if_persist(&self, id: ObjectID) -> bool {
        self.read(|state| state.persisted.contains(&id))
    }

    pub fn exists(&self, id: ObjectID) -> bool {
        self.read(|state| state.exists(id))
    }

    /// Duplicate a metadata tree under a fresh id, merging extra fields.
    pub fn shallow_copy(&self, id: ObjectID, extra: &Value) -> Result<ObjectID> {
        let tree = self.read(|state| state.data.get(&id).cloned());
        let Some(mut tree) = tree else {
            return Err(Error::MetaTreeSubtreeNotExists(format!(
                "shallow copy: id = {id}"
            )));
        };
        if let (Some(target), Some(source)) = (tree.as_object_mut(), extra.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        let (target_id, _) = self.create_data(tree)?;
        Ok(target_id)
    }

    /// Delete metadata trees. With `deep`, member subtrees are deleted
    /// transitively. Returns every id that was actually dropped,
    /// including blob ids referenced by the deleted trees (the caller
    /// frees those payloads).
    pub fn del_data(&self, ids: &[ObjectID], force: bool, deep: bool) -> Result<Vec<ObjectID>> {
        self.update(|state| {
            let mut deleted = Vec::new();
            let mut queue: Vec<ObjectID> = ids.to_vec();
            while let Some(id) = queue.pop() {
                if id.is_blob() {
                    deleted.push(id);
                    continue;
                }
                let named = state.names.values().any(|target| *target == id);
                if named && !force {
                    continue;
                }
                let Some(tree) = state.data.remove(&id) else {
                    continue;
                };
                if named {
                    state.names.retain(|_, target| *target != id);
                }
                state.persisted.remove(&id);
                deleted.push(id);
                if deep {
                    collect_member_ids(&tree, &mut queue);
                }
            }
            Ok(deleted)
        })
    }

    // -- names --------------------------------------------------------------

    /// Bind a well-known name to a persisted composite object.
    pub fn put_name(&self, id: ObjectID, name: &str) -> Result<()> {
        self.update(|state| {
            if !state.data.contains_key(&id) {
                return Err(Error::ObjectNotExists(format!("put name: id = {id}")));
            }
            if !state.persisted.contains(&id) {
                return Err(Error::Invalid(
                    "transient objects cannot have a name, persist it first".into(),
                ));
            }
            if let Some(tree) = state.data.get_mut(&id) {
                tree["__name"] = json!(name);
            }
            state.names.insert(name.to_owned(), id);
            Ok(())
        })
    }

    /// Resolve a name immediately; missing names are an error (waiters go
    /// through [`MetaService::request`]).
    pub fn get_name(&self, name: &str) -> Result<ObjectID> {
        self.read(|state| {
            state
                .name(name)
                .ok_or_else(|| Error::ObjectNotExists(format!("failed to find name: {name}")))
        })
    }

    pub fn drop_name(&self, name: &str) -> Result<()> {
        self.update(|state| {
            if let Some(id) = state.names.remove(name) {
                if let Some(tree) = state.data.get_mut(&id) {
                    if let Some(object) = tree.as_object_mut() {
                        object.remove("__name");
                    }
                }
            }
            Ok(())
        })
    }

    /// Every registered composite id, for `clear`.
    pub fn all_data_ids(&self) -> Vec<ObjectID> {
        self.read(|state| state.data.keys().copied().collect())
    }

    /// Cluster-level view: this backend only knows its own instance.
    pub fn cluster_info(&self) -> Value {
        json!({
            self.instance_id.to_string(): {
                "instance_id": self.instance_id,
            }
        })
    }
}

/// Collect member object ids out of a metadata tree.
fn collect_member_ids(tree: &Value, out: &mut Vec<ObjectID>) {
    let Some(object) = tree.as_object() else {
        return;
    };
    for (key, value) in object {
        if key == "id" {
            continue;
        }
        if let Some(member) = value.as_object() {
            if let Some(id) = member.get("id").and_then(Value::as_str) {
                if let Some(id) = ObjectID::from_hex(id) {
                    out.push(id);
                }
            }
            collect_member_ids(value, out);
        }
    }
}

/// Whether a type name matches a listing pattern.
pub fn type_name_matches(pattern: &str, regex: bool, type_name: &str) -> bool {
    build_matcher(pattern, regex)
        .map(|matcher| matcher.is_match(type_name))
        .unwrap_or(false)
}

fn build_matcher(pattern: &str, regex: bool) -> Result<regex::Regex> {
    let source = if regex {
        pattern.to_owned()
    } else {
        // translate the glob: `*` and `?` are wildcards, the rest literal
        let mut translated = String::with_capacity(pattern.len() + 8);
        translated.push('^');
        for c in pattern.chars() {
            match c {
                '*' => translated.push_str(".*"),
                '?' => translated.push('.'),
                other => translated.push_str(&regex::escape(&other.to_string())),
            }
        }
        translated.push('$');
        translated
    };
    regex::Regex::new(&source).map_err(|e| Error::Invalid(format!("malformed pattern: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn sample_tree(type_name: &str) -> Value {
        json!({"typename": type_name, "nbytes": 128})
    }

    #[test]
    fn test_create_then_get_data() {
        let meta = MetaService::new(1);
        let (id, _sig) = meta.create_data(sample_tree("arbor::Tensor")).unwrap();
        assert!(!id.is_blob());

        let group = meta.get_data(&[id]);
        assert_eq!(group[id.to_hex()]["typename"], "arbor::Tensor");
        assert_eq!(group[id.to_hex()]["instance_id"], 1);
    }

    #[test]
    fn test_list_data_glob_and_limit() {
        let meta = MetaService::new(1);
        meta.create_data(sample_tree("arbor::Tensor")).unwrap();
        meta.create_data(sample_tree("arbor::Tensor")).unwrap();
        meta.create_data(sample_tree("arbor::DataFrame")).unwrap();

        let group = meta.list_data("arbor::Tensor", false, 100).unwrap();
        assert_eq!(group.as_object().unwrap().len(), 2);
        let group = meta.list_data("arbor::*", false, 2).unwrap();
        assert_eq!(group.as_object().unwrap().len(), 2);
        let group = meta.list_data("arbor::.*Frame", true, 100).unwrap();
        assert_eq!(group.as_object().unwrap().len(), 1);
    }

    #[test]
    fn test_names_require_persistence() {
        let meta = MetaService::new(1);
        let (id, _) = meta.create_data(sample_tree("arbor::Tensor")).unwrap();

        assert!(meta.put_name(id, "weights").is_err());
        meta.persist(id).unwrap();
        meta.put_name(id, "weights").unwrap();
        assert_eq!(meta.get_name("weights").unwrap(), id);

        meta.drop_name("weights").unwrap();
        assert!(meta.get_name("weights").is_err());
    }

    #[test]
    fn test_deferred_request_fires_on_update() {
        let meta = Arc::new(MetaService::new(1));
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = fired.clone();
        meta.request(
            true,
            Box::new(|| true),
            Box::new(|state| state.name("pending").is_some()),
            Box::new(move |state| {
                assert!(state.name("pending").is_some());
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(meta.deferred_count(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let (id, _) = meta.create_data(sample_tree("arbor::Tensor")).unwrap();
        meta.persist(id).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        meta.put_name(id, "pending").unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(meta.deferred_count(), 0);
    }

    #[test]
    fn test_dead_deferred_request_is_collected() {
        let meta = MetaService::new(1);
        let alive = Arc::new(AtomicBool::new(true));

        let alive_clone = alive.clone();
        meta.request(
            true,
            Box::new(move || alive_clone.load(Ordering::SeqCst)),
            Box::new(|_| false),
            Box::new(|_| panic!("must never fire")),
        );
        assert_eq!(meta.deferred_count(), 1);

        alive.store(false, Ordering::SeqCst);
        meta.update(|_| {});
        assert_eq!(meta.deferred_count(), 0);
    }

    #[test]
    fn test_del_data_deep_collects_members() {
        let meta = MetaService::new(1);
        let blob = ObjectID::from_pointer(0x4000);
        let (inner_id, _) = meta.create_data(sample_tree("arbor::Array")).unwrap();
        let (outer_id, _) = meta
            .create_data(json!({
                "typename": "arbor::Pair",
                "left": {"id": inner_id.to_hex(), "typename": "arbor::Array"},
                "right": {"id": blob.to_hex(), "typename": "arbor::Blob"},
            }))
            .unwrap();

        let deleted = meta.del_data(&[outer_id], false, true).unwrap();
        assert!(deleted.contains(&outer_id));
        assert!(deleted.contains(&inner_id));
        assert!(deleted.contains(&blob));
        assert!(!meta.exists(inner_id));
    }

    #[test]
    fn test_shallow_copy_merges_extra() {
        let meta = MetaService::new(1);
        let (id, _) = meta.create_data(sample_tree("arbor::Tensor")).unwrap();
        let copy = meta
            .shallow_copy(id, &json!({"shape": [3, 4]}))
            .unwrap();
        assert_ne!(copy, id);
        let group = meta.get_data(&[copy]);
        assert_eq!(group[copy.to_hex()]["shape"], json!([3, 4]));
        assert_eq!(group[copy.to_hex()]["typename"], "arbor::Tensor");
    }
}
