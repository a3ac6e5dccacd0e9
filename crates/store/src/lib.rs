//! Defrev store: in-RAM object store with resourceVersion conflict checks,
//! owner-reference cascade delete, a write log and fault injection.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use defrev_core::{from_dynamic, to_dynamic, ClientError, LabelSelector, Object, ObjectKey, ResourceClient};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{ApiResource, DynamicObject};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StoreKey {
    group: String,
    kind: String,
    key: ObjectKey,
}

impl StoreKey {
    fn new(ar: &ApiResource, key: ObjectKey) -> Self {
        Self { group: ar.group.clone(), kind: ar.kind.clone(), key }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Create,
    Update,
    UpdateStatus,
    List,
    Delete,
}

/// Error an injected fault produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    Conflict,
    Api(String),
}

#[derive(Debug, Clone)]
struct Fault {
    verb: Verb,
    kind: String,
    remaining: usize,
    error: FaultKind,
}

/// One successful mutation, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub verb: Verb,
    pub kind: String,
    pub key: ObjectKey,
}

#[derive(Default)]
struct Inner {
    objects: FxHashMap<StoreKey, DynamicObject>,
    next_rv: u64,
    faults: Vec<Fault>,
    writes: Vec<WriteRecord>,
}

impl Inner {
    fn bump_rv(&mut self) -> String {
        self.next_rv = self.next_rv.saturating_add(1);
        self.next_rv.to_string()
    }

    fn take_fault(&mut self, verb: Verb, kind: &str, key: &ObjectKey) -> Option<ClientError> {
        let fault = self.faults.iter_mut().find(|f| f.verb == verb && f.kind == kind && f.remaining > 0)?;
        fault.remaining -= 1;
        let err = match &fault.error {
            FaultKind::Conflict => ClientError::Conflict {
                kind: kind.to_string(),
                key: key.clone(),
                message: "the object has been modified; please apply your changes to the latest version".into(),
            },
            FaultKind::Api(msg) => ClientError::Api(msg.clone()),
        };
        self.faults.retain(|f| f.remaining > 0);
        Some(err)
    }

    fn record(&mut self, verb: Verb, kind: &str, key: &ObjectKey) {
        self.writes.push(WriteRecord { verb, kind: kind.to_string(), key: key.clone() });
    }
}

/// Shared in-memory store. All methods take `&self`; clone an `Arc<MemStore>` to share.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `times` calls of `verb` on kind `K` with `error`.
    pub fn inject<K: Object>(&self, verb: Verb, times: usize, error: FaultKind) {
        if times == 0 { return; }
        let kind = K::api_resource().kind;
        self.lock().faults.push(Fault { verb, kind, remaining: times, error });
    }

    pub fn writes(&self) -> Vec<WriteRecord> { self.lock().writes.clone() }

    pub fn clear_writes(&self) { self.lock().writes.clear(); }

    /// Seed an object without going through the write log. Assigns uid and resourceVersion.
    pub fn insert<K: Object>(&self, obj: &K) -> Result<K, ClientError> {
        let ar = K::api_resource();
        let mut dynamic = to_dynamic(obj)?;
        let mut inner = self.lock();
        stamp_new(&mut dynamic, inner.bump_rv());
        let key = StoreKey::new(&ar, ObjectKey::from_meta(&dynamic.metadata));
        inner.objects.insert(key, dynamic.clone());
        from_dynamic(dynamic)
    }

    pub fn fetch<K: Object>(&self, key: &ObjectKey) -> Option<K> {
        let ar = K::api_resource();
        let found = self.lock().objects.get(&StoreKey::new(&ar, key.clone())).cloned()?;
        from_dynamic(found).ok()
    }

    /// All objects of kind `K` in `namespace` (or everywhere), sorted by name.
    pub fn all<K: Object>(&self, namespace: Option<&str>) -> Vec<K> {
        let ar = K::api_resource();
        let inner = self.lock();
        let mut out: Vec<DynamicObject> = inner
            .objects
            .iter()
            .filter(|(k, _)| k.group == ar.group && k.kind == ar.kind)
            .filter(|(k, _)| namespace.map_or(true, |ns| k.key.namespace.as_deref() == Some(ns)))
            .map(|(_, o)| o.clone())
            .collect();
        out.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        out.into_iter().filter_map(|o| from_dynamic(o).ok()).collect()
    }

    /// Apply an out-of-band edit (another actor writing the object): bumps
    /// resourceVersion and generation, not recorded in the write log.
    pub fn mutate<K: Object>(&self, key: &ObjectKey, f: impl FnOnce(&mut K)) -> Result<K, ClientError> {
        let ar = K::api_resource();
        let skey = StoreKey::new(&ar, key.clone());
        let mut inner = self.lock();
        let current = inner
            .objects
            .get(&skey)
            .cloned()
            .ok_or_else(|| ClientError::NotFound { kind: ar.kind.clone(), key: key.clone() })?;
        let mut typed: K = from_dynamic(current)?;
        f(&mut typed);
        let mut next = to_dynamic(&typed)?;
        next.metadata.resource_version = Some(inner.bump_rv());
        next.metadata.generation = Some(next.metadata.generation.unwrap_or(1).saturating_add(1));
        inner.objects.insert(skey, next.clone());
        from_dynamic(next)
    }

    /// Set `metadata.deletionTimestamp` as the API server does when a finalizer blocks deletion.
    pub fn mark_deleting<K: Object>(&self, key: &ObjectKey) -> Result<K, ClientError> {
        self.mutate::<K>(key, |obj| {
            obj.meta_mut().deletion_timestamp = Some(Time(chrono::Utc::now()));
        })
    }
}

fn stamp_new(obj: &mut DynamicObject, rv: String) {
    if obj.metadata.uid.as_deref().map_or(true, str::is_empty) {
        obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
    }
    if obj.metadata.creation_timestamp.is_none() {
        obj.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
    }
    obj.metadata.generation = Some(obj.metadata.generation.unwrap_or(1));
    obj.metadata.resource_version = Some(rv);
}

fn check_rv(ar: &ApiResource, key: &ObjectKey, incoming: &DynamicObject, stored: &DynamicObject) -> Result<(), ClientError> {
    match incoming.metadata.resource_version.as_deref() {
        Some(rv) if !rv.is_empty() && Some(rv) != stored.metadata.resource_version.as_deref() => Err(ClientError::Conflict {
            kind: ar.kind.clone(),
            key: key.clone(),
            message: format!(
                "resourceVersion {} is stale (current {})",
                rv,
                stored.metadata.resource_version.as_deref().unwrap_or("")
            ),
        }),
        _ => Ok(()),
    }
}

fn status_of(obj: &DynamicObject) -> Option<Json> { obj.data.get("status").cloned() }

fn set_status(obj: &mut DynamicObject, status: Option<Json>) {
    if let Some(map) = obj.data.as_object_mut() {
        match status {
            Some(s) => { map.insert("status".into(), s); }
            None => { map.remove("status"); }
        }
    }
}

#[async_trait]
impl ResourceClient for MemStore {
    async fn get(&self, ar: &ApiResource, key: &ObjectKey) -> Result<DynamicObject, ClientError> {
        let mut inner = self.lock();
        if let Some(err) = inner.take_fault(Verb::Get, &ar.kind, key) { return Err(err); }
        inner
            .objects
            .get(&StoreKey::new(ar, key.clone()))
            .cloned()
            .ok_or_else(|| ClientError::NotFound { kind: ar.kind.clone(), key: key.clone() })
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let key = ObjectKey::from_meta(&obj.metadata);
        if key.name.is_empty() {
            return Err(ClientError::Invalid(format!("{} without metadata.name", ar.kind)));
        }
        let mut inner = self.lock();
        if let Some(err) = inner.take_fault(Verb::Create, &ar.kind, &key) { return Err(err); }
        let skey = StoreKey::new(ar, key.clone());
        if inner.objects.contains_key(&skey) {
            return Err(ClientError::AlreadyExists { kind: ar.kind.clone(), key });
        }
        let mut stored = obj.clone();
        stored.metadata.uid = None;
        stored.metadata.creation_timestamp = None;
        let rv = inner.bump_rv();
        stamp_new(&mut stored, rv);
        inner.objects.insert(skey, stored.clone());
        inner.record(Verb::Create, &ar.kind, &key);
        debug!(kind = %ar.kind, key = %key, "memstore: created");
        Ok(stored)
    }

    async fn update(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let key = ObjectKey::from_meta(&obj.metadata);
        let mut inner = self.lock();
        if let Some(err) = inner.take_fault(Verb::Update, &ar.kind, &key) { return Err(err); }
        let skey = StoreKey::new(ar, key.clone());
        let stored = inner
            .objects
            .get(&skey)
            .cloned()
            .ok_or_else(|| ClientError::NotFound { kind: ar.kind.clone(), key: key.clone() })?;
        check_rv(ar, &key, obj, &stored)?;
        let mut next = obj.clone();
        set_status(&mut next, status_of(&stored));
        next.metadata.uid = stored.metadata.uid.clone();
        next.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        next.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        let spec_changed = next.data.get("spec") != stored.data.get("spec");
        let generation = stored.metadata.generation.unwrap_or(1);
        next.metadata.generation = Some(if spec_changed { generation.saturating_add(1) } else { generation });
        next.metadata.resource_version = Some(inner.bump_rv());
        inner.objects.insert(skey, next.clone());
        inner.record(Verb::Update, &ar.kind, &key);
        Ok(next)
    }

    async fn update_status(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let key = ObjectKey::from_meta(&obj.metadata);
        let mut inner = self.lock();
        if let Some(err) = inner.take_fault(Verb::UpdateStatus, &ar.kind, &key) { return Err(err); }
        let skey = StoreKey::new(ar, key.clone());
        let mut next = inner
            .objects
            .get(&skey)
            .cloned()
            .ok_or_else(|| ClientError::NotFound { kind: ar.kind.clone(), key: key.clone() })?;
        check_rv(ar, &key, obj, &next)?;
        set_status(&mut next, status_of(obj));
        next.metadata.resource_version = Some(inner.bump_rv());
        inner.objects.insert(skey, next.clone());
        inner.record(Verb::UpdateStatus, &ar.kind, &key);
        Ok(next)
    }

    async fn list(&self, ar: &ApiResource, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<DynamicObject>, ClientError> {
        let mut inner = self.lock();
        let list_key = ObjectKey { namespace: namespace.map(str::to_string), name: String::new() };
        if let Some(err) = inner.take_fault(Verb::List, &ar.kind, &list_key) { return Err(err); }
        let mut out: Vec<DynamicObject> = inner
            .objects
            .iter()
            .filter(|(k, _)| k.group == ar.group && k.kind == ar.kind)
            .filter(|(k, _)| namespace.map_or(true, |ns| k.key.namespace.as_deref() == Some(ns)))
            .filter(|(_, o)| selector.matches(o.metadata.labels.as_ref()))
            .map(|(_, o)| o.clone())
            .collect();
        out.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(out)
    }

    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<(), ClientError> {
        let mut inner = self.lock();
        if let Some(err) = inner.take_fault(Verb::Delete, &ar.kind, key) { return Err(err); }
        let removed = inner
            .objects
            .remove(&StoreKey::new(ar, key.clone()))
            .ok_or_else(|| ClientError::NotFound { kind: ar.kind.clone(), key: key.clone() })?;
        inner.record(Verb::Delete, &ar.kind, key);

        // Cascade: drop dependents owned by anything removed so far.
        let mut gone: Vec<String> = removed.metadata.uid.into_iter().collect();
        while let Some(uid) = gone.pop() {
            let dependents: Vec<StoreKey> = inner
                .objects
                .iter()
                .filter(|(_, o)| {
                    o.metadata.owner_references.as_ref().map_or(false, |refs| refs.iter().any(|r| r.uid == uid))
                })
                .map(|(k, _)| k.clone())
                .collect();
            for dep in dependents {
                if let Some(obj) = inner.objects.remove(&dep) {
                    debug!(kind = %dep.kind, key = %dep.key, owner_uid = %uid, "memstore: cascade delete");
                    gone.extend(obj.metadata.uid);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use defrev_core::{ComponentDefinition, DefinitionRevision};

    #[test]
    fn faults_are_consumed_in_order() {
        let mut inner = Inner::default();
        inner.faults.push(Fault { verb: Verb::Update, kind: "K".into(), remaining: 2, error: FaultKind::Conflict });
        let key = ObjectKey::cluster("x");
        assert!(inner.take_fault(Verb::Get, "K", &key).is_none());
        assert!(inner.take_fault(Verb::Update, "K", &key).unwrap().is_conflict());
        assert!(inner.take_fault(Verb::Update, "K", &key).is_some());
        assert!(inner.take_fault(Verb::Update, "K", &key).is_none());
        assert!(inner.faults.is_empty());
    }

    #[test]
    fn insert_assigns_identity() {
        let store = MemStore::new();
        let def = store.insert(&ComponentDefinition::new("ns", "d1", Default::default())).unwrap();
        assert!(def.metadata.uid.is_some());
        assert_eq!(def.metadata.resource_version.as_deref(), Some("1"));
        assert!(store.writes().is_empty());
        let rev = store.fetch::<DefinitionRevision>(&ObjectKey::namespaced("ns", "d1"));
        assert!(rev.is_none(), "kinds are separate keyspaces");
    }
}
