//! Object store access: keys, errors and the `ResourceClient` seam.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{ApiResource, DynamicObject};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as Json;

/// Identity of an object inside one kind: optional namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }

    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            namespace: meta.namespace.clone().filter(|ns| !ns.is_empty()),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Errors surfaced by a `ResourceClient`. `Conflict` is the optimistic-concurrency
/// violation callers are expected to retry on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("{kind} \"{key}\" not found")]
    NotFound { kind: String, key: ObjectKey },
    #[error("conflict writing {kind} \"{key}\": {message}")]
    Conflict { kind: String, key: ObjectKey, message: String },
    #[error("{kind} \"{key}\" already exists")]
    AlreadyExists { kind: String, key: ObjectKey },
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("api error: {0}")]
    Api(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool { matches!(self, ClientError::NotFound { .. }) }
    pub fn is_conflict(&self) -> bool { matches!(self, ClientError::Conflict { .. }) }
    pub fn is_already_exists(&self) -> bool { matches!(self, ClientError::AlreadyExists { .. }) }
}

/// Equality-based label selector (`k=v,k2=v2`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.match_labels.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }

    pub fn is_empty(&self) -> bool { self.match_labels.is_empty() }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.match_labels {
            if !first { f.write_str(",")?; }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

/// A typed object that can travel through a `ResourceClient` as a `DynamicObject`.
pub trait Object: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn api_resource() -> ApiResource;
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> ObjectKey { ObjectKey::from_meta(self.meta()) }
}

/// Convert a typed object into its dynamic form, stamping apiVersion/kind.
pub fn to_dynamic<K: Object>(obj: &K) -> Result<DynamicObject, ClientError> {
    let ar = K::api_resource();
    let mut value = serde_json::to_value(obj)
        .map_err(|e| ClientError::Invalid(format!("serializing {}: {}", ar.kind, e)))?;
    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".into(), Json::String(ar.api_version.clone()));
        map.insert("kind".into(), Json::String(ar.kind.clone()));
    }
    serde_json::from_value(value).map_err(|e| ClientError::Invalid(format!("building dynamic {}: {}", ar.kind, e)))
}

pub fn from_dynamic<K: Object>(obj: DynamicObject) -> Result<K, ClientError> {
    let kind = K::api_resource().kind;
    let value = serde_json::to_value(&obj).map_err(|e| ClientError::Invalid(format!("serializing dynamic {}: {}", kind, e)))?;
    serde_json::from_value(value).map_err(|e| ClientError::Invalid(format!("decoding {} {}: {}", kind, ObjectKey::from_meta(&obj.metadata), e)))
}

/// Typed get/create/update/list/delete against a versioned object store.
///
/// `update` and `update_status` must fail with [`ClientError::Conflict`] when the
/// object's `metadata.resourceVersion` no longer matches the stored one. `delete`
/// must cascade to dependents whose controller owner reference names the deleted
/// object; the reconciler relies on it and never deletes dependents itself.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, ar: &ApiResource, key: &ObjectKey) -> Result<DynamicObject, ClientError>;
    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, ClientError>;
    /// Replace everything except `status`.
    async fn update(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, ClientError>;
    /// Replace only `status` (status subresource semantics).
    async fn update_status(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, ClientError>;
    async fn list(&self, ar: &ApiResource, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<DynamicObject>, ClientError>;
    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<(), ClientError>;
}

impl<'a> dyn ResourceClient + 'a {
    pub async fn get_obj<K: Object>(&self, key: &ObjectKey) -> Result<K, ClientError> {
        let obj = self.get(&K::api_resource(), key).await?;
        from_dynamic(obj)
    }

    /// Like `get_obj` but maps NotFound to `None`.
    pub async fn get_obj_opt<K: Object>(&self, key: &ObjectKey) -> Result<Option<K>, ClientError> {
        match self.get_obj::<K>(key).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create_obj<K: Object>(&self, obj: &K) -> Result<K, ClientError> {
        let dynamic = to_dynamic(obj)?;
        from_dynamic(self.create(&K::api_resource(), &dynamic).await?)
    }

    pub async fn update_obj<K: Object>(&self, obj: &K) -> Result<K, ClientError> {
        let dynamic = to_dynamic(obj)?;
        from_dynamic(self.update(&K::api_resource(), &dynamic).await?)
    }

    pub async fn update_status_obj<K: Object>(&self, obj: &K) -> Result<K, ClientError> {
        let dynamic = to_dynamic(obj)?;
        from_dynamic(self.update_status(&K::api_resource(), &dynamic).await?)
    }

    pub async fn list_obj<K: Object>(&self, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<K>, ClientError> {
        self.list(&K::api_resource(), namespace, selector)
            .await?
            .into_iter()
            .map(from_dynamic)
            .collect()
    }

    pub async fn delete_obj<K: Object>(&self, key: &ObjectKey) -> Result<(), ClientError> {
        self.delete(&K::api_resource(), key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_includes_namespace_when_present() {
        assert_eq!(ObjectKey::namespaced("vela-system", "webservice").to_string(), "vela-system/webservice");
        assert_eq!(ObjectKey::cluster("deployments.apps").to_string(), "deployments.apps");
    }

    #[test]
    fn key_from_meta_treats_empty_namespace_as_cluster_scope() {
        let meta = ObjectMeta { name: Some("x".into()), namespace: Some(String::new()), ..Default::default() };
        assert_eq!(ObjectKey::from_meta(&meta), ObjectKey::cluster("x"));
    }

    #[test]
    fn selector_matches_all_pairs() {
        let sel = LabelSelector::new().with("a", "1").with("b", "2");
        let mut labels = BTreeMap::new();
        labels.insert("a".to_string(), "1".to_string());
        assert!(!sel.matches(Some(&labels)));
        labels.insert("b".to_string(), "2".to_string());
        labels.insert("c".to_string(), "3".to_string());
        assert!(sel.matches(Some(&labels)));
        assert!(!sel.matches(None));
        assert!(LabelSelector::new().matches(None));
        assert_eq!(sel.to_string(), "a=1,b=2");
    }
}
