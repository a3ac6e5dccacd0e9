//! `ResourceClient` over the Kubernetes API using `Api<DynamicObject>`.

use async_trait::async_trait;
use defrev_core::{ClientError, LabelSelector, ObjectKey, ResourceClient};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use metrics::counter;
use tracing::debug;

/// Thin adapter: every call is one API request; conflicts come straight from the server.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self { Self { client } }

    pub fn inner(&self) -> &Client { &self.client }

    fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }
}

pub(crate) fn map_kube_err(ar: &ApiResource, key: &ObjectKey, err: kube::Error) -> ClientError {
    counter!("kube_api_errors_total", 1u64);
    match err {
        kube::Error::Api(resp) if resp.code == 404 => ClientError::NotFound { kind: ar.kind.clone(), key: key.clone() },
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            ClientError::AlreadyExists { kind: ar.kind.clone(), key: key.clone() }
        }
        kube::Error::Api(resp) if resp.code == 409 => {
            ClientError::Conflict { kind: ar.kind.clone(), key: key.clone(), message: resp.message }
        }
        other => ClientError::Api(other.to_string()),
    }
}

#[async_trait]
impl ResourceClient for KubeClient {
    async fn get(&self, ar: &ApiResource, key: &ObjectKey) -> Result<DynamicObject, ClientError> {
        self.api(ar, key.namespace.as_deref())
            .get(&key.name)
            .await
            .map_err(|e| map_kube_err(ar, key, e))
    }

    async fn create(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let key = ObjectKey::from_meta(&obj.metadata);
        debug!(kind = %ar.kind, key = %key, "kube: create");
        self.api(ar, key.namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_err(ar, &key, e))
    }

    async fn update(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let key = ObjectKey::from_meta(&obj.metadata);
        debug!(kind = %ar.kind, key = %key, rv = ?obj.metadata.resource_version, "kube: replace");
        self.api(ar, key.namespace.as_deref())
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_err(ar, &key, e))
    }

    async fn update_status(&self, ar: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let key = ObjectKey::from_meta(&obj.metadata);
        let body = serde_json::to_vec(obj).map_err(|e| ClientError::Invalid(format!("encoding {} {}: {}", ar.kind, key, e)))?;
        debug!(kind = %ar.kind, key = %key, rv = ?obj.metadata.resource_version, "kube: replace status");
        self.api(ar, key.namespace.as_deref())
            .replace_status(&key.name, &PostParams::default(), body)
            .await
            .map_err(|e| map_kube_err(ar, &key, e))
    }

    async fn list(&self, ar: &ApiResource, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<DynamicObject>, ClientError> {
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector.to_string());
        }
        let list_key = ObjectKey { namespace: namespace.map(str::to_string), name: String::new() };
        let list = self.api(ar, namespace).list(&lp).await.map_err(|e| map_kube_err(ar, &list_key, e))?;
        Ok(list.items)
    }

    async fn delete(&self, ar: &ApiResource, key: &ObjectKey) -> Result<(), ClientError> {
        debug!(kind = %ar.kind, key = %key, "kube: delete");
        self.api(ar, key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| map_kube_err(ar, key, e))
    }
}
