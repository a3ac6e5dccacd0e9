//! Defrev schema store: derive a capability's parameter schema and keep it in ConfigMaps.

#![forbid(unsafe_code)]

pub mod openapi;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use defrev_core::{
    Capability, ComponentDefinition, KubeSchematic, Object, ObjectKey, ResourceClient, SchemaStore, WorkloadArtifact,
    WorkloadDefinition,
};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value as Json;
use tracing::{debug, info};

pub const SCHEMA_DATA_KEY: &str = "openapi-v3-json-schema";
pub const LABEL_DEFINITION: &str = "definition.oam.dev";
pub const LABEL_DEFINITION_NAME: &str = "definition.oam.dev/name";

/// `schema-<name>`
pub fn schema_configmap_name(name: &str) -> String { format!("schema-{}", name) }

/// Stores schemas as ConfigMaps next to the definition: one tracking the latest
/// revision and one per revision.
pub struct ConfigMapSchemaStore {
    client: Arc<dyn ResourceClient>,
}

impl ConfigMapSchemaStore {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self { Self { client } }

    /// Derive the parameter schema for a capability.
    pub async fn derive(&self, capability: &Capability) -> Result<Json> {
        match &capability.artifact {
            Some(WorkloadArtifact::Kube(KubeSchematic { parameters, .. })) if !parameters.is_empty() => {
                Ok(openapi::from_kube_parameters(parameters))
            }
            Some(WorkloadArtifact::Reference { workload_definition }) => {
                Ok(self.referenced_crd_schema(&capability.definition, workload_definition).await?.unwrap_or_else(openapi::permissive))
            }
            _ => Ok(openapi::permissive()),
        }
    }

    /// Schema of the CRD behind a referenced WorkloadDefinition, when both exist.
    async fn referenced_crd_schema(&self, def: &ComponentDefinition, workload_definition: &str) -> Result<Option<Json>> {
        let wd_key = ObjectKey::namespaced(def.namespace(), workload_definition);
        let Some(wd) = self
            .client
            .get_obj_opt::<WorkloadDefinition>(&wd_key)
            .await
            .with_context(|| format!("fetching workload definition {}", wd_key))?
        else {
            debug!(definition = %def.key(), workload = %wd_key, "schema: workload definition absent");
            return Ok(None);
        };
        let reference = &wd.spec.definition_ref;
        let crd_key = ObjectKey::cluster(reference.name.clone());
        let Some(crd) = self
            .client
            .get_obj_opt::<CustomResourceDefinition>(&crd_key)
            .await
            .with_context(|| format!("fetching crd {}", crd_key))?
        else {
            debug!(definition = %def.key(), crd = %crd_key, "schema: crd absent");
            return Ok(None);
        };
        let raw = serde_json::to_value(&crd).with_context(|| format!("encoding crd {}", crd_key))?;
        Ok(openapi::crd_spec_schema(&raw, &reference.version))
    }

    /// Create or update one schema ConfigMap; identical content is left alone.
    async fn write(&self, def: &ComponentDefinition, name: &str, schema: &str) -> Result<()> {
        let key = ObjectKey::namespaced(def.namespace(), name);
        let data = BTreeMap::from([(SCHEMA_DATA_KEY.to_string(), schema.to_string())]);
        let labels = BTreeMap::from([
            (LABEL_DEFINITION.to_string(), "schema".to_string()),
            (LABEL_DEFINITION_NAME.to_string(), def.name().to_string()),
        ]);
        match self.client.get_obj_opt::<ConfigMap>(&key).await.with_context(|| format!("fetching configmap {}", key))? {
            None => {
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(def.namespace().to_string()),
                        labels: Some(labels),
                        owner_references: Some(vec![def.controller_owner_ref()]),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                self.client.create_obj(&cm).await.with_context(|| format!("creating configmap {}", key))?;
                info!(definition = %def.key(), configmap = %key, "schema: created");
            }
            Some(existing) if existing.data.as_ref() == Some(&data) => {
                debug!(configmap = %key, "schema: unchanged");
            }
            Some(mut existing) => {
                existing.data = Some(data);
                existing.metadata.labels.get_or_insert_with(BTreeMap::new).extend(labels);
                existing.metadata.owner_references = Some(vec![def.controller_owner_ref()]);
                self.client.update_obj(&existing).await.with_context(|| format!("updating configmap {}", key))?;
                info!(definition = %def.key(), configmap = %key, "schema: updated");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaStore for ConfigMapSchemaStore {
    async fn store(&self, capability: &Capability, revision_name: &str) -> Result<()> {
        let schema = self.derive(capability).await?;
        let body = serde_json::to_string(&schema).context("encoding schema")?;
        let def = &capability.definition;
        self.write(def, &schema_configmap_name(capability.name()), &body).await?;
        self.write(def, &schema_configmap_name(revision_name), &body).await
    }
}
