//! Converted WorkloadDefinition management.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use defrev_core::{
    ComponentDefinition, DefinitionReference, DiscoveryRefresher, ObjectKey, ResourceClient, WorkloadDefinition,
    WorkloadDefinitionSpec, WorkloadMaterializer, WorkloadType,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

/// A definition naming `workload.type` must point at an existing
/// WorkloadDefinition. One declaring `workload.definition` instead gets a
/// WorkloadDefinition of its own, referencing the discovered resource.
pub struct ConvertedWorkloadMaterializer {
    client: Arc<dyn ResourceClient>,
    discovery: Arc<dyn DiscoveryRefresher>,
}

impl ConvertedWorkloadMaterializer {
    pub fn new(client: Arc<dyn ResourceClient>, discovery: Arc<dyn DiscoveryRefresher>) -> Self {
        Self { client, discovery }
    }

    async fn ensure_converted(&self, def: &ComponentDefinition) -> Result<()> {
        let key = ObjectKey::namespaced(def.namespace(), def.name());
        if self.client.get_obj_opt::<WorkloadDefinition>(&key).await.with_context(|| format!("fetching workload definition {}", key))?.is_some() {
            debug!(definition = %key, "converted workload definition present");
            return Ok(());
        }
        let Some(gvk) = def.spec.workload.definition.as_ref().filter(|g| !g.kind.is_empty()) else {
            bail!("definition {} sets neither workload.type nor workload.definition", key);
        };
        let mapping = match self.discovery.mapping(gvk) {
            Some(m) => m,
            None => {
                self.discovery.refresh(gvk).await.with_context(|| format!("resolving {}", gvk))?;
                self.discovery.mapping(gvk).ok_or_else(|| anyhow!("no resource mapping for {}", gvk))?
            }
        };
        let wd = WorkloadDefinition {
            metadata: ObjectMeta {
                name: Some(def.name().to_string()),
                namespace: Some(def.namespace().to_string()),
                labels: def.metadata.labels.clone(),
                owner_references: Some(vec![def.controller_owner_ref()]),
                ..Default::default()
            },
            spec: WorkloadDefinitionSpec {
                definition_ref: DefinitionReference { name: mapping.group_resource(), version: mapping.version.clone() },
                ..Default::default()
            },
        };
        match self.client.create_obj(&wd).await {
            Ok(_) => {
                info!(definition = %key, reference = %wd.spec.definition_ref.name, "created converted workload definition");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e).with_context(|| format!("creating workload definition {}", key)),
        }
    }
}

#[async_trait]
impl WorkloadMaterializer for ConvertedWorkloadMaterializer {
    async fn materialize(&self, def: &ComponentDefinition) -> Result<WorkloadType> {
        let referenced = &def.spec.workload.type_;
        if referenced.is_empty() {
            self.ensure_converted(def).await?;
        } else {
            let key = ObjectKey::namespaced(def.namespace(), referenced.clone());
            self.client
                .get_obj::<WorkloadDefinition>(&key)
                .await
                .with_context(|| format!("workload definition {} referenced by {}", key, def.name()))?;
        }
        Ok(WorkloadType::of(&def.spec))
    }
}
