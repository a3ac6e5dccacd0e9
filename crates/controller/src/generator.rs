//! Content-addressed revision numbering.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use defrev_core::revision::DEFINITION_TYPE_COMPONENT;
use defrev_core::{ComponentDefinition, ComponentDefinitionSpec, DefinitionRevision, DefinitionRevisionSpec, ResourceClient, RevisionGenerator};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use sha2::{Digest, Sha256};
use tracing::debug;

const HASH_LEN: usize = 16;

/// First 16 hex chars of sha256 over the spec's JSON encoding. Object keys of
/// free-form fields are sorted, so equal specs hash equal.
pub fn spec_hash(spec: &ComponentDefinitionSpec) -> Result<String> {
    let bytes = serde_json::to_vec(spec).context("encoding definition spec")?;
    let digest = Sha256::digest(&bytes);
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_LEN);
    Ok(hex)
}

/// Identity plus spec; status and server-managed metadata are left out.
fn snapshot(def: &ComponentDefinition) -> ComponentDefinition {
    ComponentDefinition {
        metadata: ObjectMeta {
            name: def.metadata.name.clone(),
            namespace: def.metadata.namespace.clone(),
            labels: def.metadata.labels.clone(),
            annotations: def.metadata.annotations.clone(),
            ..Default::default()
        },
        spec: def.spec.clone(),
        status: Default::default(),
    }
}

pub struct HashRevisionGenerator {
    client: Arc<dyn ResourceClient>,
}

impl HashRevisionGenerator {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self { Self { client } }
}

#[async_trait]
impl RevisionGenerator for HashRevisionGenerator {
    async fn generate(&self, def: &ComponentDefinition) -> Result<(DefinitionRevision, bool)> {
        let hash = spec_hash(&def.spec)?;
        let existing = self
            .client
            .list_obj::<DefinitionRevision>(Some(def.namespace()), &def.revision_selector())
            .await
            .with_context(|| format!("listing revisions of {}", def.name()))?;

        // Equal hash alone is not enough: the stored snapshot must carry the same spec.
        if let Some(found) = existing
            .iter()
            .filter(|r| r.spec.revision_hash == hash && r.spec.component_definition.spec == def.spec)
            .max_by_key(|r| r.revision())
        {
            debug!(definition = %def.name(), revision = %found.name(), "spec already covered by a revision");
            return Ok((found.clone(), false));
        }

        let published = def.status.latest_revision.as_ref().map(|r| r.revision).unwrap_or(0);
        let next = existing.iter().map(DefinitionRevision::revision).chain(std::iter::once(published)).max().unwrap_or(0) + 1;
        let rev = DefinitionRevision {
            metadata: ObjectMeta {
                name: Some(DefinitionRevision::revision_name(def.name(), next)),
                namespace: def.metadata.namespace.clone(),
                ..Default::default()
            },
            spec: DefinitionRevisionSpec {
                revision: next,
                revision_hash: hash,
                definition_type: DEFINITION_TYPE_COMPONENT.to_string(),
                component_definition: snapshot(def),
            },
        };
        debug!(definition = %def.name(), revision = %rev.name(), "new revision computed");
        Ok((rev, true))
    }
}
