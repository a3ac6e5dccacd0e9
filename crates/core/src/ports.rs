//! Collaborators consumed by the reconciler. Each is injected at construction;
//! nothing here is process-global.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use serde::{Deserialize, Serialize};

use crate::definition::{ComponentDefinition, WorkloadGvk};
use crate::revision::DefinitionRevision;
use crate::workload::{Capability, WorkloadType};

/// Computes the revision record for the current spec.
///
/// Returns `(revision, true)` when no existing revision covers the spec hash; the
/// returned revision is then not yet persisted. `(revision, false)` returns the
/// existing revision that already covers it.
#[async_trait]
pub trait RevisionGenerator: Send + Sync {
    async fn generate(&self, def: &ComponentDefinition) -> anyhow::Result<(DefinitionRevision, bool)>;
}

/// Discovery metadata for a served resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMapping {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceMapping {
    /// `<plural>.<group>`, or just the plural for the core group.
    pub fn group_resource(&self) -> String {
        if self.group.is_empty() { self.plural.clone() } else { format!("{}.{}", self.plural, self.group) }
    }
}

#[async_trait]
pub trait DiscoveryRefresher: Send + Sync {
    /// Make sure discovery metadata for `type_ref` is loaded; errors when the type is not served.
    async fn refresh(&self, type_ref: &WorkloadGvk) -> anyhow::Result<()>;
    /// Cached mapping, if a previous refresh resolved it.
    fn mapping(&self, type_ref: &WorkloadGvk) -> Option<ResourceMapping>;
}

/// Converts a definition's workload reference into a concrete workload descriptor
/// and reports which artifact variant applies.
#[async_trait]
pub trait WorkloadMaterializer: Send + Sync {
    async fn materialize(&self, def: &ComponentDefinition) -> anyhow::Result<WorkloadType>;
}

/// Persists the parameter schema of a capability for one revision. Rewriting the
/// same revision must be harmless.
#[async_trait]
pub trait SchemaStore: Send + Sync {
    async fn store(&self, capability: &Capability, revision_name: &str) -> anyhow::Result<()>;
}

/// Fire-and-forget event sink. Implementations must not block and must swallow
/// their own failures.
pub trait EventRecorder: Send + Sync {
    fn warn(&self, regarding: &ObjectReference, reason: &str, message: &str);
    fn info(&self, regarding: &ObjectReference, reason: &str, message: &str);
}
