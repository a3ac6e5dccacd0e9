//! Create-or-refresh of DefinitionRevision records.

use defrev_core::{ClientError, ComponentDefinition, DefinitionRevision, ObjectKey, ResourceClient, LABEL_COMPONENT_DEFINITION_NAME};
use tracing::{debug, info};

/// Stamp identity metadata derived from `def` onto `rev`.
fn stamp(namespace: &str, def: &ComponentDefinition, rev: &mut DefinitionRevision) {
    let mut labels = def.labels();
    labels.insert(LABEL_COMPONENT_DEFINITION_NAME.to_string(), def.name().to_string());
    rev.metadata.labels = Some(labels);
    rev.metadata.namespace = Some(namespace.to_string());
    rev.metadata.annotations = Some(def.annotations());
    rev.metadata.owner_references = Some(vec![def.controller_owner_ref()]);
}

/// Create `rev` if absent; otherwise refresh only labels, annotations and owner
/// references of the stored copy. Spec fields of an existing revision are never
/// written. Conflicts and other errors surface unchanged.
pub async fn upsert(
    client: &dyn ResourceClient,
    namespace: &str,
    def: &ComponentDefinition,
    rev: &DefinitionRevision,
) -> Result<DefinitionRevision, ClientError> {
    let mut desired = rev.clone();
    stamp(namespace, def, &mut desired);
    let key = ObjectKey::namespaced(namespace, desired.name());
    match client.get_obj::<DefinitionRevision>(&key).await {
        Err(e) if e.is_not_found() => {
            let created = client.create_obj(&desired).await?;
            info!(definition = %def.name(), revision = %key, "created definition revision");
            Ok(created)
        }
        Err(e) => Err(e),
        Ok(mut existing) => {
            existing.metadata.labels = desired.metadata.labels;
            existing.metadata.annotations = desired.metadata.annotations;
            existing.metadata.owner_references = desired.metadata.owner_references;
            debug!(revision = %key, "refreshing definition revision metadata");
            client.update_obj(&existing).await
        }
    }
}
