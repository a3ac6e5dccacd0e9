//! Revision garbage collection: keep the newest `limit` revisions per definition.

use std::sync::Arc;

use defrev_core::{ClientError, ComponentDefinition, DefinitionRevision, EventRecorder, Object, ResourceClient};
use metrics::counter;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum GcError {
    #[error("listing revisions of {definition}: {source}")]
    List {
        definition: String,
        #[source]
        source: ClientError,
    },
}

pub struct RevisionCollector {
    client: Arc<dyn ResourceClient>,
    recorder: Arc<dyn EventRecorder>,
}

impl RevisionCollector {
    pub fn new(client: Arc<dyn ResourceClient>, recorder: Arc<dyn EventRecorder>) -> Self { Self { client, recorder } }

    /// Delete the oldest revisions of `def` until at most `limit` remain. `limit`
    /// 0 disables collection. The revision published in status is always kept.
    /// Individual delete failures are reported, not returned.
    pub async fn collect(&self, def: &ComponentDefinition, limit: usize) -> Result<GcReport, GcError> {
        let mut report = GcReport::default();
        if limit == 0 {
            return Ok(report);
        }
        let mut revs = self
            .client
            .list_obj::<DefinitionRevision>(Some(def.namespace()), &def.revision_selector())
            .await
            .map_err(|source| GcError::List { definition: def.name().to_string(), source })?;
        if revs.len() <= limit {
            return Ok(report);
        }
        revs.sort_by_key(DefinitionRevision::revision);
        let published = def.status.latest_revision.as_ref().map(|r| r.name.as_str());
        let excess = revs.len() - limit;
        let victims = revs.iter().filter(|r| Some(r.name()) != published).take(excess);
        for rev in victims {
            match self.client.delete_obj::<DefinitionRevision>(&rev.key()).await {
                Ok(()) => {
                    debug!(definition = %def.name(), revision = %rev.name(), "collected revision");
                    counter!("revision_gc_deleted_total", 1u64);
                    report.deleted.push(rev.name().to_string());
                }
                Err(e) if e.is_not_found() => report.deleted.push(rev.name().to_string()),
                Err(e) => {
                    warn!(definition = %def.name(), revision = %rev.name(), error = %e, "failed to collect revision");
                    self.recorder.warn(&def.object_ref(), "FailedGC", &format!("deleting revision {}: {}", rev.name(), e));
                    report.failed.push(rev.name().to_string());
                }
            }
        }
        Ok(report)
    }
}
