//! One convergence pass per ComponentDefinition change.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use defrev_core::{
    ArtifactError, Capability, ClientError, ComponentDefinition, Condition, DefinitionRevision, DiscoveryRefresher,
    EventRecorder, ObjectKey, ResourceClient, RevisionGenerator, SchemaStore, WorkloadArtifact, WorkloadMaterializer,
};
use metrics::{counter, histogram};
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::gc::RevisionCollector;
use crate::revision;
use crate::status::{StatusError, StatusUpdater};

/// What the dispatcher should do with the key after a successful pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Action {
    pub requeue_after: Option<Duration>,
}

impl Action {
    pub fn done() -> Self { Self::default() }

    pub fn requeue(after: Duration) -> Self { Self { requeue_after: Some(after) } }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("fetching definition {key}: {source}")]
    Fetch {
        key: ObjectKey,
        #[source]
        source: ClientError,
    },
    #[error("refreshing discovery for {definition}: {error:#}")]
    RefreshDiscovery { definition: String, error: anyhow::Error },
    #[error("generating revision for {definition}: {error:#}")]
    GenerateRevision { definition: String, error: anyhow::Error },
    #[error("materializing workload of {definition}: {error:#}")]
    Materialize { definition: String, error: anyhow::Error },
    #[error("selecting workload artifact of {definition}: {source}")]
    Artifact {
        definition: String,
        #[source]
        source: ArtifactError,
    },
    #[error("storing schema of {definition} for {revision}: {error:#}")]
    StoreSchema { definition: String, revision: String, error: anyhow::Error },
    #[error("upserting revision {revision} of {definition}: {source}")]
    UpsertRevision {
        definition: String,
        revision: String,
        #[source]
        source: ClientError,
    },
    #[error("publishing status of {definition}: {source}")]
    UpdateStatus {
        definition: String,
        #[source]
        source: StatusError,
    },
}

impl ReconcileError {
    /// Event reason for the failed step.
    pub fn reason(&self) -> &'static str {
        match self {
            ReconcileError::Fetch { .. } => "FailedFetch",
            ReconcileError::RefreshDiscovery { .. } => "FailedRefreshDiscovery",
            ReconcileError::GenerateRevision { .. } => "FailedGenerateRevision",
            ReconcileError::Materialize { .. } => "FailedMaterialize",
            ReconcileError::Artifact { .. } => "FailedSelectArtifact",
            ReconcileError::StoreSchema { .. } => "FailedStoreSchema",
            ReconcileError::UpsertRevision { .. } => "FailedUpsertRevision",
            ReconcileError::UpdateStatus { .. } => "FailedUpdateStatus",
        }
    }
}

pub struct Reconciler {
    client: Arc<dyn ResourceClient>,
    generator: Arc<dyn RevisionGenerator>,
    discovery: Arc<dyn DiscoveryRefresher>,
    materializer: Arc<dyn WorkloadMaterializer>,
    schemas: Arc<dyn SchemaStore>,
    recorder: Arc<dyn EventRecorder>,
    status: StatusUpdater,
    gc: RevisionCollector,
    revision_limit: usize,
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        generator: Arc<dyn RevisionGenerator>,
        discovery: Arc<dyn DiscoveryRefresher>,
        materializer: Arc<dyn WorkloadMaterializer>,
        schemas: Arc<dyn SchemaStore>,
        recorder: Arc<dyn EventRecorder>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            status: StatusUpdater::new(client.clone(), config.status_backoff),
            gc: RevisionCollector::new(client.clone(), recorder.clone()),
            revision_limit: config.def_revision_limit,
            client,
            generator,
            discovery,
            materializer,
            schemas,
            recorder,
        }
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let started = Instant::now();
        counter!("reconcile_total", 1u64);
        let out = self.reconcile_definition(key).await;
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        if out.is_err() {
            counter!("reconcile_errors_total", 1u64);
        }
        out
    }

    async fn reconcile_definition(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let def = match self.client.get_obj_opt::<ComponentDefinition>(key).await {
            Ok(Some(def)) => def,
            Ok(None) => {
                debug!(definition = %key, "definition gone; nothing to do");
                return Ok(Action::done());
            }
            Err(source) => return Err(ReconcileError::Fetch { key: key.clone(), source }),
        };
        if def.is_deleting() {
            // Dependents are owned; cascade removes them.
            info!(definition = %key, "definition is being deleted");
            return Ok(Action::done());
        }
        info!(definition = %key, "reconciling");

        if def.spec.workload.type_.is_empty() {
            let refreshed = match def.spec.workload.definition.as_ref() {
                Some(gvk) => self.discovery.refresh(gvk).await,
                None => Err(anyhow!("neither workload.type nor workload.definition is set")),
            };
            if let Err(error) = refreshed {
                return Err(self.fail(&def, ReconcileError::RefreshDiscovery { definition: def.name().into(), error }).await);
            }
        }

        let (rev, is_new) = match self.generator.generate(&def).await {
            Ok(generated) => generated,
            Err(error) => {
                return Err(self.fail(&def, ReconcileError::GenerateRevision { definition: def.name().into(), error }).await)
            }
        };

        if !is_new && rev.is_published_on(&def) {
            self.settle(&def, &rev).await
        } else {
            self.publish(&def, &rev, is_new).await
        }
    }

    /// Spec unchanged and already published: refresh revision metadata, clear a
    /// stale failure condition, prune.
    async fn settle(&self, def: &ComponentDefinition, rev: &DefinitionRevision) -> Result<Action, ReconcileError> {
        if let Err(source) = revision::upsert(self.client.as_ref(), def.namespace(), def, rev).await {
            let err = ReconcileError::UpsertRevision { definition: def.name().into(), revision: rev.name().into(), source };
            return Err(self.fail(def, err).await);
        }
        if !def.status.is_synced() {
            let mut synced = def.clone();
            synced.status.set_condition(Condition::reconcile_success());
            if let Err(source) = self.status.update_status(&synced).await {
                return Err(self.fail(def, ReconcileError::UpdateStatus { definition: def.name().into(), source }).await);
            }
        }
        debug!(definition = %def.name(), revision = %rev.name(), "definition up to date");
        self.collect(def).await;
        Ok(Action::done())
    }

    /// Materialize artifacts for `rev`, persist it and point status at it.
    async fn publish(&self, def: &ComponentDefinition, rev: &DefinitionRevision, is_new: bool) -> Result<Action, ReconcileError> {
        let name = def.name().to_string();
        let workload_type = match self.materializer.materialize(def).await {
            Ok(ty) => ty,
            Err(error) => return Err(self.fail(def, ReconcileError::Materialize { definition: name, error }).await),
        };
        let artifact = match WorkloadArtifact::select(workload_type, def) {
            Ok(artifact) => artifact,
            Err(source) => return Err(self.fail(def, ReconcileError::Artifact { definition: name, source }).await),
        };
        debug!(definition = %name, workload_type = %workload_type, "workload materialized");

        let capability = Capability { definition: def.clone(), workload_type, artifact };
        if let Err(error) = self.schemas.store(&capability, rev.name()).await {
            let err = ReconcileError::StoreSchema { definition: name, revision: rev.name().into(), error };
            return Err(self.fail(def, err).await);
        }

        if let Err(source) = revision::upsert(self.client.as_ref(), def.namespace(), def, rev).await {
            let err = ReconcileError::UpsertRevision { definition: name, revision: rev.name().into(), source };
            return Err(self.fail(def, err).await);
        }
        if is_new {
            counter!("revisions_created_total", 1u64);
        }

        let mut desired = def.clone();
        desired.status.latest_revision = Some(rev.to_revision_ref());
        desired.status.set_condition(Condition::reconcile_success());
        let published = match self.status.update_status(&desired).await {
            Ok(published) => published,
            Err(source) => return Err(self.fail(def, ReconcileError::UpdateStatus { definition: name, source }).await),
        };
        info!(definition = %name, revision = %rev.name(), new = is_new, "published revision");
        self.recorder.info(&def.object_ref(), "RevisionPublished", &format!("latest revision is {}", rev.name()));

        self.collect(&published).await;
        Ok(Action::done())
    }

    async fn collect(&self, def: &ComponentDefinition) {
        match self.gc.collect(def, self.revision_limit).await {
            Ok(report) if !report.deleted.is_empty() || !report.failed.is_empty() => {
                debug!(definition = %def.name(), deleted = report.deleted.len(), failed = report.failed.len(), "revision gc");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(definition = %def.name(), error = %e, "revision gc skipped");
                self.recorder.warn(&def.object_ref(), "FailedGC", &e.to_string());
            }
        }
    }

    /// Log, emit a warning event and record a failure condition. Returns `err`.
    async fn fail(&self, def: &ComponentDefinition, err: ReconcileError) -> ReconcileError {
        let message = err.to_string();
        error!(definition = %def.name(), error = %message, "reconcile failed");
        self.recorder.warn(&def.object_ref(), err.reason(), &message);
        // A status write failure would only fail again here.
        if !matches!(err, ReconcileError::UpdateStatus { .. }) {
            let mut failed = def.clone();
            failed.status.set_condition(Condition::reconcile_error(message));
            if let Err(e) = self.status.update_status(&failed).await {
                info!(definition = %def.name(), error = %e, "could not record failure condition");
            }
        }
        err
    }
}
