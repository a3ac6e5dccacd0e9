//! Defrev controller: drives ComponentDefinitions toward their latest DefinitionRevision.

#![forbid(unsafe_code)]

pub mod config;
pub mod gc;
pub mod generator;
pub mod materialize;
pub mod queue;
pub mod reconciler;
pub mod recorder;
pub mod retry;
pub mod revision;
pub mod status;

pub use config::ControllerConfig;
pub use gc::{GcError, GcReport, RevisionCollector};
pub use generator::{spec_hash, HashRevisionGenerator};
pub use materialize::ConvertedWorkloadMaterializer;
pub use queue::{run_controller, WorkQueue};
pub use reconciler::{Action, ReconcileError, Reconciler};
pub use recorder::{CollectingRecorder, RecordedEvent, TracingRecorder};
pub use retry::{retry_on, Backoff, RetryError};
pub use status::{StatusError, StatusUpdater};
