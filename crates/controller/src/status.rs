//! Conflict-safe status writes for ComponentDefinitions.

use std::sync::Arc;

use defrev_core::{ClientError, ComponentDefinition, Object, ObjectKey, ResourceClient};
use metrics::counter;
use tracing::{debug, warn};

use crate::retry::{retry_on, Backoff, RetryError};

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("updating status of {key}: {source}")]
    Client {
        key: ObjectKey,
        #[source]
        source: ClientError,
    },
    #[error("updating status of {key}: still conflicting after {attempts} attempts")]
    Exhausted { key: ObjectKey, attempts: u32 },
}

/// Writes a captured status onto the freshest copy of the object, retrying on
/// write conflicts.
#[derive(Clone)]
pub struct StatusUpdater {
    client: Arc<dyn ResourceClient>,
    backoff: Backoff,
}

impl StatusUpdater {
    pub fn new(client: Arc<dyn ResourceClient>, backoff: Backoff) -> Self { Self { client, backoff } }

    /// The status of `def` is captured once; every attempt re-fetches the object
    /// and overwrites its status with that same value.
    pub async fn update_status(&self, def: &ComponentDefinition) -> Result<ComponentDefinition, StatusError> {
        let key = def.key();
        let desired = &def.status;
        let client = &self.client;
        let key_ref = &key;
        let out = retry_on(&self.backoff, ClientError::is_conflict, move || async move {
            let mut latest = client.get_obj::<ComponentDefinition>(key_ref).await?;
            latest.status = desired.clone();
            match client.update_status_obj(&latest).await {
                Err(e) if e.is_conflict() => {
                    counter!("status_conflicts_total", 1u64);
                    debug!(definition = %key_ref, "status write conflicted");
                    Err(e)
                }
                other => other,
            }
        })
        .await;
        match out {
            Ok(updated) => Ok(updated),
            Err(RetryError::Failed(source)) => Err(StatusError::Client { key, source }),
            Err(RetryError::Exhausted { attempts, .. }) => {
                warn!(definition = %key, attempts, "status update kept conflicting");
                Err(StatusError::Exhausted { key, attempts })
            }
        }
    }
}
