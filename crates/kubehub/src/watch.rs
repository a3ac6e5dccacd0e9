//! Watch ComponentDefinitions and feed their keys to the work queue.

use anyhow::Result;
use defrev_core::{ComponentDefinition, Object, ObjectKey};
use futures::StreamExt;
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::{watcher::{self, Event}, WatchStreamExt},
    Client,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Start list+watch for ComponentDefinitions and send the key of every applied
/// object. Returns when the receiving side is gone or the stream ends.
pub async fn watch_definitions(client: Client, namespace: Option<&str>, key_tx: mpsc::Sender<ObjectKey>) -> Result<()> {
    let ar = ComponentDefinition::api_resource();
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    };
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(ns = ?namespace, "definition watcher started");
    while let Some(item) = stream.next().await {
        let keys: Vec<ObjectKey> = match item {
            Ok(Event::Applied(o)) => vec![ObjectKey::from_meta(&o.metadata)],
            Ok(Event::Deleted(o)) => {
                // Dependents go with the owner; nothing left to converge.
                debug!(key = %ObjectKey::from_meta(&o.metadata), "definition deleted");
                continue;
            }
            Ok(Event::Restarted(list)) => {
                debug!(count = list.len(), "watch restart");
                list.iter().map(|o| ObjectKey::from_meta(&o.metadata)).collect()
            }
            Err(e) => {
                warn!(error = %e, "definition watch error; backing off");
                continue;
            }
        };
        for key in keys {
            if key_tx.send(key).await.is_err() {
                info!("work queue closed; stopping definition watcher");
                return Ok(());
            }
        }
    }
    warn!("definition watch stream ended");
    Ok(())
}
