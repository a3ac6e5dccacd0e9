//! Defrev kubehub: Kubernetes-backed implementations of the controller's seams.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::Client;

mod client;
mod discovery;
mod events;
mod watch;

pub use client::KubeClient;
pub use discovery::KubeDiscovery;
pub use events::KubeRecorder;
pub use watch::watch_definitions;

/// Client from the ambient kubeconfig or in-cluster service account.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig/in-cluster config")
}
