//! Discovery refresher backed by kube `Discovery`, cached behind an `ArcSwap`.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use defrev_core::{DiscoveryRefresher, ResourceMapping, WorkloadGvk};
use kube::{discovery::{Discovery, Scope}, Client};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

type MappingTable = FxHashMap<WorkloadGvk, ResourceMapping>;

/// Resolves apiVersion/kind pairs to served resources. Readers never block; a
/// refresh swaps in a complete new table.
pub struct KubeDiscovery {
    client: Client,
    table: ArcSwap<MappingTable>,
}

impl KubeDiscovery {
    pub fn new(client: Client) -> Self {
        Self { client, table: ArcSwap::from_pointee(MappingTable::default()) }
    }

    async fn rebuild(&self) -> Result<usize> {
        let discovery = Discovery::new(self.client.clone()).run().await.context("running API discovery")?;
        let mut next = MappingTable::default();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let mapping = ResourceMapping {
                        group: ar.group.clone(),
                        version: ar.version.clone(),
                        kind: ar.kind.clone(),
                        plural: ar.plural.clone(),
                        namespaced: matches!(caps.scope, Scope::Namespaced),
                    };
                    next.insert(WorkloadGvk::new(ar.api_version.clone(), ar.kind.clone()), mapping);
                }
            }
        }
        let n = next.len();
        self.table.store(Arc::new(next));
        Ok(n)
    }
}

#[async_trait]
impl DiscoveryRefresher for KubeDiscovery {
    async fn refresh(&self, type_ref: &WorkloadGvk) -> Result<()> {
        if self.mapping(type_ref).is_some() {
            debug!(gvk = %type_ref, "discovery: cached");
            return Ok(());
        }
        let served = self.rebuild().await?;
        info!(gvk = %type_ref, served, "discovery: refreshed");
        if self.mapping(type_ref).is_none() {
            bail!("kind {} is not served by the API server", type_ref);
        }
        Ok(())
    }

    fn mapping(&self, type_ref: &WorkloadGvk) -> Option<ResourceMapping> {
        self.table.load().get(type_ref).cloned()
    }
}
