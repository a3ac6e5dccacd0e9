use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use defrev_controller::{
    run_controller, CollectingRecorder, ControllerConfig, ConvertedWorkloadMaterializer, HashRevisionGenerator, Reconciler,
};
use defrev_core::{Capability, ComponentDefinition, ObjectKey, ResourceClient, SchemaStore, WorkloadGvk};
use defrev_schema::ConfigMapSchemaStore;
use defrev_store::MemStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct NoDiscovery;

#[async_trait::async_trait]
impl defrev_core::DiscoveryRefresher for NoDiscovery {
    async fn refresh(&self, _: &WorkloadGvk) -> anyhow::Result<()> { Ok(()) }

    fn mapping(&self, _: &WorkloadGvk) -> Option<defrev_core::ResourceMapping> { None }
}

/// Panics on its first call, then stores nothing.
#[derive(Default)]
struct PanicOnce {
    tripped: AtomicBool,
}

#[async_trait::async_trait]
impl SchemaStore for PanicOnce {
    async fn store(&self, _: &Capability, _: &str) -> anyhow::Result<()> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            panic!("schema backend blew up");
        }
        Ok(())
    }
}

fn worker_definition(store: &MemStore, name: &str) -> ObjectKey {
    let mut def = ComponentDefinition::new("vela-system", name, Default::default());
    def.spec.workload.type_ = "worker".into();
    store.insert(&def).unwrap();
    ObjectKey::namespaced("vela-system", name)
}

fn worker_workload_definition(store: &MemStore) {
    store
        .insert(&defrev_core::WorkloadDefinition {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("worker".into()),
                namespace: Some("vela-system".into()),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
}

async fn wait_published(store: &MemStore, key: &ObjectKey) -> String {
    for _ in 0..200 {
        if let Some(latest) = store.fetch::<ComponentDefinition>(key).and_then(|d| d.status.latest_revision) {
            return latest.name;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{key} never published");
}

#[tokio::test]
async fn controller_drains_keys_and_resync_until_cancelled() {
    let store = Arc::new(MemStore::new());
    let client: Arc<dyn ResourceClient> = store.clone();
    let config = ControllerConfig { concurrent_reconciles: 2, ..Default::default() };
    let reconciler = Arc::new(Reconciler::new(
        client.clone(),
        Arc::new(HashRevisionGenerator::new(client.clone())),
        Arc::new(NoDiscovery),
        Arc::new(ConvertedWorkloadMaterializer::new(client.clone(), Arc::new(NoDiscovery))),
        Arc::new(ConfigMapSchemaStore::new(client.clone())),
        Arc::new(CollectingRecorder::new()),
        &config,
    ));

    // Picked up by the initial resync.
    let mut listed = ComponentDefinition::new("vela-system", "listed", Default::default());
    listed.spec.workload.type_ = "worker".into();
    store.insert(&listed).unwrap();
    store.insert(&defrev_core::WorkloadDefinition {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some("worker".into()),
            namespace: Some("vela-system".into()),
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();

    let (tx, rx) = mpsc::channel(16);
    let token = CancellationToken::new();
    let handle = tokio::spawn(run_controller(reconciler, client.clone(), config, rx, token.clone()));

    assert_eq!(wait_published(&store, &ObjectKey::namespaced("vela-system", "listed")).await, "listed-v1");

    // Delivered through the key channel, twice.
    let mut sent = ComponentDefinition::new("vela-system", "sent", Default::default());
    sent.spec.workload.type_ = "worker".into();
    store.insert(&sent).unwrap();
    let key = ObjectKey::namespaced("vela-system", "sent");
    tx.send(key.clone()).await.unwrap();
    tx.send(key.clone()).await.unwrap();
    assert_eq!(wait_published(&store, &key).await, "sent-v1");

    token.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(store.all::<defrev_core::DefinitionRevision>(Some("vela-system")).len(), 2);
}

#[tokio::test]
async fn panicking_pass_is_retried_by_the_same_worker() {
    let store = Arc::new(MemStore::new());
    let client: Arc<dyn ResourceClient> = store.clone();
    let config = ControllerConfig { concurrent_reconciles: 1, resync: Duration::from_secs(3600), ..Default::default() };
    let schemas = Arc::new(PanicOnce::default());
    let reconciler = Arc::new(Reconciler::new(
        client.clone(),
        Arc::new(HashRevisionGenerator::new(client.clone())),
        Arc::new(NoDiscovery),
        Arc::new(ConvertedWorkloadMaterializer::new(client.clone(), Arc::new(NoDiscovery))),
        schemas.clone(),
        Arc::new(CollectingRecorder::new()),
        &config,
    ));
    worker_workload_definition(&store);
    let first = worker_definition(&store, "first");

    let (tx, rx) = mpsc::channel(16);
    let token = CancellationToken::new();
    let handle = tokio::spawn(run_controller(reconciler, client.clone(), config, rx, token.clone()));

    // The first pass panics; the key is retried after its backoff.
    assert_eq!(wait_published(&store, &first).await, "first-v1");
    assert!(schemas.tripped.load(Ordering::SeqCst));

    // The lone worker is still alive for new keys.
    let second = worker_definition(&store, "second");
    tx.send(second.clone()).await.unwrap();
    assert_eq!(wait_published(&store, &second).await, "second-v1");

    token.cancel();
    handle.await.unwrap().unwrap();
}
