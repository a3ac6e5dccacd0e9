use std::sync::Arc;
use std::time::Duration;

use defrev_controller::{Backoff, StatusError, StatusUpdater};
use defrev_core::{ComponentDefinition, Condition, ObjectKey, ResourceClient, Revision};
use defrev_store::{FaultKind, MemStore, Verb};

fn backoff() -> Backoff {
    Backoff { steps: 5, initial: Duration::from_millis(1), factor: 2, cap: Duration::from_millis(4) }
}

fn desired(def: &ComponentDefinition) -> ComponentDefinition {
    let mut out = def.clone();
    out.status.latest_revision = Some(Revision { name: "d1-v1".into(), revision: 1, revision_hash: "h1".into() });
    out.status.set_condition(Condition::reconcile_success());
    out
}

#[tokio::test]
async fn conflicts_below_budget_still_write_captured_status() {
    let store = Arc::new(MemStore::new());
    let client: Arc<dyn ResourceClient> = store.clone();
    let def = store.insert(&ComponentDefinition::new("vela-system", "d1", Default::default())).unwrap();
    store.inject::<ComponentDefinition>(Verb::UpdateStatus, 4, FaultKind::Conflict);

    let want = desired(&def);
    let updated = StatusUpdater::new(client, backoff()).update_status(&want).await.unwrap();
    let stored = store.fetch::<ComponentDefinition>(&ObjectKey::namespaced("vela-system", "d1")).unwrap();
    assert_eq!(stored.status, want.status);
    assert_eq!(updated.status, want.status);
}

#[tokio::test]
async fn concurrent_spec_edit_is_not_clobbered() {
    let store = Arc::new(MemStore::new());
    let client: Arc<dyn ResourceClient> = store.clone();
    let def = store.insert(&ComponentDefinition::new("vela-system", "d1", Default::default())).unwrap();
    // Someone else edits the spec after we read `def`.
    store
        .mutate::<ComponentDefinition>(&ObjectKey::namespaced("vela-system", "d1"), |d| d.spec.workload.type_ = "edited".into())
        .unwrap();

    let updated = StatusUpdater::new(client, backoff()).update_status(&desired(&def)).await.unwrap();
    assert_eq!(updated.spec.workload.type_, "edited");
    assert_eq!(updated.status.latest_revision.unwrap().name, "d1-v1");
}

#[tokio::test]
async fn exhausted_budget_is_an_error() {
    let store = Arc::new(MemStore::new());
    let client: Arc<dyn ResourceClient> = store.clone();
    let def = store.insert(&ComponentDefinition::new("vela-system", "d1", Default::default())).unwrap();
    store.inject::<ComponentDefinition>(Verb::UpdateStatus, 5, FaultKind::Conflict);

    let err = StatusUpdater::new(client, backoff()).update_status(&desired(&def)).await.unwrap_err();
    assert!(matches!(err, StatusError::Exhausted { attempts: 5, .. }), "{err}");
    assert!(store.fetch::<ComponentDefinition>(&def_key()).unwrap().status.latest_revision.is_none());
}

#[tokio::test]
async fn other_errors_abort_immediately() {
    let store = Arc::new(MemStore::new());
    let client: Arc<dyn ResourceClient> = store.clone();
    let def = store.insert(&ComponentDefinition::new("vela-system", "d1", Default::default())).unwrap();
    store.inject::<ComponentDefinition>(Verb::UpdateStatus, 1, FaultKind::Api("forbidden".into()));
    store.inject::<ComponentDefinition>(Verb::UpdateStatus, 1, FaultKind::Conflict);

    let err = StatusUpdater::new(client, backoff()).update_status(&desired(&def)).await.unwrap_err();
    assert!(matches!(err, StatusError::Client { .. }), "{err}");
}

fn def_key() -> ObjectKey { ObjectKey::namespaced("vela-system", "d1") }
