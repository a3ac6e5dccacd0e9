use std::sync::Arc;

use defrev_controller::{CollectingRecorder, RevisionCollector};
use defrev_core::{ComponentDefinition, DefinitionRevision, ResourceClient, LABEL_COMPONENT_DEFINITION_NAME};
use defrev_store::{FaultKind, MemStore, Verb};

async fn setup(revisions: i64) -> (Arc<MemStore>, Arc<dyn ResourceClient>, ComponentDefinition) {
    let store = Arc::new(MemStore::new());
    let client: Arc<dyn ResourceClient> = store.clone();
    let mut def = ComponentDefinition::new("vela-system", "d1", Default::default());
    def.spec.workload.type_ = "deployments.apps".into();
    let def = store.insert(&def).unwrap();
    for n in 1..=revisions {
        let mut rev = DefinitionRevision::default();
        rev.metadata.name = Some(DefinitionRevision::revision_name("d1", n));
        rev.metadata.namespace = Some("vela-system".into());
        rev.metadata.labels = Some([(LABEL_COMPONENT_DEFINITION_NAME.to_string(), "d1".to_string())].into());
        rev.metadata.owner_references = Some(vec![def.controller_owner_ref()]);
        rev.spec.revision = n;
        rev.spec.revision_hash = format!("h{}", n);
        client.create_obj(&rev).await.unwrap();
    }
    (store, client, def)
}

fn names(store: &MemStore) -> Vec<String> {
    let mut revs = store.all::<DefinitionRevision>(Some("vela-system"));
    revs.sort_by_key(DefinitionRevision::revision);
    revs.into_iter().map(|r| r.name().to_string()).collect()
}

#[tokio::test]
async fn deletes_oldest_first_down_to_limit() {
    let (store, client, def) = setup(5).await;
    let gc = RevisionCollector::new(client, Arc::new(CollectingRecorder::new()));
    let report = gc.collect(&def, 2).await.unwrap();
    assert_eq!(report.deleted, vec!["d1-v1", "d1-v2", "d1-v3"]);
    assert_eq!(names(&store), vec!["d1-v4", "d1-v5"]);
}

#[tokio::test]
async fn zero_limit_disables_collection() {
    let (store, client, def) = setup(3).await;
    let gc = RevisionCollector::new(client, Arc::new(CollectingRecorder::new()));
    assert_eq!(gc.collect(&def, 0).await.unwrap().deleted.len(), 0);
    assert_eq!(names(&store).len(), 3);
}

#[tokio::test]
async fn published_revision_survives_even_when_oldest() {
    let (store, client, mut def) = setup(3).await;
    def.status.latest_revision = Some(Default::default());
    if let Some(latest) = def.status.latest_revision.as_mut() {
        latest.name = "d1-v1".into();
        latest.revision = 1;
    }
    let gc = RevisionCollector::new(client, Arc::new(CollectingRecorder::new()));
    gc.collect(&def, 1).await.unwrap();
    assert_eq!(names(&store), vec!["d1-v1"]);
}

#[tokio::test]
async fn delete_failures_are_reported_not_returned() {
    let (store, client, def) = setup(3).await;
    let recorder = Arc::new(CollectingRecorder::new());
    let gc = RevisionCollector::new(client, recorder.clone());
    store.inject::<DefinitionRevision>(Verb::Delete, 1, FaultKind::Api("etcd timeout".into()));

    let report = gc.collect(&def, 1).await.unwrap();
    assert_eq!(report.failed, vec!["d1-v1"]);
    assert_eq!(report.deleted, vec!["d1-v2"]);
    assert_eq!(recorder.warnings().len(), 1);
    assert_eq!(names(&store), vec!["d1-v1", "d1-v3"]);
}

#[tokio::test]
async fn list_failure_is_a_gc_error() {
    let (store, client, def) = setup(3).await;
    let gc = RevisionCollector::new(client, Arc::new(CollectingRecorder::new()));
    store.inject::<DefinitionRevision>(Verb::List, 1, FaultKind::Api("unavailable".into()));
    let err = gc.collect(&def, 1).await.unwrap_err();
    assert!(err.to_string().contains("listing revisions of d1"));
}
