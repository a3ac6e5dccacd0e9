//! Event sinks that do not need an API server.

use std::sync::{Mutex, PoisonError};

use defrev_core::EventRecorder;
use k8s_openapi::api::core::v1::ObjectReference;
use tracing::{info, warn};

fn describe(r: &ObjectReference) -> String {
    format!("{}/{}", r.namespace.as_deref().unwrap_or_default(), r.name.as_deref().unwrap_or_default())
}

/// Logs events instead of publishing them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn warn(&self, regarding: &ObjectReference, reason: &str, message: &str) {
        warn!(object = %describe(regarding), reason, message, "event");
    }

    fn info(&self, regarding: &ObjectReference, reason: &str, message: &str) {
        info!(object = %describe(regarding), reason, message, "event");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub warning: bool,
    pub object: String,
    pub reason: String,
    pub message: String,
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl CollectingRecorder {
    pub fn new() -> Self { Self::default() }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn warnings(&self) -> Vec<RecordedEvent> {
        self.events().into_iter().filter(|e| e.warning).collect()
    }

    fn push(&self, warning: bool, regarding: &ObjectReference, reason: &str, message: &str) {
        let ev = RecordedEvent { warning, object: describe(regarding), reason: reason.to_string(), message: message.to_string() };
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(ev);
    }
}

impl EventRecorder for CollectingRecorder {
    fn warn(&self, regarding: &ObjectReference, reason: &str, message: &str) { self.push(true, regarding, reason, message) }

    fn info(&self, regarding: &ObjectReference, reason: &str, message: &str) { self.push(false, regarding, reason, message) }
}
