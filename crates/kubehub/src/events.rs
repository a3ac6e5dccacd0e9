//! Kubernetes Event recorder. Publishing happens on a spawned task; failures are logged only.

use defrev_core::EventRecorder;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client,
};
use tracing::warn;

/// Upper bound the API server accepts for an event note.
const MAX_NOTE_BYTES: usize = 1024;

#[derive(Clone)]
pub struct KubeRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeRecorder {
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter { controller: controller.to_string(), instance: std::env::var("POD_NAME").ok() };
        Self { client, reporter }
    }

    fn publish(&self, type_: EventType, regarding: &ObjectReference, reason: &str, message: &str) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(_) => {
                warn!(reason, "no tokio runtime; dropping event");
                return;
            }
        };
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), regarding.clone());
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(truncate_note(message)),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        let object = regarding.name.clone().unwrap_or_default();
        handle.spawn(async move {
            if let Err(e) = recorder.publish(event).await {
                warn!(error = %e, object = %object, "failed to publish event");
            }
        });
    }
}

fn truncate_note(message: &str) -> String {
    if message.len() <= MAX_NOTE_BYTES {
        return message.to_string();
    }
    let mut end = MAX_NOTE_BYTES;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

impl EventRecorder for KubeRecorder {
    fn warn(&self, regarding: &ObjectReference, reason: &str, message: &str) {
        self.publish(EventType::Warning, regarding, reason, message);
    }

    fn info(&self, regarding: &ObjectReference, reason: &str, message: &str) {
        self.publish(EventType::Normal, regarding, reason, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notes_are_cut_on_char_boundaries() {
        assert_eq!(truncate_note("short"), "short");
        let long = "é".repeat(MAX_NOTE_BYTES);
        let cut = truncate_note(&long);
        assert!(cut.len() <= MAX_NOTE_BYTES);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
