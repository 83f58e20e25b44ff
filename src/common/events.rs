use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    Client,
    runtime::events::{Event, EventType, Recorder, Reporter},
};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Seam towards the cluster event stream.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, reference: &ObjectReference, kind: EventKind, reason: &str, note: String);
}

pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter { controller: controller_name.to_owned(), instance: std::env::var("POD_NAME").ok() };
        Self { recorder: Recorder::new(client, reporter) }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, reference: &ObjectReference, kind: EventKind, reason: &str, note: String) {
        let type_ = match kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        let event = Event { type_, reason: reason.to_owned(), note: Some(note), action: "Reconcile".to_owned(), secondary: None };
        if let Err(e) = self.recorder.publish(&event, reference).await {
            warn!("Unable to publish event {reason} for {:?}/{:?} {e:?}", reference.namespace, reference.name);
        }
    }
}
