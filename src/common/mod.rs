mod api;
mod bucket;
mod events;
mod lister;
mod resource_key;
mod state;

use std::collections::BTreeMap;

pub use api::{ApiError, ApiErrorKind, KubeApi, ObjectApi, ObjectPatch};
pub use bucket::{AnnotationBucket, Bucket, EnvBucket};
pub use events::{EventKind, EventPublisher, KubeEventPublisher};
use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use kube::{Resource, ResourceExt};
use kube_core::ObjectMeta;
pub use lister::{Lister, spawn_reflector, wait_until_synced};
pub use resource_key::{DEFAULT_NAMESPACE_NAME, ResourceKey};
pub use state::{PayloadDigest, State, StorageError};

use crate::crds::Gateway;

pub const OWNERSHIP_LABEL: &str = "gateway.operator.io/gateway-name";
pub const REVISION_LABEL: &str = "controller-revision-hash";
pub const READINESS_GATE_CONDITION: &str = "gateway.operator.io/routes-ready";
pub const RESTART_ANNOTATION: &str = "gateway.operator.io/restartedAt";

pub const HTTP_PORT: i32 = 8080;
pub const MANAGEMENT_PORT: i32 = 8090;
pub const CLUSTER_PORT: i32 = 5701;

pub fn headless_service_name(gateway_name: &str) -> String {
    format!("{gateway_name}-headless")
}

pub fn ownership_labels(gateway_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(OWNERSHIP_LABEL.to_owned(), gateway_name.to_owned())])
}

/// Metadata shared by every object owned by a Gateway.
pub fn owned_object_meta(gateway: &Gateway, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_owned()),
        namespace: gateway.namespace(),
        labels: Some(ownership_labels(&gateway.name_any())),
        owner_references: gateway.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    }
}

pub fn gateway_reference(gateway: &Gateway) -> ObjectReference {
    gateway.object_ref(&())
}

pub fn pod_containers_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .is_some_and(|statuses| !statuses.is_empty() && statuses.iter().all(|c| c.ready))
}

pub fn pod_condition_status<'a>(pod: &'a Pod, condition_type: &str) -> Option<&'a str> {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == condition_type))
        .map(|c| c.status.as_str())
}

pub fn gateway_of_pod(pod: &Pod) -> Option<&String> {
    pod.labels().get(OWNERSHIP_LABEL)
}
