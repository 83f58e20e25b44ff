use std::sync::Arc;

use k8s_openapi::{
    api::{apps::v1::StatefulSet, core::v1::Pod},
    chrono::{SecondsFormat, Utc},
};
use kube::ResourceExt;
use serde_json::json;

use crate::{
    common::{OWNERSHIP_LABEL, ObjectPatch, REVISION_LABEL, pod_containers_ready},
    crds::{Gateway, GatewayCondition},
};

pub const READY_CONDITION: &str = "Ready";
pub const REASON_CREATED: &str = "Created";
pub const REASON_UPDATED: &str = "Updated";
pub const REASON_WAITING_PODS: &str = "WaitingPods";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready { reason: &'static str },
    Waiting { ready: usize, desired: usize },
}

fn on_current_revision(pod: &Pod, workload: &StatefulSet) -> bool {
    let generation = workload.metadata.generation.unwrap_or_default();
    let Some(status) = workload.status.as_ref() else {
        return false;
    };
    if status.observed_generation != Some(generation) {
        return false;
    }
    generation <= 1 || pod.labels().get(REVISION_LABEL) == status.update_revision.as_ref()
}

/// Pods owned by the gateway, rolled out from the current workload revision, with all containers ready.
pub fn ready_pods(gateway_name: &str, workload: Option<&StatefulSet>, pods: &[Arc<Pod>]) -> usize {
    let Some(workload) = workload else {
        return 0;
    };
    pods.iter()
        .filter(|pod| pod.labels().get(OWNERSHIP_LABEL).is_some_and(|owner| owner == gateway_name))
        .filter(|pod| on_current_revision(pod, workload))
        .filter(|pod| pod_containers_ready(pod))
        .count()
}

pub fn readiness(gateway: &Gateway, workload: Option<&StatefulSet>, pods: &[Arc<Pod>]) -> Readiness {
    let desired = usize::try_from(gateway.spec.replicas()).unwrap_or_default();
    let ready = ready_pods(&gateway.name_any(), workload, pods);
    if ready == desired {
        let reason = if gateway.metadata.generation.unwrap_or(1) <= 1 { REASON_CREATED } else { REASON_UPDATED };
        Readiness::Ready { reason }
    } else {
        Readiness::Waiting { ready, desired }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Ready condition for the new status, keeping the transition time when the status does not flip.
pub fn ready_condition(existing: &[GatewayCondition], ready: bool, reason: &str) -> GatewayCondition {
    let status = if ready { "True" } else { "False" };
    let previous = existing.iter().find(|c| c.type_ == READY_CONDITION);
    let last_transition_time = match previous {
        Some(previous) if previous.status == status => previous.last_transition_time.clone(),
        _ => now(),
    };
    GatewayCondition { type_: READY_CONDITION.to_owned(), status: status.to_owned(), last_transition_time, reason: reason.to_owned() }
}

/// Status patch replacing the Ready condition, `None` when nothing would change.
pub fn status_patch(gateway: &Gateway, condition: GatewayCondition) -> Option<ObjectPatch> {
    let existing = gateway.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default();
    if existing.iter().any(|c| *c == condition) {
        return None;
    }
    let conditions: Vec<GatewayCondition> = existing.into_iter().filter(|c| c.type_ != READY_CONDITION).chain(std::iter::once(condition)).collect();
    Some(ObjectPatch::Merge(json!({ "status": { "conditions": conditions } })))
}
