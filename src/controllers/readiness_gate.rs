use std::sync::Arc;

use futures::{FutureExt, StreamExt, future::BoxFuture};
use k8s_openapi::{
    api::core::v1::Pod,
    chrono::{SecondsFormat, Utc},
};
use kube::{
    Api, Client, Resource, ResourceExt,
    runtime::{
        Controller,
        controller::{self, Action},
        watcher::Config,
    },
};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use typed_builder::TypedBuilder;

use super::ControllerError;
use crate::{
    common::{
        EventKind, EventPublisher, Lister, OWNERSHIP_LABEL, ObjectApi, ObjectPatch, READINESS_GATE_CONDITION, ResourceKey, State, gateway_of_pod,
        headless_service_name, pod_condition_status, pod_containers_ready,
    },
    configuration::RequeueConfiguration,
    services::{AdminClient, AdminTarget, RouteResolver},
};

type Result<T, E = ControllerError> = std::result::Result<T, E>;

const REASON_ROUTES_PUSHED: &str = "RoutesPushed";
const REASON_ROUTES_NOT_PUSHED: &str = "RoutesNotPushed";
const REASON_CONTAINERS_NOT_READY: &str = "ContainersNotReady";

#[derive(Clone, TypedBuilder)]
pub struct ReadinessGateControllerContext {
    controller_name: String,
    state: State,
    pods: Arc<dyn Lister<Pod>>,
    pod_api: Arc<dyn ObjectApi<Pod>>,
    resolver: Arc<dyn RouteResolver>,
    admin: Arc<dyn AdminClient>,
    events: Arc<dyn EventPublisher>,
    requeue: RequeueConfiguration,
}

impl ReadinessGateControllerContext {
    /// Pushes the routes of a pod's Gateway once its containers become ready and reflects the outcome in the readiness gate.
    #[instrument(skip(self), fields(controller = %self.controller_name))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        let controller_name = &self.controller_name;
        let key = ResourceKey::namespaced(name, namespace);
        let Some(pod) = self.pods.get(namespace, name) else {
            debug!("reconcile_pod: {controller_name} {key} not found, forgetting");
            self.state.forget_pod(&key)?;
            return Ok(Action::await_change());
        };
        let Some(gateway_name) = gateway_of_pod(&pod) else {
            return Ok(Action::await_change());
        };
        if pod.metadata.deletion_timestamp.is_some() {
            self.state.forget_pod(&key)?;
            return Ok(Action::await_change());
        }

        let ready = pod_containers_ready(&pod);
        let previous = self.state.swap_pod_ready(&key, ready)?;
        let gate = pod_condition_status(&pod, READINESS_GATE_CONDITION);

        if !ready {
            if gate.is_none() {
                self.set_gate(&pod, false, REASON_CONTAINERS_NOT_READY, "Waiting for containers").await?;
            }
            return Ok(Action::await_change());
        }
        if previous != Some(false) && gate == Some("True") {
            return Ok(Action::await_change());
        }

        info!("reconcile_pod: {controller_name} {key} containers ready, pushing routes of {gateway_name}");
        match self.push_routes(&pod, gateway_name).await {
            Ok(pushed) => {
                let message = format!("{pushed} route mappings pushed");
                self.set_gate(&pod, true, REASON_ROUTES_PUSHED, &message).await?;
                self.events.publish(&pod.object_ref(&()), EventKind::Normal, REASON_ROUTES_PUSHED, message).await;
                Ok(Action::await_change())
            },
            Err(failures) => {
                let message = failures.join("; ");
                warn!("reconcile_pod: {controller_name} {key} routes not pushed {message}");
                self.set_gate(&pod, false, REASON_ROUTES_NOT_PUSHED, &message).await?;
                self.events.publish(&pod.object_ref(&()), EventKind::Warning, REASON_ROUTES_NOT_PUSHED, message.clone()).await;
                Err(ControllerError::RoutesNotPushed(message))
            },
        }
    }

    /// Every mapping is attempted, failures are collected per mapping.
    async fn push_routes(&self, pod: &Pod, gateway_name: &str) -> std::result::Result<usize, Vec<String>> {
        let namespace = pod.namespace().unwrap_or_default();
        let Some(pod_ip) = pod.status.as_ref().and_then(|s| s.pod_ip.as_deref()) else {
            return Err(vec!["pod has no address".to_owned()]);
        };
        let target = AdminTarget::new(pod_ip, &pod.name_any(), &headless_service_name(gateway_name), &namespace);

        let mappings = self.resolver.mappings(&namespace, gateway_name);
        let mut failures = vec![];
        for mapping in &mappings {
            let pushed = match self.resolver.resolve(mapping) {
                Ok(routes) => self.admin.push_routes(&target, &routes).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(e) = pushed {
                failures.push(format!("{}: {e}", mapping.name_any()));
            }
        }
        if failures.is_empty() { Ok(mappings.len()) } else { Err(failures) }
    }

    async fn set_gate(&self, pod: &Pod, ready: bool, reason: &str, message: &str) -> Result<()> {
        let status = if ready { "True" } else { "False" };
        let current = pod
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conditions| conditions.iter().find(|c| c.type_ == READINESS_GATE_CONDITION));
        if current.is_some_and(|c| c.status == status && c.reason.as_deref() == Some(reason)) {
            return Ok(());
        }
        let patch = ObjectPatch::Strategic(json!({
            "status": {
                "conditions": [{
                    "type": READINESS_GATE_CONDITION,
                    "status": status,
                    "reason": reason,
                    "message": message,
                    "lastTransitionTime": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                }]
            }
        }));
        self.pod_api
            .patch_status(&pod.namespace().unwrap_or_default(), &pod.name_any(), &patch)
            .await
            .map_err(|e| ControllerError::StatusPatchFailed(e.to_string()))?;
        Ok(())
    }
}

#[derive(TypedBuilder)]
pub struct ReadinessGateController {
    client: Client,
    workers: u16,
}

impl ReadinessGateController {
    pub fn controller(&self) -> Controller<Pod> {
        Controller::new(Api::<Pod>::all(self.client.clone()), Config::default().labels(OWNERSHIP_LABEL))
            .with_config(controller::Config::default().concurrency(self.workers))
    }

    pub fn get_controller(controller: Controller<Pod>, ctx: ReadinessGateControllerContext) -> BoxFuture<'static, ()> {
        controller.run(Self::reconcile_pod, Self::error_policy, Arc::new(ctx)).for_each(|_| futures::future::ready(())).boxed()
    }

    #[allow(clippy::needless_pass_by_value)]
    fn error_policy(_object: Arc<Pod>, _err: &ControllerError, ctx: Arc<ReadinessGateControllerContext>) -> Action {
        Action::requeue(ctx.requeue.error_wait())
    }

    async fn reconcile_pod(resource: Arc<Pod>, ctx: Arc<ReadinessGateControllerContext>) -> Result<Action> {
        let Some(namespace) = resource.namespace() else {
            return Err(ControllerError::InvalidPayload("Pod must be namespaced".to_owned()));
        };
        ctx.reconcile(&namespace, &resource.name_any()).await
    }
}
