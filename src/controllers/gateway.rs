use std::sync::Arc;

use futures::{FutureExt, StreamExt, future::BoxFuture};
use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{Pod, Secret, Service, ServiceAccount},
    rbac::v1::{Role, RoleBinding},
};
use kube::{
    Api, Client, ResourceExt,
    runtime::{
        Controller,
        controller::{self, Action},
        reflector::ObjectRef,
        watcher::Config,
    },
};
use tracing::{debug, info, instrument, warn};
use typed_builder::TypedBuilder;

use super::{
    ControllerError, RECONCILE_LONG_WAIT,
    status::{self, REASON_WAITING_PODS, Readiness},
};
use crate::{
    common::{EventKind, EventPublisher, Lister, OWNERSHIP_LABEL, ObjectApi, ResourceKey, gateway_of_pod, gateway_reference},
    configuration::RequeueConfiguration,
    crds::{Gateway, ServiceMonitor},
    services::{
        Composer,
        diff::{self, Convergence},
        image_pull_secret, monitoring, network,
        rbac::{self, RbacApis},
    },
};

type Result<T, E = ControllerError> = std::result::Result<T, E>;

#[derive(Clone, TypedBuilder)]
pub struct GatewayApis {
    gateways: Arc<dyn ObjectApi<Gateway>>,
    secrets: Arc<dyn ObjectApi<Secret>>,
    services: Arc<dyn ObjectApi<Service>>,
    stateful_sets: Arc<dyn ObjectApi<StatefulSet>>,
    service_accounts: Arc<dyn ObjectApi<ServiceAccount>>,
    roles: Arc<dyn ObjectApi<Role>>,
    role_bindings: Arc<dyn ObjectApi<RoleBinding>>,
    service_monitors: Arc<dyn ObjectApi<ServiceMonitor>>,
}

#[derive(Clone, TypedBuilder)]
pub struct GatewayListers {
    gateways: Arc<dyn Lister<Gateway>>,
    secrets: Arc<dyn Lister<Secret>>,
    services: Arc<dyn Lister<Service>>,
    stateful_sets: Arc<dyn Lister<StatefulSet>>,
    pods: Arc<dyn Lister<Pod>>,
}

#[derive(Clone, TypedBuilder)]
pub struct GatewayControllerContext {
    controller_name: String,
    install_namespace: String,
    #[builder(default)]
    image_pull_secret: Option<String>,
    composer: Composer,
    listers: GatewayListers,
    apis: GatewayApis,
    events: Arc<dyn EventPublisher>,
    requeue: RequeueConfiguration,
}

impl GatewayControllerContext {
    /// Converges everything a Gateway owns and writes its Ready condition.
    #[instrument(skip(self), fields(controller = %self.controller_name))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        let controller_name = &self.controller_name;
        let Some(gateway) = self.listers.gateways.get(namespace, name) else {
            debug!("reconcile_gateway: {controller_name} {namespace}.{name} not found, assuming deleted");
            return Ok(Action::await_change());
        };
        let key = ResourceKey::from_resource(&*gateway);
        info!("reconcile_gateway: {controller_name} {key} generation {:?}", gateway.metadata.generation);

        let result = match self.converge(&gateway).await {
            Ok(readiness) => self.report(&gateway, readiness).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!("reconcile_gateway: {controller_name} {key} failed {e}");
            self.report_failure(&gateway, e).await;
        }
        result
    }

    async fn converge(&self, gateway: &Gateway) -> Result<Readiness> {
        let namespace = gateway.namespace().unwrap_or_default();
        let name = gateway.name_any();

        if let Some(secret_name) = &self.image_pull_secret {
            image_pull_secret::ensure(&*self.listers.secrets, &*self.apis.secrets, &self.install_namespace, secret_name, &namespace)
                .await
                .map_err(|e| ControllerError::ImagePullSecretFailed(e.to_string()))?;
        }

        for desired in [network::primary_service(gateway), network::headless_service(gateway)] {
            let observed = self.listers.services.get(&namespace, &desired.name_any());
            let convergence = diff::apply_service(&*self.apis.services, &namespace, &desired, observed.as_deref())
                .await
                .map_err(|e| ControllerError::ServiceReconcileFailed(e.to_string()))?;
            debug!("reconcile_gateway: {} {namespace}.{} service {convergence:?}", self.controller_name, desired.name_any());
        }

        monitoring::reconcile(&*self.apis.service_monitors, gateway).await.map_err(|e| ControllerError::MonitoringReconcileFailed(e.to_string()))?;

        let composed = self.composer.compose(gateway);
        let reference = gateway_reference(gateway);
        for warning in composed.warnings {
            self.events.publish(&reference, EventKind::Warning, &warning.reason, warning.message).await;
        }
        let observed = self.listers.stateful_sets.get(&namespace, &name);
        let convergence = self.reconcile_workload(gateway, &composed.stateful_set, observed.as_deref()).await?;
        debug!("reconcile_gateway: {} {namespace}.{name} workload {convergence:?}", self.controller_name);

        let pods = self.listers.pods.list(&namespace);
        Ok(status::readiness(gateway, observed.as_deref(), &pods))
    }

    async fn reconcile_workload(&self, gateway: &Gateway, desired: &StatefulSet, observed: Option<&StatefulSet>) -> Result<Convergence> {
        let namespace = gateway.namespace().unwrap_or_default();
        let rbac_apis =
            RbacApis { service_accounts: &*self.apis.service_accounts, roles: &*self.apis.roles, role_bindings: &*self.apis.role_bindings };

        let patch = match observed {
            Some(observed) => match diff::workload_patch(desired, observed).map_err(|e| ControllerError::WorkloadReconcileFailed(e.to_string()))? {
                Some(patch) => Some(patch),
                None => return Ok(Convergence::Unchanged),
            },
            None => None,
        };

        rbac::provision(&rbac_apis, gateway).await.map_err(|e| ControllerError::RbacFailed(e.to_string()))?;
        let result = match patch {
            Some(patch) => {
                info!("reconcile_gateway: {} {namespace}.{} patching workload", self.controller_name, gateway.name_any());
                diff::apply_workload_patch(&*self.apis.stateful_sets, &namespace, desired, &patch).await
            },
            None => diff::create_object(&*self.apis.stateful_sets, &namespace, desired).await,
        };
        result.map_err(|e| ControllerError::WorkloadReconcileFailed(e.to_string()))
    }

    async fn write_status(&self, gateway: &Gateway, ready: bool, reason: &str) -> Result<bool> {
        let existing = gateway.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default();
        let Some(patch) = status::status_patch(gateway, status::ready_condition(&existing, ready, reason)) else {
            return Ok(false);
        };
        self.apis
            .gateways
            .patch_status(&gateway.namespace().unwrap_or_default(), &gateway.name_any(), &patch)
            .await
            .map_err(|e| ControllerError::StatusPatchFailed(e.to_string()))?;
        Ok(true)
    }

    async fn report(&self, gateway: &Gateway, readiness: Readiness) -> Result<Action> {
        match readiness {
            Readiness::Ready { reason } => {
                if self.write_status(gateway, true, reason).await? {
                    let note = format!("{} replicas ready", gateway.spec.replicas());
                    self.events.publish(&gateway_reference(gateway), EventKind::Normal, reason, note).await;
                }
                Ok(Action::requeue(RECONCILE_LONG_WAIT))
            },
            Readiness::Waiting { ready, desired } => {
                debug!("reconcile_gateway: {} {}.{} {ready}/{desired} pods ready", self.controller_name, gateway.namespace().unwrap_or_default(), gateway.name_any());
                self.write_status(gateway, false, REASON_WAITING_PODS).await?;
                Ok(Action::requeue(self.requeue.waiting_pods()))
            },
        }
    }

    async fn report_failure(&self, gateway: &Gateway, error: &ControllerError) {
        if let Err(e) = self.write_status(gateway, false, error.code()).await {
            warn!("reconcile_gateway: {} {}.{} unable to write failure status {e}", self.controller_name, gateway.namespace().unwrap_or_default(), gateway.name_any());
        }
        self.events.publish(&gateway_reference(gateway), EventKind::Warning, error.code(), error.to_string()).await;
    }
}

#[derive(TypedBuilder)]
pub struct GatewayController {
    client: Client,
    workers: u16,
}

impl GatewayController {
    /// Controller over Gateways, re-triggered by the objects they own and by their pods.
    pub fn controller(&self) -> Controller<Gateway> {
        let owned = || Config::default().labels(OWNERSHIP_LABEL);
        Controller::new(Api::<Gateway>::all(self.client.clone()), Config::default())
            .with_config(controller::Config::default().concurrency(self.workers))
            .owns(Api::<StatefulSet>::all(self.client.clone()), owned())
            .owns(Api::<Service>::all(self.client.clone()), owned())
            .watches(Api::<Pod>::all(self.client.clone()), owned(), |pod: Pod| -> Option<ObjectRef<Gateway>> {
                let namespace = pod.namespace()?;
                gateway_of_pod(&pod).map(|name| ObjectRef::new(name).within(&namespace))
            })
    }

    pub fn get_controller(controller: Controller<Gateway>, ctx: GatewayControllerContext) -> BoxFuture<'static, ()> {
        controller.run(Self::reconcile_gateway, Self::error_policy, Arc::new(ctx)).for_each(|_| futures::future::ready(())).boxed()
    }

    #[allow(clippy::needless_pass_by_value)]
    fn error_policy(_object: Arc<Gateway>, _err: &ControllerError, ctx: Arc<GatewayControllerContext>) -> Action {
        Action::requeue(ctx.requeue.error_wait())
    }

    async fn reconcile_gateway(resource: Arc<Gateway>, ctx: Arc<GatewayControllerContext>) -> Result<Action> {
        let Some(namespace) = resource.namespace() else {
            return Err(ControllerError::InvalidPayload("Gateway must be namespaced".to_owned()));
        };
        ctx.reconcile(&namespace, &resource.name_any()).await
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::apps::v1::StatefulSetStatus,
        apimachinery::pkg::apis::meta::v1::Time,
        chrono::Utc,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        common::{
            ApiErrorKind, RESTART_ANNOTATION,
            test::{FakeApi, InMemoryLister, RecordingEvents, Verb, gateway_from_yaml, secret},
        },
        controllers::status::{REASON_CREATED, test::pods},
        services::composer::test::{composer, context_with_secrets},
    };

    struct Harness {
        gateways: Arc<InMemoryLister<Gateway>>,
        stateful_sets: Arc<InMemoryLister<StatefulSet>>,
        pods: Arc<InMemoryLister<Pod>>,
        gateway_api: Arc<FakeApi<Gateway>>,
        secret_api: Arc<FakeApi<Secret>>,
        service_api: Arc<FakeApi<Service>>,
        stateful_set_api: Arc<FakeApi<StatefulSet>>,
        service_account_api: Arc<FakeApi<ServiceAccount>>,
        role_api: Arc<FakeApi<Role>>,
        service_monitor_api: Arc<FakeApi<ServiceMonitor>>,
        events: Arc<RecordingEvents>,
        context: GatewayControllerContext,
    }

    impl Harness {
        fn new(gateway: Gateway) -> Self {
            let gateways = Arc::new(InMemoryLister::with(vec![gateway.clone()]));
            let stateful_sets = Arc::new(InMemoryLister::<StatefulSet>::default());
            let pods = Arc::new(InMemoryLister::<Pod>::default());
            let gateway_api = Arc::new(FakeApi::with(vec![gateway]));
            let secret_api = Arc::new(FakeApi::<Secret>::default());
            let service_api = Arc::new(FakeApi::<Service>::default());
            let stateful_set_api = Arc::new(FakeApi::<StatefulSet>::default());
            let service_account_api = Arc::new(FakeApi::<ServiceAccount>::default());
            let role_api = Arc::new(FakeApi::<Role>::default());
            let service_monitor_api = Arc::new(FakeApi::<ServiceMonitor>::default());
            let events = Arc::new(RecordingEvents::default());

            let listers = GatewayListers::builder()
                .gateways(gateways.clone())
                .secrets(Arc::new(InMemoryLister::with(vec![secret("gateway-system", "registry", &[(".dockerconfigjson", "{}")])])))
                .services(Arc::new(InMemoryLister::<Service>::default()))
                .stateful_sets(stateful_sets.clone())
                .pods(pods.clone())
                .build();
            let apis = GatewayApis::builder()
                .gateways(gateway_api.clone())
                .secrets(secret_api.clone())
                .services(service_api.clone())
                .stateful_sets(stateful_set_api.clone())
                .service_accounts(service_account_api.clone())
                .roles(role_api.clone())
                .role_bindings(Arc::new(FakeApi::<RoleBinding>::default()))
                .service_monitors(service_monitor_api.clone())
                .build();
            let context = GatewayControllerContext::builder()
                .controller_name("gateway.operator.io/controller".to_owned())
                .install_namespace("gateway-system".to_owned())
                .image_pull_secret(Some("registry".to_owned()))
                .composer(composer(context_with_secrets(vec![])))
                .listers(listers)
                .apis(apis)
                .events(events.clone())
                .requeue(RequeueConfiguration::default())
                .build();
            Self {
                gateways,
                stateful_sets,
                pods,
                gateway_api,
                secret_api,
                service_api,
                stateful_set_api,
                service_account_api,
                role_api,
                service_monitor_api,
                events,
                context,
            }
        }

        fn ready_condition(&self) -> Option<(String, String)> {
            self.gateway_api
                .stored("apps", "edge")
                .and_then(|g| g.status)
                .and_then(|s| s.conditions.into_iter().find(|c| c.type_ == "Ready"))
                .map(|c| (c.status, c.reason))
        }

        /// Mirrors what the cluster would report back into the caches.
        fn sync_caches(&self, stateful_set_status: Option<StatefulSetStatus>) {
            if let Some(gateway) = self.gateway_api.stored("apps", "edge") {
                self.gateways.upsert(gateway);
            }
            if let Some(mut stateful_set) = self.stateful_set_api.stored("apps", "edge") {
                stateful_set.metadata.generation = Some(1);
                stateful_set.status = stateful_set_status;
                self.stateful_sets.upsert(stateful_set);
            }
        }
    }

    fn gateway(generation: i64) -> Gateway {
        gateway_from_yaml(&format!(
            r#"
apiVersion: gateway.operator.io/v1
kind: Gateway
metadata:
  name: edge
  namespace: apps
  generation: {generation}
spec:
  count: 3
"#
        ))
    }

    #[tokio::test]
    async fn test_create_then_ready() {
        let harness = Harness::new(gateway(1));

        let action = harness.context.reconcile("apps", "edge").await.unwrap();
        assert_eq!(action, Action::requeue(RequeueConfiguration::default().waiting_pods()));
        assert_eq!(harness.ready_condition(), Some(("False".to_owned(), REASON_WAITING_PODS.to_owned())));

        assert_eq!(harness.service_account_api.calls_of(Verb::Create).len(), 1);
        assert_eq!(harness.role_api.calls_of(Verb::Create).len(), 1);
        let created = harness.stateful_set_api.stored("apps", "edge").unwrap();
        assert_eq!(created.spec.as_ref().and_then(|s| s.replicas), Some(3));
        assert!(harness.service_api.stored("apps", "edge").is_some());
        assert!(harness.service_api.stored("apps", "edge-headless").is_some());
        assert!(harness.secret_api.stored("apps", "registry").is_some());
        assert!(harness.service_monitor_api.calls().is_empty());

        let rolled_out = StatefulSetStatus { observed_generation: Some(1), update_revision: Some("edge-7f8b".to_owned()), ..Default::default() };
        harness.sync_caches(Some(rolled_out));
        for pod in pods("edge", 2, "edge-7f8b") {
            harness.pods.upsert((*pod).clone());
        }
        harness.context.reconcile("apps", "edge").await.unwrap();
        assert_eq!(harness.ready_condition(), Some(("False".to_owned(), REASON_WAITING_PODS.to_owned())));

        for pod in pods("edge", 3, "edge-7f8b") {
            harness.pods.upsert((*pod).clone());
        }
        let rolled_out = StatefulSetStatus { observed_generation: Some(1), update_revision: Some("edge-7f8b".to_owned()), ..Default::default() };
        harness.sync_caches(Some(rolled_out));
        let action = harness.context.reconcile("apps", "edge").await.unwrap();
        assert_eq!(action, Action::requeue(RECONCILE_LONG_WAIT));
        assert_eq!(harness.ready_condition(), Some(("True".to_owned(), REASON_CREATED.to_owned())));
        assert_eq!(harness.stateful_set_api.calls_of(Verb::Create).len(), 1);
        assert!(harness.stateful_set_api.calls_of(Verb::Patch).is_empty());
        assert_eq!(harness.events.events().iter().filter(|e| e.reason == REASON_CREATED).count(), 1);
    }

    #[tokio::test]
    async fn test_generation_bump_without_diff() {
        let harness = Harness::new(gateway(1));
        harness.context.reconcile("apps", "edge").await.unwrap();

        let mut observed = harness.stateful_set_api.stored("apps", "edge").unwrap();
        observed.metadata.uid = Some("0c5b7a52-0c4e-4b8e-a0a3-1d0e5b3b8e11".to_owned());
        observed.metadata.resource_version = Some("4711".to_owned());
        observed.metadata.creation_timestamp = Some(Time(Utc::now()));
        let mut value = serde_json::to_value(&observed).unwrap();
        value["spec"]["template"]["metadata"]["annotations"] = json!({ RESTART_ANNOTATION: "2024-05-01T10:00:00Z" });
        value["spec"]["template"]["spec"]["containers"][0]["terminationMessagePolicy"] = json!("File");
        let observed: StatefulSet = serde_json::from_value(value).unwrap();
        harness.stateful_sets.upsert(observed);
        harness.gateways.upsert(gateway(2));

        harness.context.reconcile("apps", "edge").await.unwrap();
        assert_eq!(harness.stateful_set_api.calls_of(Verb::Create).len(), 1);
        assert!(harness.stateful_set_api.calls_of(Verb::Patch).is_empty());
        assert!(harness.stateful_set_api.calls_of(Verb::Delete).is_empty());
        assert_eq!(harness.role_api.calls_of(Verb::Create).len(), 1);
    }

    #[tokio::test]
    async fn test_spec_change_patches_workload() {
        let harness = Harness::new(gateway(1));
        harness.context.reconcile("apps", "edge").await.unwrap();
        harness.sync_caches(None);
        harness.gateways.upsert(gateway_from_yaml(
            "apiVersion: gateway.operator.io/v1\nkind: Gateway\nmetadata:\n  name: edge\n  namespace: apps\n  generation: 2\nspec:\n  count: 5\n",
        ));

        harness.context.reconcile("apps", "edge").await.unwrap();
        let patches = harness.stateful_set_api.calls_of(Verb::Patch);
        assert_eq!(patches.len(), 1);
        assert_eq!(harness.stateful_set_api.stored("apps", "edge").and_then(|s| s.spec).and_then(|s| s.replicas), Some(5));
        assert_eq!(harness.role_api.calls_of(Verb::Patch).len(), 1);
    }

    #[tokio::test]
    async fn test_failure_marks_status() {
        let harness = Harness::new(gateway(1));
        harness.service_api.fail_next(Verb::Create, ApiErrorKind::Transient);

        let result = harness.context.reconcile("apps", "edge").await;
        assert!(matches!(result, Err(ControllerError::ServiceReconcileFailed(_))));
        assert_eq!(harness.ready_condition(), Some(("False".to_owned(), "ServiceReconcileFailed".to_owned())));
        assert_eq!(harness.events.warnings().iter().map(|e| e.reason.clone()).collect::<Vec<_>>(), vec!["ServiceReconcileFailed".to_owned()]);
        assert!(harness.stateful_set_api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_feature_warnings_become_events() {
        let harness = Harness::new(gateway_from_yaml(
            "apiVersion: gateway.operator.io/v1\nkind: Gateway\nmetadata:\n  name: edge\n  namespace: apps\nspec:\n  sso:\n    secret: missing\n",
        ));
        harness.context.reconcile("apps", "edge").await.unwrap();
        let warnings = harness.events.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].reason, "SsoDisabled");
        assert!(harness.stateful_set_api.stored("apps", "edge").is_some());
    }

    #[tokio::test]
    async fn test_deleted_gateway_is_noop() {
        let harness = Harness::new(gateway(1));
        let action = harness.context.reconcile("apps", "gone").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(harness.service_api.calls().is_empty());
        assert!(harness.gateway_api.calls().is_empty());
    }
}
