use std::sync::Arc;

use futures::{FutureExt, StreamExt, future::BoxFuture};
use k8s_openapi::{
    ByteString,
    api::{apps::v1::StatefulSet, core::v1::ConfigMap},
    chrono::{SecondsFormat, Utc},
};
use kube::{
    Api, Client, ResourceExt,
    runtime::{
        Controller,
        controller::{self, Action},
        watcher::Config,
    },
};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use typed_builder::TypedBuilder;

use super::ControllerError;
use crate::{
    common::{EventKind, EventPublisher, Lister, ObjectApi, ObjectPatch, PayloadDigest, RESTART_ANNOTATION, ResourceKey, State, gateway_reference},
    configuration::RequeueConfiguration,
    crds::Gateway,
};

type Result<T, E = ControllerError> = std::result::Result<T, E>;

const REASON_RESTARTED: &str = "ExtensionChanged";

/// Pod template annotation change rolling every replica of a workload.
pub fn restart_patch(restarted_at: &str) -> ObjectPatch {
    ObjectPatch::Merge(json!({
        "spec": { "template": { "metadata": { "annotations": { RESTART_ANNOTATION: restarted_at } } } }
    }))
}

fn payload_digest(config_map: &ConfigMap) -> PayloadDigest {
    let mut hasher = Sha256::new();
    for (key, ByteString(bytes)) in config_map.binary_data.iter().flatten() {
        hasher.update(key.as_bytes());
        hasher.update([0_u8]);
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    hasher.finalize().to_vec()
}

#[derive(Clone, TypedBuilder)]
pub struct ConfigMapControllerContext {
    controller_name: String,
    state: State,
    config_maps: Arc<dyn Lister<ConfigMap>>,
    gateways: Arc<dyn Lister<Gateway>>,
    stateful_sets: Arc<dyn ObjectApi<StatefulSet>>,
    events: Arc<dyn EventPublisher>,
    requeue: RequeueConfiguration,
}

impl ConfigMapControllerContext {
    /// Restarts the Gateways using a ConfigMap as extension when its binary payload changes.
    ///
    /// Only a digest of ConfigMaps referenced by some Gateway is remembered. It is updated once
    /// every referencing Gateway was restarted, so a failed restart is retried for all of them.
    #[instrument(skip(self), fields(controller = %self.controller_name))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        let controller_name = &self.controller_name;
        let key = ResourceKey::namespaced(name, namespace);
        let config_map = match self.config_maps.get(namespace, name) {
            Some(config_map) if config_map.metadata.deletion_timestamp.is_none() => config_map,
            _ => {
                debug!("reconcile_config_map: {controller_name} {key} gone");
                self.state.forget_config_map(&key)?;
                return Ok(Action::await_change());
            },
        };

        let referencing: Vec<_> = self.gateways.list(namespace).into_iter().filter(|g| g.spec.references_extension(name)).collect();
        if referencing.is_empty() {
            self.state.forget_config_map(&key)?;
            return Ok(Action::await_change());
        }

        let digest = payload_digest(&config_map);
        let Some(previous) = self.state.get_config_map_digest(&key)? else {
            debug!("reconcile_config_map: {controller_name} {key} first seen");
            self.state.save_config_map_digest(key, digest)?;
            return Ok(Action::await_change());
        };
        if previous == digest {
            return Ok(Action::await_change());
        }

        let restarted_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut failed = vec![];
        for gateway in referencing {
            let gateway_name = gateway.name_any();
            match self.stateful_sets.patch(namespace, &gateway_name, &restart_patch(&restarted_at)).await {
                Ok(_) => {
                    info!("reconcile_config_map: {controller_name} {key} restarted gateway {gateway_name}");
                    let note = format!("Extension {name} changed, restarting");
                    self.events.publish(&gateway_reference(&gateway), EventKind::Normal, REASON_RESTARTED, note).await;
                },
                Err(e) if e.is_not_found() => {
                    debug!("reconcile_config_map: {controller_name} {key} gateway {gateway_name} has no workload yet");
                },
                Err(e) => {
                    warn!("reconcile_config_map: {controller_name} {key} unable to restart gateway {gateway_name} {e}");
                    let error = ControllerError::RestartFailed(vec![gateway_name.clone()]);
                    self.events.publish(&gateway_reference(&gateway), EventKind::Warning, error.code(), e.to_string()).await;
                    failed.push(gateway_name);
                },
            }
        }

        if failed.is_empty() {
            self.state.save_config_map_digest(key, digest)?;
            Ok(Action::await_change())
        } else {
            Err(ControllerError::RestartFailed(failed))
        }
    }
}

#[derive(TypedBuilder)]
pub struct ConfigMapController {
    client: Client,
    workers: u16,
}

impl ConfigMapController {
    pub fn controller(&self) -> Controller<ConfigMap> {
        Controller::new(Api::<ConfigMap>::all(self.client.clone()), Config::default())
            .with_config(controller::Config::default().concurrency(self.workers))
    }

    pub fn get_controller(controller: Controller<ConfigMap>, ctx: ConfigMapControllerContext) -> BoxFuture<'static, ()> {
        controller.run(Self::reconcile_config_map, Self::error_policy, Arc::new(ctx)).for_each(|_| futures::future::ready(())).boxed()
    }

    #[allow(clippy::needless_pass_by_value)]
    fn error_policy(_object: Arc<ConfigMap>, _err: &ControllerError, ctx: Arc<ConfigMapControllerContext>) -> Action {
        Action::requeue(ctx.requeue.error_wait())
    }

    async fn reconcile_config_map(resource: Arc<ConfigMap>, ctx: Arc<ConfigMapControllerContext>) -> Result<Action> {
        let Some(namespace) = resource.namespace() else {
            return Err(ControllerError::InvalidPayload("ConfigMap must be namespaced".to_owned()));
        };
        ctx.reconcile(&namespace, &resource.name_any()).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::{api::apps::v1::StatefulSetSpec, apimachinery::pkg::apis::meta::v1::Time};
    use kube_core::ObjectMeta;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::common::{
        ApiErrorKind,
        test::{FakeApi, InMemoryLister, RecordingEvents, Verb, gateway_from_yaml},
    };

    struct Harness {
        state: State,
        config_maps: Arc<InMemoryLister<ConfigMap>>,
        stateful_sets: Arc<FakeApi<StatefulSet>>,
        events: Arc<RecordingEvents>,
        context: ConfigMapControllerContext,
    }

    fn config_map(data: &str, binary: &[u8]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta { name: Some("filters".to_owned()), namespace: Some("apps".to_owned()), ..Default::default() },
            data: Some(BTreeMap::from([("filters.yaml".to_owned(), data.to_owned())])),
            binary_data: Some(BTreeMap::from([("filters.jar".to_owned(), ByteString(binary.to_vec()))])),
            ..Default::default()
        }
    }

    fn gateway(name: &str, extensions: &[&str]) -> Gateway {
        gateway_from_yaml(&format!(
            "apiVersion: gateway.operator.io/v1\nkind: Gateway\nmetadata:\n  name: {name}\n  namespace: apps\nspec:\n  extensions:\n    custom: [{}]\n",
            extensions.join(", ")
        ))
    }

    fn workload(name: &str) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta { name: Some(name.to_owned()), namespace: Some("apps".to_owned()), ..Default::default() },
            spec: Some(StatefulSetSpec::default()),
            status: None,
        }
    }

    impl Harness {
        fn new() -> Self {
            let config_maps = Arc::new(InMemoryLister::with(vec![config_map("a: 1", b"v1")]));
            let gateways = InMemoryLister::with(vec![gateway("edge", &["filters"]), gateway("internal", &["other"]), gateway("public", &["other", "filters"])]);
            let stateful_sets = Arc::new(FakeApi::with(vec![workload("edge"), workload("internal"), workload("public")]));
            let events = Arc::new(RecordingEvents::default());
            let state = State::new();
            let context = ConfigMapControllerContext::builder()
                .controller_name("gateway.operator.io/controller".to_owned())
                .state(state.clone())
                .config_maps(config_maps.clone())
                .gateways(Arc::new(gateways))
                .stateful_sets(stateful_sets.clone())
                .events(events.clone())
                .requeue(RequeueConfiguration::default())
                .build();
            Self { state, config_maps, stateful_sets, events, context }
        }

        fn remembered(&self, name: &str) -> bool {
            self.state.get_config_map_digest(&ResourceKey::namespaced(name, "apps")).unwrap().is_some()
        }

        fn restarted(&self) -> Vec<String> {
            self.stateful_sets.calls_of(Verb::Patch).into_iter().map(|c| c.name).collect()
        }
    }

    #[tokio::test]
    async fn test_first_sighting_only_records() {
        let harness = Harness::new();
        harness.context.reconcile("apps", "filters").await.unwrap();
        assert!(harness.stateful_sets.calls().is_empty());
    }

    #[tokio::test]
    async fn test_binary_change_restarts_referencing_gateways() {
        let harness = Harness::new();
        harness.context.reconcile("apps", "filters").await.unwrap();

        harness.config_maps.upsert(config_map("a: 1", b"v2"));
        harness.context.reconcile("apps", "filters").await.unwrap();
        assert_eq!(harness.restarted(), vec!["edge".to_owned(), "public".to_owned()]);
        let annotations = harness
            .stateful_sets
            .stored("apps", "edge")
            .and_then(|s| s.spec)
            .and_then(|s| s.template.metadata)
            .and_then(|m| m.annotations)
            .unwrap();
        assert!(annotations.contains_key(RESTART_ANNOTATION));
        assert_eq!(harness.events.events().iter().filter(|e| e.reason == REASON_RESTARTED).count(), 2);

        harness.context.reconcile("apps", "filters").await.unwrap();
        assert_eq!(harness.restarted().len(), 2);
    }

    #[tokio::test]
    async fn test_text_only_change_is_ignored() {
        let harness = Harness::new();
        harness.context.reconcile("apps", "filters").await.unwrap();
        harness.config_maps.upsert(config_map("a: 2", b"v1"));
        harness.context.reconcile("apps", "filters").await.unwrap();
        assert!(harness.stateful_sets.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_other_gateways() {
        let harness = Harness::new();
        harness.context.reconcile("apps", "filters").await.unwrap();
        harness.config_maps.upsert(config_map("a: 1", b"v2"));
        harness.stateful_sets.fail_next(Verb::Patch, ApiErrorKind::Transient);

        let result = harness.context.reconcile("apps", "filters").await;
        assert_eq!(result, Err(ControllerError::RestartFailed(vec!["edge".to_owned()])));
        assert_eq!(harness.restarted(), vec!["edge".to_owned(), "public".to_owned()]);
        assert_eq!(harness.events.warnings().iter().map(|e| e.object.clone()).collect::<Vec<_>>(), vec!["edge".to_owned()]);

        harness.context.reconcile("apps", "filters").await.unwrap();
        assert_eq!(harness.restarted(), vec!["edge".to_owned(), "public".to_owned(), "edge".to_owned(), "public".to_owned()]);
    }

    #[tokio::test]
    async fn test_gateway_without_workload_is_skipped() {
        let harness = Harness::new();
        harness.context.reconcile("apps", "filters").await.unwrap();
        harness.config_maps.upsert(config_map("a: 1", b"v2"));
        harness.stateful_sets.fail_next(Verb::Patch, ApiErrorKind::NotFound);
        harness.context.reconcile("apps", "filters").await.unwrap();
        assert_eq!(harness.restarted().len(), 2);
    }

    #[tokio::test]
    async fn test_deleted_config_map_is_forgotten() {
        let harness = Harness::new();
        harness.context.reconcile("apps", "filters").await.unwrap();
        assert!(harness.remembered("filters"));

        harness.config_maps.remove("apps", "filters");
        harness.context.reconcile("apps", "filters").await.unwrap();
        assert!(!harness.remembered("filters"));
        assert!(harness.stateful_sets.calls().is_empty());
    }

    #[tokio::test]
    async fn test_terminating_config_map_is_forgotten() {
        let harness = Harness::new();
        harness.context.reconcile("apps", "filters").await.unwrap();
        let mut terminating = config_map("a: 1", b"v2");
        terminating.metadata.deletion_timestamp = Some(Time(Utc::now()));
        harness.config_maps.upsert(terminating);

        harness.context.reconcile("apps", "filters").await.unwrap();
        assert!(!harness.remembered("filters"));
        assert!(harness.stateful_sets.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unreferenced_config_map_is_not_remembered() {
        let harness = Harness::new();
        let mut unused = config_map("a: 1", b"v1");
        unused.metadata.name = Some("unused".to_owned());
        harness.config_maps.upsert(unused);

        harness.context.reconcile("apps", "unused").await.unwrap();
        assert!(!harness.remembered("unused"));
        assert!(harness.stateful_sets.calls().is_empty());
    }
}
