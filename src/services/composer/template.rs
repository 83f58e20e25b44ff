use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy},
        core::v1::{
            Container, ContainerPort, HTTPGetAction, LocalObjectReference, PodReadinessGate, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
            ResourceRequirements,
        },
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::ResourceExt;
use kube_core::ObjectMeta;

use super::Contribution;
use crate::{
    common::{CLUSTER_PORT, EnvBucket, HTTP_PORT, MANAGEMENT_PORT, READINESS_GATE_CONDITION, headless_service_name, owned_object_meta, ownership_labels},
    crds::Gateway,
};

pub const CONTAINER_NAME: &str = "gateway";
const TERMINATION_GRACE_PERIOD_SECONDS: i64 = 60;
const DEFAULT_USER_ID: i64 = 1000;

pub struct TemplateSettings<'a> {
    pub image: &'a str,
    pub image_pull_secret: Option<&'a str>,
    pub default_resources: &'a ResourceRequirements,
}

pub fn fallback_resources() -> ResourceRequirements {
    let quantities = |cpu: &str, memory: &str| BTreeMap::from([("cpu".to_owned(), Quantity(cpu.to_owned())), ("memory".to_owned(), Quantity(memory.to_owned()))]);
    ResourceRequirements { requests: Some(quantities("500m", "1Gi")), limits: Some(quantities("2", "1Gi")), ..Default::default() }
}

pub fn base_env() -> EnvBucket {
    let mut env = EnvBucket::new();
    env.insert_field_ref("GATEWAY_NAME", "metadata.labels['gateway.operator.io/gateway-name']");
    env.insert_field_ref("GATEWAY_NAMESPACE", "metadata.namespace");
    env.insert_field_ref("POD_NAME", "metadata.name");
    env.insert_value("SERVER_PORT", HTTP_PORT.to_string());
    env.insert_value("MANAGEMENT_SERVER_PORT", MANAGEMENT_PORT.to_string());
    env
}

fn health_probe(group: &str, initial_delay: i32, failure_threshold: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(format!("/actuator/health/{group}")),
            port: IntOrString::Int(MANAGEMENT_PORT),
            scheme: Some("HTTP".to_owned()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        timeout_seconds: Some(1),
        success_threshold: Some(1),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    }
}

fn port(name: &str, container_port: i32) -> ContainerPort {
    ContainerPort { name: Some(name.to_owned()), container_port, protocol: Some("TCP".to_owned()), ..Default::default() }
}

fn security_context(gateway: &Gateway) -> PodSecurityContext {
    let overrides = gateway.spec.security_context.clone().unwrap_or_default();
    PodSecurityContext {
        run_as_non_root: Some(true),
        run_as_user: Some(overrides.run_as_user.unwrap_or(DEFAULT_USER_ID)),
        run_as_group: Some(overrides.run_as_group.unwrap_or(DEFAULT_USER_ID)),
        fs_group: Some(overrides.fs_group.unwrap_or(DEFAULT_USER_ID)),
        ..Default::default()
    }
}

pub fn stateful_set(gateway: &Gateway, settings: &TemplateSettings, composed: Contribution) -> StatefulSet {
    let name = gateway.name_any();
    let labels = ownership_labels(&name);
    let annotations = composed.annotations.into_map();

    let container = Container {
        name: CONTAINER_NAME.to_owned(),
        image: Some(settings.image.to_owned()),
        image_pull_policy: Some("IfNotPresent".to_owned()),
        ports: Some(vec![port("http", HTTP_PORT), port("management", MANAGEMENT_PORT), port("cluster", CLUSTER_PORT)]),
        env: Some(composed.env.into_env()),
        resources: Some(gateway.spec.resources.clone().unwrap_or_else(|| settings.default_resources.clone())),
        volume_mounts: (!composed.mounts.is_empty()).then_some(composed.mounts),
        liveness_probe: Some(health_probe("liveness", 0, 3)),
        readiness_probe: Some(health_probe("readiness", 0, 3)),
        startup_probe: Some(health_probe("liveness", 10, 30)),
        ..Default::default()
    };

    StatefulSet {
        metadata: owned_object_meta(gateway, &name),
        spec: Some(StatefulSetSpec {
            replicas: Some(gateway.spec.replicas()),
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            service_name: headless_service_name(&name),
            pod_management_policy: Some("Parallel".to_owned()),
            update_strategy: Some(StatefulSetUpdateStrategy { type_: Some("RollingUpdate".to_owned()), ..Default::default() }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: (!annotations.is_empty()).then_some(annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(name.clone()),
                    termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD_SECONDS),
                    readiness_gates: Some(vec![PodReadinessGate { condition_type: READINESS_GATE_CONDITION.to_owned() }]),
                    image_pull_secrets: settings.image_pull_secret.map(|secret| vec![LocalObjectReference { name: secret.to_owned() }]),
                    security_context: Some(security_context(gateway)),
                    volumes: (!composed.volumes.is_empty()).then_some(composed.volumes),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::common::{OWNERSHIP_LABEL, test::gateway_from_yaml};

    #[test]
    fn test_base_template() {
        let gateway = gateway_from_yaml(
            r#"
apiVersion: gateway.operator.io/v1
kind: Gateway
metadata:
  name: edge
  namespace: apps
spec:
  count: 3
  securityContext:
    runAsUser: 2000
"#,
        );
        let resources = fallback_resources();
        let settings = TemplateSettings { image: "registry.local/gateway:1.4.0", image_pull_secret: None, default_resources: &resources };
        let stateful_set = stateful_set(&gateway, &settings, Contribution { env: base_env(), ..Default::default() });

        assert_eq!(stateful_set.metadata.labels.as_ref().and_then(|l| l.get(OWNERSHIP_LABEL)), Some(&"edge".to_owned()));
        assert_eq!(stateful_set.metadata.owner_references.as_ref().map(Vec::len), Some(1));
        let spec = stateful_set.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name, "edge-headless");
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.readiness_gates.unwrap()[0].condition_type, READINESS_GATE_CONDITION);
        assert_eq!(pod.image_pull_secrets, None);
        let security = pod.security_context.unwrap();
        assert_eq!((security.run_as_user, security.run_as_group), (Some(2000), Some(1000)));
        assert_eq!(pod.containers[0].resources, Some(fallback_resources()));
        assert_eq!(pod.volumes, None);
    }
}
