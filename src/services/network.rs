use k8s_openapi::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::ResourceExt;

use crate::{
    common::{CLUSTER_PORT, HTTP_PORT, MANAGEMENT_PORT, headless_service_name, owned_object_meta, ownership_labels},
    crds::Gateway,
};

pub const SERVICE_HTTP_PORT: i32 = 80;

fn service_port(name: &str, port: i32, target_port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_owned()),
        port,
        target_port: Some(IntOrString::Int(target_port)),
        protocol: Some("TCP".to_owned()),
        ..Default::default()
    }
}

/// Service fronting the gateway pods for traffic and scraping.
pub fn primary_service(gateway: &Gateway) -> Service {
    let name = gateway.name_any();
    Service {
        metadata: owned_object_meta(gateway, &name),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_owned()),
            selector: Some(ownership_labels(&name)),
            ports: Some(vec![service_port("http", SERVICE_HTTP_PORT, HTTP_PORT), service_port("management", MANAGEMENT_PORT, MANAGEMENT_PORT)]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Peer discovery service, publishes pods before they are ready so members can find each other.
pub fn headless_service(gateway: &Gateway) -> Service {
    let name = gateway.name_any();
    Service {
        metadata: owned_object_meta(gateway, &headless_service_name(&name)),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_owned()),
            publish_not_ready_addresses: Some(true),
            selector: Some(ownership_labels(&name)),
            ports: Some(vec![
                service_port("cluster", CLUSTER_PORT, CLUSTER_PORT),
                service_port("http", HTTP_PORT, HTTP_PORT),
                service_port("management", MANAGEMENT_PORT, MANAGEMENT_PORT),
            ]),
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::test::gateway_from_yaml;

    #[test]
    fn test_services() {
        let gateway = gateway_from_yaml("apiVersion: gateway.operator.io/v1\nkind: Gateway\nmetadata:\n  name: edge\n  namespace: apps\nspec: {}\n");
        let primary = primary_service(&gateway);
        let headless = headless_service(&gateway);
        assert_eq!(primary.metadata.name.as_deref(), Some("edge"));
        assert_eq!(headless.metadata.name.as_deref(), Some("edge-headless"));
        assert_eq!(headless.spec.as_ref().and_then(|s| s.cluster_ip.as_deref()), Some("None"));
        assert_eq!(primary.spec.as_ref().and_then(|s| s.ports.as_ref()).map(|p| p[0].port), Some(80));
        assert_eq!(primary.spec.and_then(|s| s.selector), headless.spec.and_then(|s| s.selector));
    }
}
