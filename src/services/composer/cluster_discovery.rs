use kube::ResourceExt;

use super::Contribution;
use crate::{
    common::{CLUSTER_PORT, headless_service_name},
    crds::{Gateway, GatewaySpec},
};

pub fn applies(_spec: &GatewaySpec) -> bool {
    true
}

/// Points peer discovery at the headless service of the gateway.
pub fn apply(gateway: &Gateway) -> Contribution {
    let namespace = gateway.namespace().unwrap_or_default();
    let mut contribution = Contribution::default();
    let env = &mut contribution.env;
    env.insert_value("CLUSTER_DISCOVERY_ENABLED", "true");
    env.insert_value("CLUSTER_DISCOVERY_SERVICE_DNS", format!("{}.{namespace}.svc.cluster.local", headless_service_name(&gateway.name_any())));
    env.insert_value("CLUSTER_DISCOVERY_NAMESPACE", namespace);
    env.insert_value("CLUSTER_DISCOVERY_PORT", CLUSTER_PORT.to_string());
    contribution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::test::gateway_from_yaml;

    #[test]
    fn test_discovery_env() {
        let gateway = gateway_from_yaml("apiVersion: gateway.operator.io/v1\nkind: Gateway\nmetadata:\n  name: edge\n  namespace: apps\nspec: {}\n");
        let contribution = apply(&gateway);
        assert_eq!(contribution.env.value_of("CLUSTER_DISCOVERY_SERVICE_DNS"), Some("edge-headless.apps.svc.cluster.local"));
        assert_eq!(contribution.env.value_of("CLUSTER_DISCOVERY_PORT"), Some("5701"));
    }
}
