use k8s_openapi::api::core::v1::{SecretVolumeSource, Volume, VolumeMount};

use super::Contribution;
use crate::crds::{Gateway, GatewaySpec};

pub const TLS_MOUNT_ROOT: &str = "/etc/gateway/tls";

pub fn applies(spec: &GatewaySpec) -> bool {
    spec.tls.as_ref().is_some_and(|tls| tls.iter().any(|t| !t.hosts.is_empty()))
}

/// One volume, mount and hostname variable per (certificate, host) pair, indexed in spec order.
pub fn apply(gateway: &Gateway) -> Contribution {
    let mut contribution = Contribution::default();
    let pairs = gateway.spec.tls.iter().flatten().flat_map(|tls| tls.hosts.iter().map(move |host| (&tls.secret_name, host)));
    for (index, (secret_name, host)) in pairs.enumerate() {
        let volume_name = format!("tls-{index}");
        let mount_path = format!("{TLS_MOUNT_ROOT}/{index}");
        contribution.volumes.push(Volume {
            name: volume_name.clone(),
            secret: Some(SecretVolumeSource { secret_name: Some(secret_name.clone()), ..Default::default() }),
            ..Default::default()
        });
        contribution.mounts.push(VolumeMount { name: volume_name, mount_path: mount_path.clone(), read_only: Some(true), ..Default::default() });
        contribution.env.insert_value(&format!("TLS_{index}_HOSTNAME"), host.clone());
        contribution.env.insert_value(&format!("TLS_{index}_PATH"), mount_path);
    }
    contribution
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::common::test::gateway_from_yaml;

    #[test]
    fn test_indexed_triples() {
        let gateway = gateway_from_yaml(
            r#"
apiVersion: gateway.operator.io/v1
kind: Gateway
metadata:
  name: edge
  namespace: apps
spec:
  tls:
    - secretName: shop-cert
      hosts: ["shop.example.com", "www.shop.example.com"]
    - secretName: api-cert
      hosts: ["api.example.com"]
"#,
        );
        let contribution = apply(&gateway);
        assert_eq!(contribution.volumes.len(), 3);
        assert_eq!(contribution.volumes[2].secret.as_ref().and_then(|s| s.secret_name.as_deref()), Some("api-cert"));
        assert!(contribution.mounts.iter().all(|m| m.read_only == Some(true)));
        assert_eq!(contribution.mounts[1].mount_path, "/etc/gateway/tls/1");
        assert_eq!(contribution.env.value_of("TLS_1_HOSTNAME"), Some("www.shop.example.com"));
        assert_eq!(contribution.env.value_of("TLS_2_HOSTNAME"), Some("api.example.com"));
    }

    #[test]
    fn test_entries_without_hosts() {
        let gateway = gateway_from_yaml(
            "apiVersion: gateway.operator.io/v1\nkind: Gateway\nmetadata:\n  name: edge\n  namespace: apps\nspec:\n  tls:\n    - secretName: cert\n",
        );
        assert!(!applies(&gateway.spec));
        assert_eq!(apply(&gateway), Contribution::default());
    }
}
