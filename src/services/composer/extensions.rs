use k8s_openapi::api::core::v1::{
    ConfigMapProjection, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, ProjectedVolumeSource, Volume, VolumeMount, VolumeProjection,
};
use kube::ResourceExt;
use tracing::warn;

use super::{CompositionContext, Contribution, FeatureWarning};
use crate::crds::{Gateway, GatewaySpec};

pub const EXTENSIONS_VOLUME: &str = "extensions";
pub const EXTENSIONS_MOUNT_PATH: &str = "/workspace/extensions";
pub const CLAIMS_MOUNT_ROOT: &str = "/workspace/extension-volumes";

enum Source {
    ConfigMap,
    Claim,
}

pub fn applies(spec: &GatewaySpec) -> bool {
    !spec.custom_extensions().is_empty()
}

fn read_only(claim: &PersistentVolumeClaim) -> bool {
    claim.spec.as_ref().and_then(|s| s.access_modes.as_ref()).is_some_and(|modes| modes.iter().any(|m| m == "ReadOnlyMany"))
}

fn resolve(context: &CompositionContext, namespace: &str, name: &str) -> Result<Source, FeatureWarning> {
    let config_map = context.config_maps.get(namespace, name);
    let claim = context.claims.get(namespace, name);
    match (config_map, claim) {
        (Some(_), None) => Ok(Source::ConfigMap),
        (None, Some(claim)) if read_only(&claim) => Ok(Source::Claim),
        (None, Some(_)) => Err(FeatureWarning::new("ExtensionNotReadOnly", format!("extension {name} claim is not ReadOnlyMany"))),
        (Some(_), Some(_)) => Err(FeatureWarning::new("ExtensionAmbiguous", format!("extension {name} matches both a ConfigMap and a claim"))),
        (None, None) => Err(FeatureWarning::new("ExtensionNotFound", format!("extension {name} not found"))),
    }
}

/// ConfigMaps share one projected volume, claims are mounted one by one.
/// Names which resolve to nothing usable are reported and skipped.
pub fn apply(context: &CompositionContext, gateway: &Gateway) -> Contribution {
    let namespace = gateway.namespace().unwrap_or_default();
    let mut contribution = Contribution::default();
    let mut projections = vec![];
    let mut locations = vec![];

    for name in gateway.spec.custom_extensions() {
        match resolve(context, &namespace, name) {
            Ok(Source::ConfigMap) => {
                projections.push(VolumeProjection { config_map: Some(ConfigMapProjection { name: name.clone(), ..Default::default() }), ..Default::default() });
            },
            Ok(Source::Claim) => {
                let volume_name = format!("extension-{name}");
                let mount_path = format!("{CLAIMS_MOUNT_ROOT}/{name}");
                contribution.volumes.push(Volume {
                    name: volume_name.clone(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource { claim_name: name.clone(), read_only: Some(true) }),
                    ..Default::default()
                });
                contribution.mounts.push(VolumeMount { name: volume_name, mount_path: mount_path.clone(), read_only: Some(true), ..Default::default() });
                locations.push(mount_path);
            },
            Err(warning) => {
                warn!("Skipping extension for {namespace}.{} {}", gateway.name_any(), warning.message);
                contribution.warnings.push(warning);
            },
        }
    }

    if !projections.is_empty() {
        contribution.volumes.insert(
            0,
            Volume {
                name: EXTENSIONS_VOLUME.to_owned(),
                projected: Some(ProjectedVolumeSource { sources: Some(projections), ..Default::default() }),
                ..Default::default()
            },
        );
        contribution
            .mounts
            .insert(0, VolumeMount { name: EXTENSIONS_VOLUME.to_owned(), mount_path: EXTENSIONS_MOUNT_PATH.to_owned(), read_only: Some(true), ..Default::default() });
        locations.insert(0, EXTENSIONS_MOUNT_PATH.to_owned());
    }
    if !locations.is_empty() {
        contribution.env.insert_value("EXTENSIONS_LOCATIONS", locations.join(","));
    }
    contribution
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaimSpec};
    use kube_core::ObjectMeta;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::common::test::{InMemoryLister, gateway_from_yaml};

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta { name: Some(name.to_owned()), namespace: Some("apps".to_owned()), ..Default::default() }
    }

    fn claim(name: &str, mode: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: meta(name),
            spec: Some(PersistentVolumeClaimSpec { access_modes: Some(vec![mode.to_owned()]), ..Default::default() }),
            status: None,
        }
    }

    fn context() -> CompositionContext {
        CompositionContext::builder()
            .secrets(Arc::new(InMemoryLister::<k8s_openapi::api::core::v1::Secret>::default()))
            .config_maps(Arc::new(InMemoryLister::with(vec![
                ConfigMap { metadata: meta("rate-limiter"), ..Default::default() },
                ConfigMap { metadata: meta("headers"), ..Default::default() },
                ConfigMap { metadata: meta("both"), ..Default::default() },
            ])))
            .claims(Arc::new(InMemoryLister::with(vec![claim("geoip", "ReadOnlyMany"), claim("scratch", "ReadWriteOnce"), claim("both", "ReadOnlyMany")])))
            .build()
    }

    #[test]
    fn test_extensions_are_resolved() {
        let gateway = gateway_from_yaml(
            r#"
apiVersion: gateway.operator.io/v1
kind: Gateway
metadata:
  name: edge
  namespace: apps
spec:
  extensions:
    custom: ["rate-limiter", "geoip", "headers", "missing", "scratch", "both"]
"#,
        );
        let contribution = apply(&context(), &gateway);

        let volumes: Vec<_> = contribution.volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(volumes, vec!["extensions", "extension-geoip"]);
        let projected: Vec<_> = contribution.volumes[0]
            .projected
            .iter()
            .flat_map(|p| p.sources.iter().flatten())
            .filter_map(|s| s.config_map.as_ref().map(|c| c.name.clone()))
            .collect();
        assert_eq!(projected, vec!["rate-limiter", "headers"]);
        assert_eq!(contribution.mounts[1].mount_path, "/workspace/extension-volumes/geoip");
        assert_eq!(contribution.env.value_of("EXTENSIONS_LOCATIONS"), Some("/workspace/extensions,/workspace/extension-volumes/geoip"));

        let reasons: Vec<_> = contribution.warnings.iter().map(|w| w.reason.as_str()).collect();
        assert_eq!(reasons, vec!["ExtensionNotFound", "ExtensionNotReadOnly", "ExtensionAmbiguous"]);
    }
}
