use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use tracing::{debug, info};

use super::{
    composer::METRICS_PATH,
    diff::{create_object, merge_patch},
};
use crate::{
    common::{ApiError, ApiErrorKind, ObjectApi, ObjectPatch, owned_object_meta, ownership_labels},
    crds::{Gateway, MonitorEndpoint, NamespaceSelector, ServiceMonitor, ServiceMonitorConfig, ServiceMonitorSpec},
};

const SCRAPE_INTERVAL: &str = "30s";

pub fn service_monitor(gateway: &Gateway, config: &ServiceMonitorConfig) -> ServiceMonitor {
    let name = gateway.name_any();
    let mut metadata = owned_object_meta(gateway, &name);
    let mut labels = config.labels.clone().unwrap_or_default();
    labels.extend(ownership_labels(&name));
    metadata.labels = Some(labels);

    ServiceMonitor {
        metadata,
        spec: ServiceMonitorSpec {
            selector: LabelSelector { match_labels: Some(ownership_labels(&name)), ..Default::default() },
            namespace_selector: Some(NamespaceSelector { match_names: vec![gateway.namespace().unwrap_or_default()] }),
            endpoints: vec![MonitorEndpoint { port: "management".to_owned(), path: METRICS_PATH.to_owned(), interval: Some(SCRAPE_INTERVAL.to_owned()) }],
        },
    }
}

/// Reads before creating so an existing monitor is never recreated.
pub async fn reconcile(api: &dyn ObjectApi<ServiceMonitor>, gateway: &Gateway) -> Result<(), ApiError> {
    let Some(config) = gateway.spec.service_monitor() else {
        return Ok(());
    };
    let namespace = gateway.namespace().unwrap_or_default();
    let desired = service_monitor(gateway, config);

    match api.get(&namespace, &desired.name_any()).await {
        Ok(observed) => {
            let observed = serde_json::to_value(&observed).map_err(|e| ApiError::new(ApiErrorKind::Other, e.to_string()))?;
            let desired_value = serde_json::to_value(&desired).map_err(|e| ApiError::new(ApiErrorKind::Other, e.to_string()))?;
            let patch = merge_patch(&observed, &desired_value).and_then(|mut patch| {
                let patch = patch.as_object_mut()?;
                patch.retain(|key, _| key == "spec" || key == "metadata");
                (!patch.is_empty()).then(|| serde_json::Value::Object(patch.clone()))
            });
            if let Some(patch) = patch {
                info!("Updating service monitor {namespace}.{}", desired.name_any());
                api.patch(&namespace, &desired.name_any(), &ObjectPatch::Merge(patch)).await?;
            }
            Ok(())
        },
        Err(e) if e.is_not_found() => {
            debug!("Creating service monitor {namespace}.{}", desired.name_any());
            create_object(api, &namespace, &desired).await.map(|_| ())
        },
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::common::{
        OWNERSHIP_LABEL,
        test::{FakeApi, Verb, gateway_from_yaml},
    };

    fn gateway(enabled: bool) -> Gateway {
        gateway_from_yaml(&format!(
            r#"
apiVersion: gateway.operator.io/v1
kind: Gateway
metadata:
  name: edge
  namespace: apps
spec:
  observability:
    metrics:
      prometheus:
        enabled: true
        serviceMonitor:
          enabled: {enabled}
          labels:
            release: prometheus
"#
        ))
    }

    #[tokio::test]
    async fn test_read_then_create() {
        let api = FakeApi::<ServiceMonitor>::default();
        reconcile(&api, &gateway(true)).await.unwrap();
        reconcile(&api, &gateway(true)).await.unwrap();

        assert_eq!(api.calls_of(Verb::Create).len(), 1);
        assert_eq!(api.calls_of(Verb::Get).len(), 2);
        assert!(api.calls_of(Verb::Patch).is_empty());
        let monitor = api.stored("apps", "edge").unwrap();
        let labels = monitor.metadata.labels.unwrap_or_default();
        assert_eq!(labels.get("release"), Some(&"prometheus".to_owned()));
        assert_eq!(labels.get(OWNERSHIP_LABEL), Some(&"edge".to_owned()));
        assert_eq!(monitor.spec.endpoints[0].port, "management");
    }

    #[tokio::test]
    async fn test_disabled_monitor_is_skipped() {
        let api = FakeApi::<ServiceMonitor>::default();
        reconcile(&api, &gateway(false)).await.unwrap();
        assert!(api.calls().is_empty());
    }
}
