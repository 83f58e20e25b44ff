use kube::ResourceExt;
use tracing::warn;

use super::{CompositionContext, Contribution, FeatureWarning, export_env};
use crate::{
    common::MANAGEMENT_PORT,
    crds::{Gateway, GatewaySpec, MetricsConfig},
};

pub const METRICS_PATH: &str = "/actuator/prometheus";

fn metrics(spec: &GatewaySpec) -> Option<&MetricsConfig> {
    spec.observability.as_ref().and_then(|o| o.metrics.as_ref())
}

pub fn applies(spec: &GatewaySpec) -> bool {
    metrics(spec).is_some()
}

/// Prometheus endpoint and external export are configured independently, a broken
/// export credential only drops the export part.
pub fn apply(context: &CompositionContext, gateway: &Gateway) -> Contribution {
    let mut contribution = Contribution::default();
    let Some(metrics) = metrics(&gateway.spec) else {
        return contribution;
    };

    if let Some(prometheus) = &metrics.prometheus {
        contribution.env.insert_value("MANAGEMENT_PROMETHEUS_METRICS_EXPORT_ENABLED", prometheus.enabled.to_string());
        if prometheus.enabled && prometheus.annotations.as_ref().is_some_and(|a| a.enabled) {
            contribution.annotations.insert("prometheus.io/scrape", "true".to_owned());
            contribution.annotations.insert("prometheus.io/port", MANAGEMENT_PORT.to_string());
            contribution.annotations.insert("prometheus.io/path", METRICS_PATH.to_owned());
        }
    }

    if let Some(export) = metrics.export.as_ref().filter(|e| e.enabled) {
        match export_env(context, gateway, export, "METRICS_EXPORT") {
            Ok(env) => contribution.env.merge(env),
            Err(e) => {
                warn!("Metrics export disabled for {}.{} {e}", gateway.namespace().unwrap_or_default(), gateway.name_any());
                contribution.warnings.push(FeatureWarning::new("MetricsExportDisabled", e.to_string()));
            },
        }
    }
    contribution
}
