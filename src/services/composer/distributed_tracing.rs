use super::{CompositionContext, Contribution, FeatureError, export_env};
use crate::crds::{ExportConfig, Gateway, GatewaySpec};

fn export(spec: &GatewaySpec) -> Option<&ExportConfig> {
    spec.observability.as_ref().and_then(|o| o.tracing.as_ref()).and_then(|t| t.export.as_ref()).filter(|e| e.enabled)
}

pub fn applies(spec: &GatewaySpec) -> bool {
    export(spec).is_some()
}

pub fn apply(context: &CompositionContext, gateway: &Gateway) -> Result<Contribution, FeatureError> {
    let mut contribution = Contribution::default();
    if let Some(export) = export(&gateway.spec) {
        contribution.env = export_env(context, gateway, export, "TRACING_EXPORT")?;
        contribution.env.insert_value("MANAGEMENT_TRACING_ENABLED", "true");
        contribution.env.insert_value("MANAGEMENT_TRACING_SAMPLING_PROBABILITY", "1.0");
    }
    Ok(contribution)
}
