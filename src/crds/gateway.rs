use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "gateway.operator.io",
    version = "v1",
    kind = "Gateway",
    namespaced,
    status = "GatewayStatus",
    shortname = "gw",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    pub count: Option<i32>,
    pub env: Option<Vec<EnvOverride>>,
    pub resources: Option<ResourceRequirements>,
    pub security_context: Option<SecurityContextOverrides>,
    pub sso: Option<SsoConfig>,
    pub observability: Option<ObservabilityConfig>,
    pub extensions: Option<ExtensionsConfig>,
    pub tls: Option<Vec<TlsConfig>>,
    pub cors: Option<CorsConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct EnvOverride {
    pub name: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContextOverrides {
    pub run_as_user: Option<i64>,
    pub run_as_group: Option<i64>,
    pub fs_group: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SsoConfig {
    /// Secret holding the client credentials and the issuer.
    pub secret: String,
    pub roles_attribute_name: Option<String>,
    pub inactive_session_expiration_in_minutes: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ObservabilityConfig {
    pub metrics: Option<MetricsConfig>,
    pub tracing: Option<TracingConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct MetricsConfig {
    pub prometheus: Option<PrometheusConfig>,
    pub export: Option<ExportConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrometheusConfig {
    #[serde(default)]
    pub enabled: bool,
    pub annotations: Option<ToggleConfig>,
    pub service_monitor: Option<ServiceMonitorConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ToggleConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ServiceMonitorConfig {
    #[serde(default)]
    pub enabled: bool,
    pub labels: Option<BTreeMap<String, String>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct TracingConfig {
    pub export: Option<ExportConfig>,
}

/// External telemetry export target, credentials live in `secret`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ExportConfig {
    #[serde(default)]
    pub enabled: bool,
    pub secret: Option<String>,
    pub application: Option<String>,
    pub service: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionsConfig {
    pub custom: Option<Vec<String>>,
    pub secrets_providers: Option<Vec<SecretsProvider>>,
    pub filters: Option<ExtensionFilters>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct SecretsProvider {
    pub name: String,
    pub vault: VaultProvider,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VaultProvider {
    pub role_name: String,
    pub auth_path: Option<String>,
    pub path: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionFilters {
    pub api_key: Option<SecretsProviderBinding>,
    pub jwt_key: Option<SecretsProviderBinding>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretsProviderBinding {
    #[serde(default)]
    pub enabled: bool,
    pub secrets_provider_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub secret_name: String,
    #[serde(default)]
    pub hosts: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CorsConfig {
    pub global: Option<CorsPolicy>,
    pub per_route: Option<BTreeMap<String, CorsPolicy>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CorsPolicy {
    pub allowed_origins: Option<Vec<String>>,
    pub allowed_origin_patterns: Option<Vec<String>>,
    pub allowed_methods: Option<Vec<String>>,
    pub allowed_headers: Option<Vec<String>>,
    pub exposed_headers: Option<Vec<String>>,
    pub allow_credentials: Option<bool>,
    pub max_age: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct GatewayStatus {
    #[serde(default)]
    pub conditions: Vec<GatewayCondition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewayCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub last_transition_time: String,
    pub reason: String,
}

impl GatewaySpec {
    pub fn replicas(&self) -> i32 {
        self.count.unwrap_or(1)
    }

    pub fn custom_extensions(&self) -> &[String] {
        self.extensions.as_ref().and_then(|e| e.custom.as_deref()).unwrap_or_default()
    }

    pub fn references_extension(&self, name: &str) -> bool {
        self.custom_extensions().iter().any(|e| e == name)
    }

    pub fn service_monitor(&self) -> Option<&ServiceMonitorConfig> {
        self.observability
            .as_ref()
            .and_then(|o| o.metrics.as_ref())
            .and_then(|m| m.prometheus.as_ref())
            .and_then(|p| p.service_monitor.as_ref())
            .filter(|s| s.enabled)
    }
}
