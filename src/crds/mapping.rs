use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Binds a route configuration to a Gateway.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "gateway.operator.io", version = "v1", kind = "GatewayMapping", namespaced, shortname = "gwm")]
#[serde(rename_all = "camelCase")]
pub struct GatewayMappingSpec {
    pub gateway_ref: NamedReference,
    pub route_config_ref: NamedReference,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct NamedReference {
    pub name: String,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "gateway.operator.io", version = "v1", kind = "GatewayRouteConfig", namespaced, shortname = "gwrc")]
pub struct GatewayRouteConfigSpec {
    pub service: Option<ServiceTarget>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ServiceTarget {
    pub name: String,
    pub namespace: Option<String>,
    pub port: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct RouteSpec {
    pub uri: Option<String>,
    #[serde(default)]
    pub predicates: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    pub order: Option<i32>,
}
