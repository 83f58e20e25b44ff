use std::{collections::BTreeMap, sync::Arc};

use kube::ResourceExt;
use serde::Serialize;

use crate::{
    common::Lister,
    crds::{GatewayMapping, GatewayRouteConfig, ServiceTarget},
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("route config {0} not found")]
    MissingRouteConfig(String),
    #[error("route {0} has neither an uri nor a target service")]
    MissingTarget(String),
}

/// Predicate or filter in the `Name=arg1,arg2` shortcut form, expanded.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Definition {
    pub name: String,
    pub args: BTreeMap<String, String>,
}

impl Definition {
    pub fn from_shortcut(shortcut: &str) -> Self {
        let (name, args) = shortcut.split_once('=').unwrap_or((shortcut, ""));
        let args = args
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .enumerate()
            .map(|(index, arg)| (format!("_genkey_{index}"), arg.to_owned()))
            .collect();
        Self { name: name.trim().to_owned(), args }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct RouteDefinition {
    pub id: String,
    pub uri: String,
    pub predicates: Vec<Definition>,
    pub filters: Vec<Definition>,
    pub order: i32,
}

/// Turns route mappings bound to a gateway into concrete route definitions.
pub trait RouteResolver: Send + Sync {
    fn mappings(&self, namespace: &str, gateway_name: &str) -> Vec<Arc<GatewayMapping>>;
    fn resolve(&self, mapping: &GatewayMapping) -> Result<Vec<RouteDefinition>, RouteError>;
}

pub struct RouteConfigResolver {
    mappings: Arc<dyn Lister<GatewayMapping>>,
    route_configs: Arc<dyn Lister<GatewayRouteConfig>>,
}

impl RouteConfigResolver {
    pub fn new(mappings: Arc<dyn Lister<GatewayMapping>>, route_configs: Arc<dyn Lister<GatewayRouteConfig>>) -> Self {
        Self { mappings, route_configs }
    }
}

fn service_uri(service: &ServiceTarget, namespace: &str) -> String {
    let namespace = service.namespace.as_deref().unwrap_or(namespace);
    format!("http://{}.{namespace}.svc.cluster.local:{}", service.name, service.port.unwrap_or(80))
}

impl RouteResolver for RouteConfigResolver {
    fn mappings(&self, namespace: &str, gateway_name: &str) -> Vec<Arc<GatewayMapping>> {
        self.mappings.list(namespace).into_iter().filter(|m| m.spec.gateway_ref.name == gateway_name).collect()
    }

    fn resolve(&self, mapping: &GatewayMapping) -> Result<Vec<RouteDefinition>, RouteError> {
        let namespace = mapping.namespace().unwrap_or_default();
        let config_name = &mapping.spec.route_config_ref.name;
        let config = self.route_configs.get(&namespace, config_name).ok_or_else(|| RouteError::MissingRouteConfig(format!("{namespace}.{config_name}")))?;

        let default_uri = config.spec.service.as_ref().map(|s| service_uri(s, &namespace));
        config
            .spec
            .routes
            .iter()
            .enumerate()
            .map(|(index, route)| -> Result<RouteDefinition, RouteError> {
                let id = format!("{namespace}-{}-{index}", mapping.name_any());
                let uri = route.uri.clone().or_else(|| default_uri.clone()).ok_or_else(|| RouteError::MissingTarget(id.clone()))?;
                Ok(RouteDefinition {
                    id,
                    uri,
                    predicates: route.predicates.iter().map(|p| Definition::from_shortcut(p)).collect(),
                    filters: route.filters.iter().map(|f| Definition::from_shortcut(f)).collect(),
                    order: route.order.unwrap_or_default(),
                })
            })
            .collect()
    }
}
