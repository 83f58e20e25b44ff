use std::{collections::BTreeMap, time::Duration};

use k8s_openapi::{api::core::v1::ResourceRequirements, apimachinery::pkg::api::resource::Quantity};
use serde::Deserialize;
use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::{Result, services::composer::fallback_resources};

#[derive(Clone, Debug, TypedBuilder, Deserialize, PartialEq, Eq)]
pub struct ResourceAmounts {
    pub cpu: String,
    pub memory: String,
}

#[derive(Clone, Debug, TypedBuilder, Deserialize, PartialEq, Eq)]
pub struct DefaultResources {
    pub requests: ResourceAmounts,
    pub limits: ResourceAmounts,
}

impl From<&DefaultResources> for ResourceRequirements {
    fn from(resources: &DefaultResources) -> Self {
        let quantities = |amounts: &ResourceAmounts| {
            BTreeMap::from([("cpu".to_owned(), Quantity(amounts.cpu.clone())), ("memory".to_owned(), Quantity(amounts.memory.clone()))])
        };
        ResourceRequirements { requests: Some(quantities(&resources.requests)), limits: Some(quantities(&resources.limits)), ..Default::default() }
    }
}

#[derive(Clone, Debug, TypedBuilder, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkersConfiguration {
    pub gateway: u16,
    pub pod: u16,
    pub config_map: u16,
}

impl Default for WorkersConfiguration {
    fn default() -> Self {
        Self { gateway: 4, pod: 4, config_map: 2 }
    }
}

#[derive(Clone, Debug, TypedBuilder, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LeaderElectionConfiguration {
    pub lease_name: String,
    pub identity: Option<String>,
}

impl Default for LeaderElectionConfiguration {
    fn default() -> Self {
        Self { lease_name: "gateway-operator-leader".to_owned(), identity: None }
    }
}

impl LeaderElectionConfiguration {
    pub fn identity(&self) -> String {
        self.identity.clone().or_else(|| std::env::var("POD_NAME").ok()).unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Debug, TypedBuilder, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AdminConfiguration {
    pub timeout_seconds: u64,
}

impl Default for AdminConfiguration {
    fn default() -> Self {
        Self { timeout_seconds: 10 }
    }
}

#[derive(Clone, Debug, TypedBuilder, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RequeueConfiguration {
    pub error_wait_seconds: u64,
    pub waiting_pods_seconds: u64,
}

impl Default for RequeueConfiguration {
    fn default() -> Self {
        Self { error_wait_seconds: 30, waiting_pods_seconds: 10 }
    }
}

impl RequeueConfiguration {
    pub fn error_wait(&self) -> Duration {
        Duration::from_secs(self.error_wait_seconds)
    }

    pub fn waiting_pods(&self) -> Duration {
        Duration::from_secs(self.waiting_pods_seconds)
    }
}

#[derive(Clone, Debug, TypedBuilder, Deserialize)]
pub struct Configuration {
    pub controller_name: String,
    pub install_namespace: String,
    pub gateway_image: String,
    #[builder(default)]
    pub image_pull_secret: Option<String>,
    #[builder(default)]
    pub enable_open_telemetry: Option<bool>,
    #[builder(default)]
    pub default_resources: Option<DefaultResources>,
    #[builder(default)]
    #[serde(default)]
    pub workers: WorkersConfiguration,
    #[builder(default)]
    #[serde(default)]
    pub leader_election: LeaderElectionConfiguration,
    #[builder(default)]
    #[serde(default)]
    pub admin: AdminConfiguration,
    #[builder(default)]
    #[serde(default)]
    pub requeue: RequeueConfiguration,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("controller name must be not empty")]
    ControllerName,
    #[error("install namespace must be not empty")]
    InstallNamespace,
    #[error("gateway image must be not empty")]
    GatewayImage,
    #[error("workers must be at least one per controller")]
    Workers,
}

impl Configuration {
    pub fn validate(&self) -> Result<()> {
        if self.controller_name.is_empty() {
            return Err(ConfigurationError::ControllerName.into());
        }
        if self.install_namespace.is_empty() {
            return Err(ConfigurationError::InstallNamespace.into());
        }
        if self.gateway_image.is_empty() {
            return Err(ConfigurationError::GatewayImage.into());
        }
        if self.workers.gateway == 0 || self.workers.pod == 0 || self.workers.config_map == 0 {
            return Err(ConfigurationError::Workers.into());
        }
        Ok(())
    }

    pub fn default_resources(&self) -> ResourceRequirements {
        self.default_resources.as_ref().map_or_else(fallback_resources, ResourceRequirements::from)
    }
}
