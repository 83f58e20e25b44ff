//! Desired-state composition of the gateway workload.
//!
//! The base template is threaded through an explicitly ordered list of feature
//! contributors. Each contributor returns a [`Contribution`] which is merged into
//! the accumulated one, so later contributors win on environment or annotation
//! name collisions and raw env overrides from the Gateway spec win over everything.

mod cluster_discovery;
mod cors;
mod distributed_tracing;
mod extensions;
mod metrics;
mod secret_injection;
mod sso;
mod template;
mod tls;

pub use metrics::METRICS_PATH;
pub use template::{CONTAINER_NAME, fallback_resources};

use std::{fmt::Display, sync::Arc};

use k8s_openapi::{
    ByteString,
    api::{
        apps::v1::StatefulSet,
        core::v1::{ConfigMap, PersistentVolumeClaim, ResourceRequirements, Secret, Volume, VolumeMount},
    },
};
use kube::ResourceExt;
use tracing::{debug, warn};
use typed_builder::TypedBuilder;

use crate::{
    common::{AnnotationBucket, EnvBucket, Lister},
    crds::{ExportConfig, Gateway, GatewaySpec},
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FeatureError {
    #[error("credential {name} not found")]
    MissingCredential { name: String },
    #[error("credential {name} is missing keys {keys:?}")]
    MissingCredentialKeys { name: String, keys: Vec<String> },
    #[error("issuer {issuer} is not a valid http(s) url")]
    InvalidIssuer { issuer: String },
    #[error("secrets providers disagree on {field}")]
    InconsistentSecretsProviders { field: &'static str },
    #[error("secrets provider {name} is not configured")]
    UnknownSecretsProvider { name: String },
}

/// Something a user should know about but which does not fail the reconcile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureWarning {
    pub reason: String,
    pub message: String,
}

impl FeatureWarning {
    pub fn new(reason: &str, message: impl Into<String>) -> Self {
        Self { reason: reason.to_owned(), message: message.into() }
    }
}

/// Delta a single feature adds to the workload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Contribution {
    pub env: EnvBucket,
    pub annotations: AnnotationBucket,
    pub volumes: Vec<Volume>,
    pub mounts: Vec<VolumeMount>,
    pub warnings: Vec<FeatureWarning>,
}

impl Contribution {
    pub fn merge(&mut self, other: Contribution) {
        self.env.merge(other.env);
        self.annotations.merge(other.annotations);
        for volume in other.volumes {
            self.volumes.retain(|v| v.name != volume.name);
            self.volumes.push(volume);
        }
        for mount in other.mounts {
            self.mounts.retain(|m| m.name != mount.name);
            self.mounts.push(mount);
        }
        self.warnings.extend(other.warnings);
    }
}

/// Read access to the objects contributors validate against.
#[derive(Clone, TypedBuilder)]
pub struct CompositionContext {
    pub secrets: Arc<dyn Lister<Secret>>,
    pub config_maps: Arc<dyn Lister<ConfigMap>>,
    pub claims: Arc<dyn Lister<PersistentVolumeClaim>>,
}

impl CompositionContext {
    /// Looks up a credential and checks it carries every key in `keys`.
    fn credential(&self, namespace: &str, name: &str, keys: &[&str]) -> Result<Arc<Secret>, FeatureError> {
        let secret = self.secrets.get(namespace, name).ok_or_else(|| FeatureError::MissingCredential { name: name.to_owned() })?;
        let missing: Vec<String> = keys.iter().filter(|key| !secret_has_key(&secret, key)).map(|key| (*key).to_owned()).collect();
        if missing.is_empty() {
            Ok(secret)
        } else {
            Err(FeatureError::MissingCredentialKeys { name: name.to_owned(), keys: missing })
        }
    }
}

fn secret_has_key(secret: &Secret, key: &str) -> bool {
    secret.data.as_ref().is_some_and(|d| d.contains_key(key)) || secret.string_data.as_ref().is_some_and(|d| d.contains_key(key))
}

fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|ByteString(bytes)| String::from_utf8_lossy(bytes).into_owned())
        .or_else(|| secret.string_data.as_ref().and_then(|d| d.get(key)).cloned())
}

const EXPORT_KEYS: [&str; 2] = ["export-uri", "api-token"];

/// Env contract shared by metrics and tracing export, `prefix` separates the two.
fn export_env(context: &CompositionContext, gateway: &Gateway, export: &ExportConfig, prefix: &str) -> Result<EnvBucket, FeatureError> {
    let namespace = gateway.namespace().unwrap_or_default();
    let secret_name = export.secret.clone().unwrap_or_default();
    context.credential(&namespace, &secret_name, &EXPORT_KEYS)?;

    let mut env = EnvBucket::new();
    env.insert_value(&format!("{prefix}_ENABLED"), "true");
    env.insert_secret_ref(&format!("{prefix}_URI"), &secret_name, "export-uri");
    env.insert_secret_ref(&format!("{prefix}_API_TOKEN"), &secret_name, "api-token");
    env.insert_value(&format!("{prefix}_APPLICATION"), export.application.clone().unwrap_or_else(|| gateway.name_any()));
    env.insert_value(&format!("{prefix}_SERVICE"), export.service.clone().unwrap_or_else(|| gateway.name_any()));
    Ok(env)
}

/// One variant per feature. Variants run in the order of [`FeatureContributor::ORDERED`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeatureContributor {
    ClusterDiscovery,
    Sso,
    Metrics,
    Tracing,
    Cors,
    Tls,
    Extensions,
    SecretInjection,
}

impl Display for FeatureContributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl FeatureContributor {
    pub const ORDERED: [FeatureContributor; 8] = [
        FeatureContributor::ClusterDiscovery,
        FeatureContributor::Sso,
        FeatureContributor::Metrics,
        FeatureContributor::Tracing,
        FeatureContributor::Cors,
        FeatureContributor::Tls,
        FeatureContributor::Extensions,
        FeatureContributor::SecretInjection,
    ];

    pub fn applies(self, spec: &GatewaySpec) -> bool {
        match self {
            FeatureContributor::ClusterDiscovery => cluster_discovery::applies(spec),
            FeatureContributor::Sso => sso::applies(spec),
            FeatureContributor::Metrics => metrics::applies(spec),
            FeatureContributor::Tracing => distributed_tracing::applies(spec),
            FeatureContributor::Cors => cors::applies(spec),
            FeatureContributor::Tls => tls::applies(spec),
            FeatureContributor::Extensions => extensions::applies(spec),
            FeatureContributor::SecretInjection => secret_injection::applies(spec),
        }
    }

    /// Must only be called when [`FeatureContributor::applies`] holds.
    pub fn apply(self, context: &CompositionContext, gateway: &Gateway) -> Result<Contribution, FeatureError> {
        match self {
            FeatureContributor::ClusterDiscovery => Ok(cluster_discovery::apply(gateway)),
            FeatureContributor::Sso => sso::apply(context, gateway),
            FeatureContributor::Metrics => Ok(metrics::apply(context, gateway)),
            FeatureContributor::Tracing => distributed_tracing::apply(context, gateway),
            FeatureContributor::Cors => Ok(cors::apply(gateway)),
            FeatureContributor::Tls => Ok(tls::apply(gateway)),
            FeatureContributor::Extensions => Ok(extensions::apply(context, gateway)),
            FeatureContributor::SecretInjection => secret_injection::apply(gateway),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ComposedWorkload {
    pub stateful_set: StatefulSet,
    pub warnings: Vec<FeatureWarning>,
}

#[derive(Clone, TypedBuilder)]
pub struct Composer {
    context: CompositionContext,
    image: String,
    #[builder(default)]
    image_pull_secret: Option<String>,
    default_resources: ResourceRequirements,
}

impl Composer {
    pub fn compose(&self, gateway: &Gateway) -> ComposedWorkload {
        let mut composed = Contribution { env: template::base_env(), ..Default::default() };

        for contributor in FeatureContributor::ORDERED {
            if !contributor.applies(&gateway.spec) {
                continue;
            }
            match contributor.apply(&self.context, gateway) {
                Ok(contribution) => {
                    debug!("{contributor} contributed {} env vars {} annotations", contribution.env.len(), contribution.annotations.len());
                    composed.merge(contribution);
                },
                Err(e) => {
                    warn!("{contributor} disabled for {}.{} {e}", gateway.namespace().unwrap_or_default(), gateway.name_any());
                    composed.warnings.push(FeatureWarning::new(&format!("{contributor}Disabled"), e.to_string()));
                },
            }
        }

        for env_override in gateway.spec.env.iter().flatten() {
            composed.env.insert_value(&env_override.name, env_override.value.clone());
        }

        let warnings = std::mem::take(&mut composed.warnings);
        let stateful_set = template::stateful_set(
            gateway,
            &template::TemplateSettings {
                image: &self.image,
                image_pull_secret: self.image_pull_secret.as_deref(),
                default_resources: &self.default_resources,
            },
            composed,
        );
        ComposedWorkload { stateful_set, warnings }
    }
}
