use itertools::Itertools;
use kube::ResourceExt;

use super::{Contribution, FeatureError};
use crate::crds::{Gateway, GatewaySpec, SecretsProvider, SecretsProviderBinding};

const AGENT_PREFIX: &str = "vault.hashicorp.com";
const DEFAULT_SECRETS_PATH: &str = "secret";
const SECRETS_MOUNT_ROOT: &str = "/vault/secrets";

fn providers(spec: &GatewaySpec) -> &[SecretsProvider] {
    spec.extensions.as_ref().and_then(|e| e.secrets_providers.as_deref()).unwrap_or_default()
}

pub fn applies(spec: &GatewaySpec) -> bool {
    !providers(spec).is_empty()
}

/// Features of the gateway which read their keys through the injector.
fn bindings(spec: &GatewaySpec) -> Vec<(&'static str, &SecretsProviderBinding)> {
    let Some(filters) = spec.extensions.as_ref().and_then(|e| e.filters.as_ref()) else {
        return vec![];
    };
    [("api-key", filters.api_key.as_ref()), ("jwt-key", filters.jwt_key.as_ref())]
        .into_iter()
        .filter_map(|(feature, binding)| binding.filter(|b| b.enabled).map(|b| (feature, b)))
        .collect()
}

fn template(path: &str) -> String {
    format!("{{{{- with secret \"{path}\" -}}}}{{{{- range $k, $v := .Data.data }}}}{{{{ $k }}}}={{{{ $v }}}}\n{{{{ end }}}}{{{{- end }}}}")
}

/// Every provider of a gateway must agree on role and auth path, otherwise nothing is emitted.
pub fn apply(gateway: &Gateway) -> Result<Contribution, FeatureError> {
    let providers = providers(&gateway.spec);
    let Ok(role) = providers.iter().map(|p| &p.vault.role_name).all_equal_value() else {
        return Err(FeatureError::InconsistentSecretsProviders { field: "roleName" });
    };
    let Ok(auth_path) = providers.iter().map(|p| &p.vault.auth_path).all_equal_value() else {
        return Err(FeatureError::InconsistentSecretsProviders { field: "authPath" });
    };

    let namespace = gateway.namespace().unwrap_or_default();
    let name = gateway.name_any();
    let mut contribution = Contribution::default();
    let annotations = &mut contribution.annotations;
    annotations.insert(format!("{AGENT_PREFIX}/agent-inject"), "true".to_owned());
    annotations.insert(format!("{AGENT_PREFIX}/role"), role.clone());
    if let Some(auth_path) = auth_path {
        annotations.insert(format!("{AGENT_PREFIX}/auth-path"), auth_path.clone());
    }

    for (feature, binding) in bindings(&gateway.spec) {
        let provider = providers
            .iter()
            .find(|p| p.name == binding.secrets_provider_name)
            .ok_or_else(|| FeatureError::UnknownSecretsProvider { name: binding.secrets_provider_name.clone() })?;
        let root = provider.vault.path.as_deref().unwrap_or(DEFAULT_SECRETS_PATH).trim_end_matches('/');
        let path = format!("{root}/{feature}/{namespace}/{name}");
        contribution.annotations.insert(format!("{AGENT_PREFIX}/agent-inject-template-{feature}"), template(&path));
        contribution.annotations.insert(format!("{AGENT_PREFIX}/agent-inject-secret-{feature}"), path);
        contribution.env.insert_value(&format!("{}_SECRETS_PATH", feature.replace('-', "_").to_uppercase()), format!("{SECRETS_MOUNT_ROOT}/{feature}"));
    }
    Ok(contribution)
}
