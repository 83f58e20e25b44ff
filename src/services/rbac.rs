use k8s_openapi::api::{
    core::v1::ServiceAccount,
    rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
};
use kube::ResourceExt;
use serde_json::json;
use tracing::debug;

use crate::{
    common::{ApiError, ObjectApi, ObjectPatch, owned_object_meta},
    crds::Gateway,
};

pub fn service_account(gateway: &Gateway) -> ServiceAccount {
    ServiceAccount { metadata: owned_object_meta(gateway, &gateway.name_any()), ..Default::default() }
}

fn rule(resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![String::new()]),
        resources: Some(resources.iter().map(|r| (*r).to_owned()).collect()),
        verbs: verbs.iter().map(|v| (*v).to_owned()).collect(),
        ..Default::default()
    }
}

/// Permissions the gateway needs for peer discovery and reading its own configuration.
pub fn role(gateway: &Gateway) -> Role {
    Role {
        metadata: owned_object_meta(gateway, &gateway.name_any()),
        rules: Some(vec![rule(&["pods", "endpoints", "services"], &["get", "list", "watch"]), rule(&["configmaps", "secrets"], &["get", "list", "watch"])]),
    }
}

pub fn role_binding(gateway: &Gateway) -> RoleBinding {
    let name = gateway.name_any();
    RoleBinding {
        metadata: owned_object_meta(gateway, &name),
        role_ref: RoleRef { api_group: "rbac.authorization.k8s.io".to_owned(), kind: "Role".to_owned(), name: name.clone() },
        subjects: Some(vec![Subject { kind: "ServiceAccount".to_owned(), name, namespace: gateway.namespace(), ..Default::default() }]),
    }
}

pub struct RbacApis<'a> {
    pub service_accounts: &'a dyn ObjectApi<ServiceAccount>,
    pub roles: &'a dyn ObjectApi<Role>,
    pub role_bindings: &'a dyn ObjectApi<RoleBinding>,
}

/// Creates the identity of a gateway, or brings rules and subjects of an existing one up to date.
pub async fn provision(apis: &RbacApis<'_>, gateway: &Gateway) -> Result<(), ApiError> {
    let namespace = gateway.namespace().unwrap_or_default();
    let name = gateway.name_any();

    match apis.service_accounts.create(&namespace, &service_account(gateway)).await {
        Ok(_) => debug!("Created service account {namespace}.{name}"),
        Err(e) if e.is_conflict() => {},
        Err(e) => return Err(e),
    }

    let role = role(gateway);
    match apis.roles.create(&namespace, &role).await {
        Ok(_) => debug!("Created role {namespace}.{name}"),
        Err(e) if e.is_conflict() => {
            apis.roles.patch(&namespace, &name, &ObjectPatch::Merge(json!({ "rules": role.rules }))).await?;
        },
        Err(e) => return Err(e),
    }

    let binding = role_binding(gateway);
    match apis.role_bindings.create(&namespace, &binding).await {
        Ok(_) => debug!("Created role binding {namespace}.{name}"),
        Err(e) if e.is_conflict() => {
            apis.role_bindings.patch(&namespace, &name, &ObjectPatch::Merge(json!({ "subjects": binding.subjects }))).await?;
        },
        Err(e) => return Err(e),
    }
    Ok(())
}
