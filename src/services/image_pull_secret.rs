use k8s_openapi::api::core::v1::Secret;
use kube_core::ObjectMeta;
use tracing::debug;

use super::diff::create_object;
use crate::common::{ApiError, ApiErrorKind, Lister, ObjectApi};

/// Copy of the install namespace pull secret for another namespace.
pub fn copy_secret(source: &Secret, namespace: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: source.metadata.name.clone(),
            namespace: Some(namespace.to_owned()),
            labels: source.metadata.labels.clone(),
            ..Default::default()
        },
        type_: source.type_.clone(),
        data: source.data.clone(),
        ..Default::default()
    }
}

/// Makes sure the pull secret exists in `namespace`. Already existing secrets are left alone.
pub async fn ensure(
    secrets: &dyn Lister<Secret>,
    api: &dyn ObjectApi<Secret>,
    install_namespace: &str,
    secret_name: &str,
    namespace: &str,
) -> Result<(), ApiError> {
    if namespace == install_namespace || secrets.get(namespace, secret_name).is_some() {
        return Ok(());
    }
    let Some(source) = secrets.get(install_namespace, secret_name) else {
        return Err(ApiError::new(ApiErrorKind::NotFound, format!("image pull secret {install_namespace}.{secret_name}")));
    };
    debug!("Copying image pull secret {secret_name} from {install_namespace} to {namespace}");
    create_object(api, namespace, &copy_secret(&source, namespace)).await.map(|_| ())
}
