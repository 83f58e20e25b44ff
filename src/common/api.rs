use std::fmt::{Debug, Display};

use async_trait::async_trait;
use kube::{
    Api, Client, Resource,
    api::{DeleteParams, Patch, PatchParams, PostParams},
    core::NamespaceResourceScope,
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Outcome classes of a control-plane call the reconcilers branch on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiErrorKind {
    NotFound,
    Conflict,
    Unprocessable,
    Transient,
    Other,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ApiErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ApiErrorKind::Conflict
    }
}

impl From<kube::Error> for ApiError {
    fn from(error: kube::Error) -> Self {
        let kind = match &error {
            kube::Error::Api(response) => match response.code {
                404 => ApiErrorKind::NotFound,
                409 => ApiErrorKind::Conflict,
                422 => ApiErrorKind::Unprocessable,
                429 | 500..=599 => ApiErrorKind::Transient,
                _ => ApiErrorKind::Other,
            },
            kube::Error::HyperError(_) | kube::Error::Service(_) => ApiErrorKind::Transient,
            _ => ApiErrorKind::Other,
        };
        Self { kind, message: error.to_string() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ObjectPatch {
    /// RFC7386 merge patch.
    Merge(Value),
    /// RFC6902 patch.
    Json(json_patch::Patch),
    Strategic(Value),
}

/// Mutating seam towards the control plane for one namespaced kind.
#[async_trait]
pub trait ObjectApi<K>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, ApiError>;
    async fn create(&self, namespace: &str, object: &K) -> Result<K, ApiError>;
    async fn patch(&self, namespace: &str, name: &str, patch: &ObjectPatch) -> Result<K, ApiError>;
    async fn patch_status(&self, namespace: &str, name: &str, patch: &ObjectPatch) -> Result<K, ApiError>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ApiError>;
}

pub struct KubeApi<K> {
    client: Client,
    field_manager: String,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K> KubeApi<K> {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self { client, field_manager: field_manager.to_owned(), _kind: std::marker::PhantomData }
    }
}

impl<K> KubeApi<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams { field_manager: Some(self.field_manager.clone()), ..Default::default() }
    }
}

#[async_trait]
impl<K> ObjectApi<K> for KubeApi<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, ApiError> {
        Ok(self.api(namespace).get(name).await?)
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, ApiError> {
        let params = PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        Ok(self.api(namespace).create(&params, object).await?)
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &ObjectPatch) -> Result<K, ApiError> {
        let api = self.api(namespace);
        let params = self.patch_params();
        let patched = match patch {
            ObjectPatch::Merge(value) => api.patch(name, &params, &Patch::Merge(value)).await?,
            ObjectPatch::Json(ops) => api.patch(name, &params, &Patch::Json::<()>(ops.clone())).await?,
            ObjectPatch::Strategic(value) => api.patch(name, &params, &Patch::Strategic(value)).await?,
        };
        Ok(patched)
    }

    async fn patch_status(&self, namespace: &str, name: &str, patch: &ObjectPatch) -> Result<K, ApiError> {
        let api = self.api(namespace);
        let params = self.patch_params();
        let patched = match patch {
            ObjectPatch::Merge(value) => api.patch_status(name, &params, &Patch::Merge(value)).await?,
            ObjectPatch::Json(ops) => api.patch_status(name, &params, &Patch::Json::<()>(ops.clone())).await?,
            ObjectPatch::Strategic(value) => api.patch_status(name, &params, &Patch::Strategic(value)).await?,
        };
        Ok(patched)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let _ = self.api(namespace).delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
