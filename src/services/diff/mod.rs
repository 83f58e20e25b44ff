//! Converts desired vs observed state into a minimal, idempotent mutation.
//!
//! Fields present only in the observed object (server defaults, fields owned by
//! other managers) never produce a difference: an object is considered converged
//! when the desired representation is contained in the observed one. A `null` in
//! the desired representation asks for the field to be absent.

mod fields;

pub use fields::{
    SERVICE_IGNORED_FIELDS, WORKLOAD_IGNORED_FIELDS, clear_owned_fields, forward_equivalent_quantities, forward_ignored_fields, forward_volume_claim_templates,
    normalize_env,
};
use json_patch::{AddOperation, PatchOperation, RemoveOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Service};
use kube::ResourceExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::common::{ApiError, ApiErrorKind, ObjectApi, ObjectPatch};

#[derive(thiserror::Error, Debug)]
pub enum DiffError {
    #[error("unable to serialize object {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What the engine did to converge an object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Convergence {
    Created,
    Patched,
    Recreated,
    Unchanged,
}

pub fn is_subset(desired: &Value, observed: &Value) -> bool {
    match (desired, observed) {
        (Value::Null, o) => o.is_null(),
        (Value::Object(d), Value::Object(o)) => d.iter().all(|(k, v)| match o.get(k) {
            Some(ov) => is_subset(v, ov),
            None => v.is_null(),
        }),
        (Value::Array(d), Value::Array(o)) => d.len() == o.len() && d.iter().zip(o).all(|(dv, ov)| is_subset(dv, ov)),
        (d, o) => d == o,
    }
}

fn without_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(map.iter().filter(|(_, v)| !v.is_null()).map(|(k, v)| (k.clone(), without_nulls(v))).collect()),
        Value::Array(items) => Value::Array(items.iter().map(without_nulls).collect()),
        other => other.clone(),
    }
}

/// RFC7386 patch touching only what `desired` changes, arrays are replaced wholesale.
pub fn merge_patch(observed: &Value, desired: &Value) -> Option<Value> {
    match (observed, desired) {
        (Value::Object(o), Value::Object(d)) => {
            let mut patch = Map::new();
            for (key, desired_value) in d {
                match o.get(key) {
                    Some(observed_value) if desired_value.is_null() => {
                        if !observed_value.is_null() {
                            patch.insert(key.clone(), Value::Null);
                        }
                    },
                    Some(observed_value) => {
                        if let Some(value) = merge_patch(observed_value, desired_value) {
                            patch.insert(key.clone(), value);
                        }
                    },
                    None if desired_value.is_null() => {},
                    None => {
                        patch.insert(key.clone(), without_nulls(desired_value));
                    },
                }
            }
            if patch.is_empty() { None } else { Some(Value::Object(patch)) }
        },
        (o, d) if is_subset(d, o) => None,
        (_, d) => Some(without_nulls(d)),
    }
}

/// RFC6902 operations with the same semantics as [`merge_patch`].
pub fn json_patch_operations(observed: &Value, desired: &Value) -> Vec<PatchOperation> {
    let mut operations = vec![];
    collect_operations(&mut vec![], observed, desired, &mut operations);
    operations
}

fn collect_operations(path: &mut Vec<String>, observed: &Value, desired: &Value, operations: &mut Vec<PatchOperation>) {
    match (observed, desired) {
        (Value::Object(o), Value::Object(d)) => {
            for (key, desired_value) in d {
                path.push(key.clone());
                match o.get(key) {
                    Some(observed_value) if desired_value.is_null() => {
                        if !observed_value.is_null() {
                            operations.push(PatchOperation::Remove(RemoveOperation { path: pointer(path) }));
                        }
                    },
                    Some(observed_value) => collect_operations(path, observed_value, desired_value, operations),
                    None if desired_value.is_null() => {},
                    None => operations.push(PatchOperation::Add(AddOperation { path: pointer(path), value: without_nulls(desired_value) })),
                }
                path.pop();
            }
        },
        (o, d) if is_subset(d, o) => {},
        (_, d) => operations.push(PatchOperation::Replace(ReplaceOperation { path: pointer(path), value: without_nulls(d) })),
    }
}

fn pointer(path: &[String]) -> PointerBuf {
    PointerBuf::from_tokens(path.iter().map(String::as_str))
}

fn prepare<K: Serialize>(desired: &K, observed: &K, ignored: &[&str]) -> Result<(Value, Value), DiffError> {
    let mut desired = serde_json::to_value(desired)?;
    let mut observed = serde_json::to_value(observed)?;
    normalize_env(&mut desired);
    normalize_env(&mut observed);
    forward_ignored_fields(&mut desired, &observed, ignored);
    Ok((desired, observed))
}

/// Computes the merge patch converging an observed workload, `None` when nothing differs.
pub fn workload_patch(desired: &StatefulSet, observed: &StatefulSet) -> Result<Option<ObjectPatch>, DiffError> {
    let (mut desired, observed) = prepare(desired, observed, WORKLOAD_IGNORED_FIELDS)?;
    forward_volume_claim_templates(&mut desired, &observed);
    forward_equivalent_quantities(&mut desired, &observed);
    clear_owned_fields(&mut desired, &observed, WORKLOAD_IGNORED_FIELDS);
    Ok(merge_patch(&observed, &desired).map(ObjectPatch::Merge))
}

/// Computes the RFC6902 patch converging an observed service, `None` when nothing differs.
pub fn service_patch(desired: &Service, observed: &Service) -> Result<Option<ObjectPatch>, DiffError> {
    let (desired, observed) = prepare(desired, observed, SERVICE_IGNORED_FIELDS)?;
    let operations = json_patch_operations(&observed, &desired);
    Ok(if operations.is_empty() { None } else { Some(ObjectPatch::Json(json_patch::Patch(operations))) })
}

/// Creates `desired` tolerating a concurrent creation.
pub async fn create_object<K>(api: &dyn ObjectApi<K>, namespace: &str, desired: &K) -> Result<Convergence, ApiError>
where
    K: ResourceExt,
{
    match api.create(namespace, desired).await {
        Ok(_) => Ok(Convergence::Created),
        Err(e) if e.is_conflict() => {
            debug!("{namespace}.{} already exists", desired.name_any());
            Ok(Convergence::Unchanged)
        },
        Err(e) => Err(e),
    }
}

/// Converges a service: create when missing, JSON patch when different.
pub async fn apply_service(api: &dyn ObjectApi<Service>, namespace: &str, desired: &Service, observed: Option<&Service>) -> Result<Convergence, ApiError> {
    let Some(observed) = observed else {
        return create_object(api, namespace, desired).await;
    };
    let patch = service_patch(desired, observed).map_err(|e| ApiError::new(ApiErrorKind::Other, e.to_string()))?;
    match patch {
        Some(patch) => {
            info!("Patching service {namespace}.{} {patch:?}", desired.name_any());
            api.patch(namespace, &desired.name_any(), &patch).await?;
            Ok(Convergence::Patched)
        },
        None => Ok(Convergence::Unchanged),
    }
}

/// Applies a precomputed workload patch, recreating the workload when the control plane refuses it.
pub async fn apply_workload_patch(api: &dyn ObjectApi<StatefulSet>, namespace: &str, desired: &StatefulSet, patch: &ObjectPatch) -> Result<Convergence, ApiError> {
    let name = desired.name_any();
    match api.patch(namespace, &name, patch).await {
        Ok(_) => Ok(Convergence::Patched),
        Err(e) if e.kind == ApiErrorKind::Unprocessable => {
            warn!("Workload {namespace}.{name} patch rejected, recreating {e}");
            match api.delete(namespace, &name).await {
                Ok(()) => {},
                Err(e) if e.is_not_found() => {},
                Err(e) => return Err(e),
            }
            create_object(api, namespace, desired).await.map(|_| Convergence::Recreated)
        },
        Err(e) => Err(e),
    }
}
