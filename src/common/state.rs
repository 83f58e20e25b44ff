use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use super::ResourceKey;

#[derive(thiserror::Error, Debug, PartialEq, PartialOrd)]
pub enum StorageError {
    LockingError,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// SHA-256 over the binary entries of a ConfigMap.
pub type PayloadDigest = Vec<u8>;

/// Memory shared between reconcile invocations of this process.
#[derive(Clone, Default)]
pub struct State {
    pods_ready: Arc<Mutex<HashMap<ResourceKey, bool>>>,
    config_map_digests: Arc<Mutex<HashMap<ResourceKey, PayloadDigest>>>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the latest container readiness of a pod and returns the previous one.
    pub fn swap_pod_ready(&self, key: &ResourceKey, ready: bool) -> Result<Option<bool>, StorageError> {
        let mut lock = self.pods_ready.lock().map_err(|_| StorageError::LockingError)?;
        Ok(lock.insert(key.clone(), ready))
    }

    pub fn forget_pod(&self, key: &ResourceKey) -> Result<(), StorageError> {
        let mut lock = self.pods_ready.lock().map_err(|_| StorageError::LockingError)?;
        lock.remove(key);
        Ok(())
    }

    pub fn get_config_map_digest(&self, key: &ResourceKey) -> Result<Option<PayloadDigest>, StorageError> {
        let lock = self.config_map_digests.lock().map_err(|_| StorageError::LockingError)?;
        Ok(lock.get(key).cloned())
    }

    pub fn save_config_map_digest(&self, key: ResourceKey, digest: PayloadDigest) -> Result<(), StorageError> {
        let mut lock = self.config_map_digests.lock().map_err(|_| StorageError::LockingError)?;
        lock.insert(key, digest);
        Ok(())
    }

    pub fn forget_config_map(&self, key: &ResourceKey) -> Result<(), StorageError> {
        let mut lock = self.config_map_digests.lock().map_err(|_| StorageError::LockingError)?;
        lock.remove(key);
        Ok(())
    }
}
