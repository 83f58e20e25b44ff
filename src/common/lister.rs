use std::{fmt::Debug, sync::Arc};

use futures::{StreamExt, future};
use kube::{
    Api, Resource, ResourceExt,
    runtime::{
        WatchStreamExt,
        reflector::{self, ObjectRef, Store, store::WriterDropped},
        watcher,
    },
};
use serde::de::DeserializeOwned;
use tracing::info;

/// Read-only view over a locally mirrored, eventually consistent copy of cluster objects.
pub trait Lister<K>: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>>;
    fn list(&self, namespace: &str) -> Vec<Arc<K>>;
}

impl<K> Lister<K> for Store<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        Store::get(self, &ObjectRef::new(name).within(namespace))
    }

    fn list(&self, namespace: &str) -> Vec<Arc<K>> {
        self.state().into_iter().filter(|o| o.namespace().as_deref() == Some(namespace)).collect()
    }
}

/// Starts a reflector for `K` in the background and hands out its store.
pub fn spawn_reflector<K>(api: Api<K>, config: watcher::Config) -> Store<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher(api, config)).default_backoff().touched_objects().for_each(|_| future::ready(()));
    tokio::spawn(stream);
    reader
}

/// Resolves once `store` holds the result of its initial list.
pub async fn wait_until_synced<K>(kind: &str, store: &Store<K>) -> Result<(), WriterDropped>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    store.wait_until_ready().await?;
    info!("{kind} cache synced, {} objects", store.state().len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;
    use k8s_openapi::api::core::v1::Secret;
    use kube_core::ObjectMeta;

    use super::*;

    #[tokio::test]
    async fn test_synced_after_initial_list() {
        let (reader, mut writer) = reflector::store::<Secret>();
        assert!(wait_until_synced("secrets", &reader).now_or_never().is_none());

        let secret = Secret { metadata: ObjectMeta { name: Some("sso".to_owned()), namespace: Some("apps".to_owned()), ..Default::default() }, ..Default::default() };
        writer.apply_watcher_event(&watcher::Event::Init);
        writer.apply_watcher_event(&watcher::Event::InitApply(secret));
        assert!(wait_until_synced("secrets", &reader).now_or_never().is_none());

        writer.apply_watcher_event(&watcher::Event::InitDone);
        assert!(wait_until_synced("secrets", &reader).await.is_ok());
        assert!(Lister::get(&reader, "apps", "sso").is_some());
    }
}
