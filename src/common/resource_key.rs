use std::fmt::Display;

use kube::{Resource, ResourceExt};

use crate::crds::Gateway;

pub const DEFAULT_NAMESPACE_NAME: &str = "default";

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ResourceKey {
    pub group: String,
    pub namespace: String,
    pub name: String,
    pub kind: String,
}

impl ResourceKey {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_owned(), ..Default::default() }
    }

    pub fn namespaced(name: &str, namespace: &str) -> Self {
        Self { name: name.to_owned(), namespace: namespace.to_owned(), ..Default::default() }
    }

    pub fn from_resource<R>(resource: &R) -> Self
    where
        R: Resource<DynamicType = ()>,
    {
        let namespace = resource.namespace().unwrap_or(DEFAULT_NAMESPACE_NAME.to_owned());
        Self {
            group: R::group(&()).into_owned(),
            namespace: if namespace.is_empty() { DEFAULT_NAMESPACE_NAME.to_owned() } else { namespace },
            name: resource.name_any(),
            kind: R::kind(&()).into_owned(),
        }
    }
}

impl Default for ResourceKey {
    fn default() -> Self {
        Self {
            group: Gateway::group(&()).into_owned(),
            namespace: DEFAULT_NAMESPACE_NAME.to_owned(),
            name: String::default(),
            kind: Gateway::kind(&()).into_owned(),
        }
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Pod;
    use kube_core::ObjectMeta;

    use super::*;

    #[test]
    fn test_key_from_resource() {
        let pod = Pod {
            metadata: ObjectMeta { name: Some("gw-0".to_owned()), namespace: Some("apps".to_owned()), ..Default::default() },
            ..Default::default()
        };
        let key = ResourceKey::from_resource(&pod);
        assert_eq!(key.kind, "Pod");
        assert_eq!(key.group, "");
        assert_eq!(key.to_string(), "apps.gw-0");
    }

    #[test]
    fn test_key_defaults_namespace() {
        let pod = Pod { metadata: ObjectMeta { name: Some("gw-0".to_owned()), ..Default::default() }, ..Default::default() };
        assert_eq!(ResourceKey::from_resource(&pod).namespace, DEFAULT_NAMESPACE_NAME);
        assert_eq!(ResourceKey::new("gw").kind, "Gateway");
    }
}
