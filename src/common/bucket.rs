use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, ObjectFieldSelector, SecretKeySelector};

/// Name-keyed container where the last insertion for a name wins.
///
/// Iteration is ordered by name, so two buckets holding the same entries always
/// render the same list regardless of insertion order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bucket<V> {
    entries: BTreeMap<String, V>,
}

pub type EnvBucket = Bucket<EnvVar>;
pub type AnnotationBucket = Bucket<String>;

impl<V> Bucket<V> {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: V) {
        self.entries.insert(name.into(), value);
    }

    /// Merges `other` into `self`, entries of `other` override entries with the same name.
    pub fn merge(&mut self, other: Bucket<V>) {
        self.entries.extend(other.entries);
    }

    pub fn get(&self, name: &str) -> Option<&V> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn into_map(self) -> BTreeMap<String, V> {
        self.entries
    }
}

impl<V> FromIterator<(String, V)> for Bucket<V> {
    fn from_iter<T: IntoIterator<Item = (String, V)>>(iter: T) -> Self {
        let mut bucket = Bucket::new();
        for (name, value) in iter {
            bucket.insert(name, value);
        }
        bucket
    }
}

impl Bucket<EnvVar> {
    pub fn from_env(env: &[EnvVar]) -> Self {
        env.iter().map(|e| (e.name.clone(), e.clone())).collect()
    }

    pub fn insert_value(&mut self, name: &str, value: impl Into<String>) {
        self.insert(name, EnvVar { name: name.to_owned(), value: Some(value.into()), value_from: None });
    }

    pub fn insert_secret_ref(&mut self, name: &str, secret_name: &str, key: &str) {
        self.insert(
            name,
            EnvVar {
                name: name.to_owned(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector { name: secret_name.to_owned(), key: key.to_owned(), optional: None }),
                    ..Default::default()
                }),
            },
        );
    }

    pub fn insert_field_ref(&mut self, name: &str, field_path: &str) {
        self.insert(
            name,
            EnvVar {
                name: name.to_owned(),
                value: None,
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector { api_version: Some("v1".to_owned()), field_path: field_path.to_owned() }),
                    ..Default::default()
                }),
            },
        );
    }

    pub fn value_of(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|e| e.value.as_deref())
    }

    pub fn into_env(self) -> Vec<EnvVar> {
        self.entries.into_values().collect()
    }
}
