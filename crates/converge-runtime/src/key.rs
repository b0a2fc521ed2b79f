//! Resource identity

use std::fmt;
use std::str::FromStr;

use kube::{Resource, ResourceExt};
use thiserror::Error;

/// Identity of a single resource instance: optional namespace plus name.
///
/// Keys are immutable once created and are the only thing passed between
/// the watcher, the work queue and the workers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    namespace: Option<String>,
    name: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("resource key is empty")]
    Empty,
    #[error("invalid resource key '{0}': expected 'name' or 'namespace/name'")]
    Malformed(String),
}

impl ResourceKey {
    /// Key for a namespaced object.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Derive the key from an object's metadata.
    pub fn from_resource<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ResourceKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(KeyError::Empty);
        }
        match s.split_once('/') {
            None => Ok(Self::cluster(s)),
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::namespaced(ns, name))
            }
            Some(_) => Err(KeyError::Malformed(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn display_includes_namespace() {
        assert_eq!(ResourceKey::namespaced("default", "web").to_string(), "default/web");
        assert_eq!(ResourceKey::cluster("node-1").to_string(), "node-1");
    }

    #[test]
    fn parse_round_trips_display_form() {
        let key: ResourceKey = "kube-system/coredns".parse().unwrap();
        assert_eq!(key.namespace(), Some("kube-system"));
        assert_eq!(key.name(), "coredns");

        let key: ResourceKey = "node-1".parse().unwrap();
        assert_eq!(key.namespace(), None);
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        assert_eq!("".parse::<ResourceKey>(), Err(KeyError::Empty));
        assert!("a/b/c".parse::<ResourceKey>().is_err());
        assert!("/name".parse::<ResourceKey>().is_err());
        assert!("ns/".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn from_resource_uses_metadata() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".to_string()),
                namespace: Some("apps".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            ResourceKey::from_resource(&cm),
            ResourceKey::namespaced("apps", "settings")
        );
    }
}
