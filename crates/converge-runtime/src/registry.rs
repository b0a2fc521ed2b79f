//! Explicit registry of the resource types a manager may watch.

use std::collections::BTreeSet;

use kube::core::GroupVersionKind;
use kube::Resource;

use crate::error::Error;

/// Resource types known to this process, passed into the manager at
/// construction.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    kinds: BTreeSet<(String, String, String)>,
}

fn gvk_of<K: Resource<DynamicType = ()>>() -> GroupVersionKind {
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

fn display(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `K`. Registering twice is harmless.
    pub fn register<K: Resource<DynamicType = ()>>(&mut self) -> &mut Self {
        let gvk = gvk_of::<K>();
        self.kinds.insert((gvk.group, gvk.version, gvk.kind));
        self
    }

    pub fn contains(&self, gvk: &GroupVersionKind) -> bool {
        self.kinds
            .contains(&(gvk.group.clone(), gvk.version.clone(), gvk.kind.clone()))
    }

    pub fn is_registered<K: Resource<DynamicType = ()>>(&self) -> bool {
        self.contains(&gvk_of::<K>())
    }

    /// Fails with [`Error::UnregisteredType`] unless `K` was registered.
    pub fn ensure_registered<K: Resource<DynamicType = ()>>(&self) -> Result<GroupVersionKind, Error> {
        let gvk = gvk_of::<K>();
        if self.contains(&gvk) {
            Ok(gvk)
        } else {
            Err(Error::UnregisteredType(display(&gvk)))
        }
    }

    /// Registered kinds as `group/version/kind` strings.
    pub fn kinds(&self) -> Vec<String> {
        self.kinds
            .iter()
            .map(|(group, version, kind)| display(&GroupVersionKind::gvk(group, version, kind)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::coordination::v1::Lease;
    use k8s_openapi::api::core::v1::ConfigMap;

    #[test]
    fn registered_types_are_found() {
        let mut registry = TypeRegistry::new();
        registry.register::<ConfigMap>().register::<Lease>();

        assert!(registry.is_registered::<ConfigMap>());
        let gvk = registry.ensure_registered::<Lease>().unwrap();
        assert_eq!(gvk.group, "coordination.k8s.io");
        assert_eq!(gvk.kind, "Lease");
        assert_eq!(
            registry.kinds(),
            vec!["v1/ConfigMap".to_string(), "coordination.k8s.io/v1/Lease".to_string()]
        );
    }

    #[test]
    fn unregistered_type_is_rejected() {
        let registry = TypeRegistry::new();
        let err = registry.ensure_registered::<ConfigMap>().unwrap_err();
        assert_eq!(err.to_string(), "resource type v1/ConfigMap is not registered");
    }
}
