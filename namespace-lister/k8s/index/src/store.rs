use crate::SharedIndex;
use namespace_lister_core::{
    ClusterRole, ClusterRoleBinding, Namespace, PolicyStore, Role, RoleBinding, StoreError,
};
use std::sync::Arc;

/// Serves [`PolicyStore`] reads from the shared index.
///
/// Each read takes the index lock briefly, so a rebuild may observe watch updates that land
/// between its reads.
#[derive(Clone, Debug)]
pub struct Store(SharedIndex);

impl Store {
    pub fn new(index: SharedIndex) -> Self {
        Self(index)
    }
}

impl PolicyStore for Store {
    fn get_role(&self, namespace: &str, name: &str) -> Result<Arc<Role>, StoreError> {
        self.0
            .read()
            .role(namespace, name)
            .cloned()
            .ok_or_else(|| StoreError::role_not_found(namespace, name))
    }

    fn get_cluster_role(&self, name: &str) -> Result<Arc<ClusterRole>, StoreError> {
        self.0
            .read()
            .cluster_role(name)
            .cloned()
            .ok_or_else(|| StoreError::cluster_role_not_found(name))
    }

    fn list_role_bindings(&self, namespace: &str) -> Result<Vec<Arc<RoleBinding>>, StoreError> {
        Ok(self.0.read().role_bindings(namespace).cloned().collect())
    }

    fn list_cluster_role_bindings(&self) -> Result<Vec<Arc<ClusterRoleBinding>>, StoreError> {
        Ok(self.0.read().cluster_role_bindings().cloned().collect())
    }

    fn list_namespaces(&self) -> Result<Vec<Arc<Namespace>>, StoreError> {
        Ok(self.0.read().namespaces().cloned().collect())
    }
}
