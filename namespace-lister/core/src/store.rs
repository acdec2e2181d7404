use crate::{ClusterRole, ClusterRoleBinding, Namespace, Role, RoleBinding};
use std::sync::Arc;
use thiserror::Error;

/// Read access to the RBAC objects that determine namespace access.
///
/// Implementations are typically backed by an eventually-consistent mirror of the cluster, so a
/// binding may reference a role that the store has not observed (yet). Every method may fail
/// independently of the others.
pub trait PolicyStore {
    fn get_role(&self, namespace: &str, name: &str) -> Result<Arc<Role>, StoreError>;

    fn get_cluster_role(&self, name: &str) -> Result<Arc<ClusterRole>, StoreError>;

    fn list_role_bindings(&self, namespace: &str) -> Result<Vec<Arc<RoleBinding>>, StoreError>;

    fn list_cluster_role_bindings(&self) -> Result<Vec<Arc<ClusterRoleBinding>>, StoreError>;

    fn list_namespaces(&self) -> Result<Vec<Arc<Namespace>>, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// === impl StoreError ===

impl StoreError {
    pub fn role_not_found(namespace: &str, name: &str) -> Self {
        Self::NotFound {
            kind: "Role",
            name: format!("{namespace}/{name}"),
        }
    }

    pub fn cluster_role_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: "ClusterRole",
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl<S: PolicyStore + ?Sized> PolicyStore for Arc<S> {
    #[inline]
    fn get_role(&self, namespace: &str, name: &str) -> Result<Arc<Role>, StoreError> {
        (**self).get_role(namespace, name)
    }

    #[inline]
    fn get_cluster_role(&self, name: &str) -> Result<Arc<ClusterRole>, StoreError> {
        (**self).get_cluster_role(name)
    }

    #[inline]
    fn list_role_bindings(&self, namespace: &str) -> Result<Vec<Arc<RoleBinding>>, StoreError> {
        (**self).list_role_bindings(namespace)
    }

    #[inline]
    fn list_cluster_role_bindings(&self) -> Result<Vec<Arc<ClusterRoleBinding>>, StoreError> {
        (**self).list_cluster_role_bindings()
    }

    #[inline]
    fn list_namespaces(&self) -> Result<Vec<Arc<Namespace>>, StoreError> {
        (**self).list_namespaces()
    }
}
