use crate::{
    rule::rules_allow, PolicyStore, ResourceRequest, RoleRef, RoleRefKind, StoreError, Subject,
};
use ahash::AHashSet as HashSet;
use thiserror::Error;
use tracing::{debug, trace};

/// Computes the subjects that may `get` a namespace.
#[derive(Clone, Debug)]
pub struct PolicyEvaluator<S> {
    store: S,
}

/// The outcome of evaluating a single namespace.
///
/// Bindings that could not be resolved are skipped and reported in `errors`; they never prevent the
/// remaining bindings from granting access.
#[derive(Debug, Default)]
pub struct AllowedSubjects {
    /// Distinct subjects, in the order they were first granted access.
    pub subjects: Vec<Subject>,
    pub errors: Vec<ResolveError>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to list clusterrolebindings: {0}")]
    ListClusterRoleBindings(#[source] StoreError),

    #[error("failed to list rolebindings in {namespace}: {source}")]
    ListRoleBindings {
        namespace: String,
        #[source]
        source: StoreError,
    },

    #[error("clusterrolebinding {binding}: {source}")]
    ClusterRoleBinding {
        binding: String,
        #[source]
        source: StoreError,
    },

    #[error("rolebinding {namespace}/{binding}: {source}")]
    RoleBinding {
        namespace: String,
        binding: String,
        #[source]
        source: StoreError,
    },

    #[error("clusterrolebinding {binding} may only reference a ClusterRole, not {role_ref}")]
    InvalidRoleRef { binding: String, role_ref: RoleRef },
}

// === impl PolicyEvaluator ===

impl<S: PolicyStore> PolicyEvaluator<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the subjects granted `get` on the named namespace.
    ///
    /// ClusterRoleBindings grant access to every namespace their rules allow; RoleBindings only
    /// grant access to the namespace they live in.
    pub fn allowed_subjects(&self, namespace: &str) -> AllowedSubjects {
        let req = ResourceRequest::get_namespace(namespace);
        let mut allowed = Allowed::default();

        match self.store.list_cluster_role_bindings() {
            Ok(bindings) => {
                for crb in bindings {
                    if crb.role_ref.kind != RoleRefKind::ClusterRole {
                        allowed.error(ResolveError::InvalidRoleRef {
                            binding: crb.name.clone(),
                            role_ref: crb.role_ref.clone(),
                        });
                        continue;
                    }

                    match self.role_ref_allows(None, &crb.role_ref, &req) {
                        Ok(true) => {
                            trace!(binding = %crb.name, "ClusterRoleBinding grants access");
                            allowed.extend(&crb.subjects);
                        }
                        Ok(false) => {}
                        Err(source) => allowed.error(ResolveError::ClusterRoleBinding {
                            binding: crb.name.clone(),
                            source,
                        }),
                    }
                }
            }
            Err(error) => allowed.error(ResolveError::ListClusterRoleBindings(error)),
        }

        if namespace.is_empty() {
            return allowed.into_subjects();
        }

        match self.store.list_role_bindings(namespace) {
            Ok(bindings) => {
                for rb in bindings {
                    match self.role_ref_allows(Some(namespace), &rb.role_ref, &req) {
                        Ok(true) => {
                            trace!(binding = %rb.name, "RoleBinding grants access");
                            allowed.extend(&rb.subjects);
                        }
                        Ok(false) => {}
                        Err(source) => allowed.error(ResolveError::RoleBinding {
                            namespace: namespace.to_string(),
                            binding: rb.name.clone(),
                            source,
                        }),
                    }
                }
            }
            Err(source) => allowed.error(ResolveError::ListRoleBindings {
                namespace: namespace.to_string(),
                source,
            }),
        }

        allowed.into_subjects()
    }

    fn role_ref_allows(
        &self,
        namespace: Option<&str>,
        role_ref: &RoleRef,
        req: &ResourceRequest<'_>,
    ) -> Result<bool, StoreError> {
        match (role_ref.kind, namespace) {
            (RoleRefKind::Role, Some(ns)) => {
                let role = self.store.get_role(ns, &role_ref.name)?;
                Ok(rules_allow(&role.rules, req))
            }
            (RoleRefKind::Role, None) => Err(StoreError::role_not_found("", &role_ref.name)),
            (RoleRefKind::ClusterRole, _) => {
                let role = self.store.get_cluster_role(&role_ref.name)?;
                Ok(rules_allow(&role.rules, req))
            }
        }
    }
}

#[derive(Default)]
struct Allowed {
    seen: HashSet<Subject>,
    out: AllowedSubjects,
}

impl Allowed {
    fn extend<'s>(&mut self, subjects: impl IntoIterator<Item = &'s Subject>) {
        for subject in subjects {
            if self.seen.insert(subject.clone()) {
                self.out.subjects.push(subject.clone());
            }
        }
    }

    fn error(&mut self, error: ResolveError) {
        // Dangling references are expected while the mirror catches up with the cluster.
        debug!(%error, "Skipping binding");
        self.out.errors.push(error);
    }

    fn into_subjects(self) -> AllowedSubjects {
        self.out
    }
}
