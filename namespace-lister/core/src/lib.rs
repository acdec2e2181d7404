//! Namespace Lister core
//!
//! Answers "which namespaces may this subject `get`?" from a precomputed, subject-indexed cache
//! rather than evaluating RBAC policy on every request.
//!
//! ```text
//! [ PolicyStore ] -> [ PolicyEvaluator ] -> [ Synchronizer ] -> [ AccessCache ] <- [ NamespaceLister ]
//! ```
//!
//! The [`Synchronizer`] rebuilds the whole [`AccessIndex`] from a [`PolicyStore`] snapshot, either
//! periodically or when a change is signaled through [`Synchronizer::request`]. Each rebuild
//! evaluates every namespace with the [`PolicyEvaluator`] and publishes the resulting reverse index
//! into the [`AccessCache`] in a single pointer swap. Readers never observe a partially built index
//! and never wait on a rebuild.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod access;
pub mod evaluator;
pub mod lister;
pub mod metrics;
pub mod policy;
pub mod rule;
pub mod store;
pub mod subject;
pub mod sync;

#[cfg(test)]
mod tests;

pub use self::{
    access::{AccessCache, AccessIndex},
    evaluator::{AllowedSubjects, PolicyEvaluator, ResolveError},
    lister::{ListNamespaces, NamespaceLister},
    metrics::SyncMetrics,
    policy::{ClusterRole, ClusterRoleBinding, Namespace, Role, RoleBinding, RoleRef, RoleRefKind},
    rule::{PolicyRule, ResourceRequest, ValueMatch},
    store::{PolicyStore, StoreError},
    subject::{Subject, SubjectKind},
    sync::{SyncConfig, SyncError, SyncRequester, SyncStats, Synchronizer},
};

/// The API group of the RBAC resources. User and Group subjects belong to it.
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
