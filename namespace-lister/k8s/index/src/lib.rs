//! Namespace Lister Kubernetes index
//!
//! Mirrors the cluster's Namespaces and RBAC objects from kubert watches so that the access cache
//! can be rebuilt without querying the API server. Objects are trimmed as they are indexed: only
//! the rules that may grant `get` on namespaces are retained.
//!
//! ```text
//! [ Namespace ]
//! [ Role ] <- [ RoleBinding ]
//! [ ClusterRole ] <- [ ClusterRoleBinding ]
//!       ^- aggregated by label from other [ ClusterRole ]s
//! ```
//!
//! Once every watch has delivered its initial state, each update to the index signals the access
//! cache's synchronizer. The synchronizer always rebuilds from a full [`Store`] snapshot, so the
//! signal carries no details of the change.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod convert;
mod index;
pub mod metrics;
mod startup;
mod store;


pub use self::{
    index::{Index, SharedIndex},
    metrics::IndexMetrics,
    startup::synchronize_when_ready,
    store::Store,
};
