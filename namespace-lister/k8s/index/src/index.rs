use crate::{
    convert,
    metrics::{IndexMetrics, Op},
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use kubert::index::{
    ClusterRemoved, IndexClusterResource, IndexNamespacedResource, NamespacedRemoved,
};
use namespace_lister_core::{
    ClusterRole, ClusterRoleBinding, Namespace, PolicyRule, Role, RoleBinding, SyncRequester,
};
use namespace_lister_k8s_api::{self as k8s, labels, ResourceExt, Selector};
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds the trimmed RBAC objects and namespaces observed by the watches.
#[derive(Debug)]
pub struct Index {
    namespaces: BTreeMap<String, Arc<Namespace>>,
    roles: HashMap<String, HashMap<String, Arc<Role>>>,
    role_bindings: HashMap<String, BTreeMap<String, Arc<RoleBinding>>>,
    cluster_roles: HashMap<String, ClusterRoleEntry>,
    cluster_role_bindings: BTreeMap<String, Arc<ClusterRoleBinding>>,

    changes: Option<SyncRequester>,
    metrics: IndexMetrics,

    /// The kinds whose watches have delivered their initial state.
    initial_resets: HashSet<&'static str>,
    ready: watch::Sender<bool>,
}

#[derive(Debug)]
struct ClusterRoleEntry {
    labels: labels::Map,
    rules: Vec<PolicyRule>,

    /// Set when the role aggregates the rules of other ClusterRoles.
    aggregation: Option<Vec<Selector>>,

    /// The role's rules together with any aggregated rules.
    effective: Arc<ClusterRole>,
}

const NAMESPACE: &str = "Namespace";
const ROLE: &str = "Role";
const ROLE_BINDING: &str = "RoleBinding";
const CLUSTER_ROLE: &str = "ClusterRole";
const CLUSTER_ROLE_BINDING: &str = "ClusterRoleBinding";

const KINDS: [&str; 5] = [NAMESPACE, ROLE, ROLE_BINDING, CLUSTER_ROLE, CLUSTER_ROLE_BINDING];

// === impl Index ===

impl Index {
    pub fn new(metrics: IndexMetrics) -> Self {
        Self {
            namespaces: BTreeMap::new(),
            roles: HashMap::default(),
            role_bindings: HashMap::default(),
            cluster_roles: HashMap::default(),
            cluster_role_bindings: BTreeMap::new(),
            changes: None,
            metrics,
            initial_resets: HashSet::default(),
            ready: watch::channel(false).0,
        }
    }

    pub fn shared(metrics: IndexMetrics) -> SharedIndex {
        Arc::new(RwLock::new(Self::new(metrics)))
    }

    /// Requests an access cache sync whenever the index changes.
    ///
    /// No sync is requested until every watch has delivered its initial state.
    pub fn set_requester(&mut self, requester: SyncRequester) {
        self.changes = Some(requester);
    }

    /// Becomes true once every watched kind has been reset with its initial state.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Namespaces, ordered by name.
    pub(crate) fn namespaces(&self) -> impl Iterator<Item = &Arc<Namespace>> + '_ {
        self.namespaces.values()
    }

    pub(crate) fn role(&self, namespace: &str, name: &str) -> Option<&Arc<Role>> {
        self.roles.get(namespace)?.get(name)
    }

    pub(crate) fn cluster_role(&self, name: &str) -> Option<&Arc<ClusterRole>> {
        self.cluster_roles.get(name).map(|entry| &entry.effective)
    }

    pub(crate) fn role_bindings(
        &self,
        namespace: &str,
    ) -> impl Iterator<Item = &Arc<RoleBinding>> + '_ {
        self.role_bindings
            .get(namespace)
            .into_iter()
            .flat_map(BTreeMap::values)
    }

    pub(crate) fn cluster_role_bindings(
        &self,
    ) -> impl Iterator<Item = &Arc<ClusterRoleBinding>> + '_ {
        self.cluster_role_bindings.values()
    }

    fn changed(&self, kind: &'static str, op: Op, size: usize) {
        self.metrics.update(kind, op, size);
        if !self.is_ready() {
            trace!(kind, ?op, "Awaiting the initial state of all watches");
            return;
        }
        if let Some(changes) = self.changes.as_ref() {
            let queued = changes.request();
            trace!(kind, ?op, queued, "Requested access cache sync");
        }
    }

    fn reset_observed(&mut self, kind: &'static str) {
        let first = self.initial_resets.insert(kind);
        if first && KINDS.iter().all(|k| self.initial_resets.contains(k)) {
            info!("Indexed the initial state of all watched resources");
            self.ready.send_replace(true);
        }
    }

    // === Namespaces ===

    fn apply_namespace(&mut self, ns: k8s::Namespace) {
        let ns = convert::namespace(ns);
        trace!(name = %ns.name, "Indexing Namespace");
        self.namespaces.insert(ns.name.clone(), Arc::new(ns));
    }

    // === Roles ===

    fn apply_role(&mut self, role: k8s::Role) {
        let Some(namespace) = role.namespace() else {
            warn!(name = %role.name_any(), "Role has no namespace");
            return;
        };
        let name = role.name_unchecked();

        // Roles without namespace rules are retained so that bindings to them resolve.
        let rules = convert::namespace_rules(role.rules);
        debug!(%namespace, %name, rules = rules.len(), "Indexing Role");
        self.roles.entry(namespace.clone()).or_default().insert(
            name.clone(),
            Arc::new(Role {
                namespace,
                name,
                rules,
            }),
        );
    }

    fn delete_role(&mut self, namespace: &str, name: &str) {
        if let Some(roles) = self.roles.get_mut(namespace) {
            roles.remove(name);
            if roles.is_empty() {
                self.roles.remove(namespace);
            }
        }
    }

    fn roles_len(&self) -> usize {
        self.roles.values().map(|r| r.len()).sum()
    }

    // === RoleBindings ===

    fn apply_role_binding(&mut self, rb: k8s::RoleBinding) {
        let Some(namespace) = rb.namespace() else {
            warn!(name = %rb.name_any(), "RoleBinding has no namespace");
            return;
        };
        let name = rb.name_unchecked();

        let binding = convert::role_ref(rb.role_ref).and_then(|role_ref| {
            let subjects = convert::subjects(Some(&namespace), rb.subjects)?;
            Ok(RoleBinding {
                namespace: namespace.clone(),
                name: name.clone(),
                subjects,
                role_ref,
            })
        });
        match binding {
            Ok(binding) => {
                debug!(%namespace, %name, role = %binding.role_ref, "Indexing RoleBinding");
                self.role_bindings
                    .entry(namespace)
                    .or_default()
                    .insert(name, Arc::new(binding));
            }
            Err(error) => {
                warn!(%namespace, %name, %error, "Ignoring invalid RoleBinding");
                self.delete_role_binding(&namespace, &name);
            }
        }
    }

    fn delete_role_binding(&mut self, namespace: &str, name: &str) {
        if let Some(bindings) = self.role_bindings.get_mut(namespace) {
            bindings.remove(name);
            if bindings.is_empty() {
                self.role_bindings.remove(namespace);
            }
        }
    }

    fn role_bindings_len(&self) -> usize {
        self.role_bindings.values().map(BTreeMap::len).sum()
    }

    // === ClusterRoles ===

    /// Indexes a ClusterRole without updating aggregated roles.
    fn insert_cluster_role(&mut self, cr: k8s::ClusterRole) {
        let name = cr.name_unchecked();
        let aggregation = cr.aggregation_rule.map(|rule| {
            rule.cluster_role_selectors
                .into_iter()
                .flatten()
                .filter_map(|selector| match Selector::try_from(selector) {
                    Ok(selector) => Some(selector),
                    Err(error) => {
                        warn!(%name, %error, "Ignoring invalid aggregation selector");
                        None
                    }
                })
                .collect::<Vec<_>>()
        });
        let rules = convert::namespace_rules(cr.rules);
        debug!(
            %name,
            rules = rules.len(),
            aggregated = aggregation.is_some(),
            "Indexing ClusterRole"
        );

        self.cluster_roles.insert(
            name.clone(),
            ClusterRoleEntry {
                labels: cr.metadata.labels.unwrap_or_default(),
                effective: Arc::new(ClusterRole {
                    name,
                    rules: rules.clone(),
                }),
                rules,
                aggregation,
            },
        );
    }

    /// Recomputes the effective rules of every aggregating ClusterRole.
    ///
    /// Aggregation is not transitive: only the selected roles' own rules are included.
    fn aggregate_cluster_roles(&mut self) {
        let aggregated = self
            .cluster_roles
            .iter()
            .filter_map(|(name, entry)| {
                let selectors = entry.aggregation.as_ref()?;
                let mut rules = entry.rules.clone();
                for (other_name, other) in &self.cluster_roles {
                    if other_name != name && selectors.iter().any(|s| s.matches(&other.labels)) {
                        rules.extend(other.rules.iter().cloned());
                    }
                }
                Some((name.clone(), rules))
            })
            .collect::<Vec<_>>();

        for (name, rules) in aggregated {
            if let Some(entry) = self.cluster_roles.get_mut(&name) {
                if entry.effective.rules != rules {
                    trace!(%name, rules = rules.len(), "Aggregated ClusterRole");
                    entry.effective = Arc::new(ClusterRole { name, rules });
                }
            }
        }
    }

    // === ClusterRoleBindings ===

    fn apply_cluster_role_binding(&mut self, crb: k8s::ClusterRoleBinding) {
        let name = crb.name_unchecked();
        let binding = convert::role_ref(crb.role_ref).and_then(|role_ref| {
            Ok(ClusterRoleBinding {
                name: name.clone(),
                subjects: convert::subjects(None, crb.subjects)?,
                role_ref,
            })
        });
        match binding {
            Ok(binding) => {
                debug!(%name, role = %binding.role_ref, "Indexing ClusterRoleBinding");
                self.cluster_role_bindings.insert(name, Arc::new(binding));
            }
            Err(error) => {
                warn!(%name, %error, "Ignoring invalid ClusterRoleBinding");
                self.cluster_role_bindings.remove(&name);
            }
        }
    }
}

impl IndexClusterResource<k8s::Namespace> for Index {
    fn apply(&mut self, ns: k8s::Namespace) {
        self.apply_namespace(ns);
        self.changed(NAMESPACE, Op::Apply, self.namespaces.len());
    }

    fn delete(&mut self, name: String) {
        self.namespaces.remove(&name);
        self.changed(NAMESPACE, Op::Delete, self.namespaces.len());
    }

    fn reset(&mut self, namespaces: Vec<k8s::Namespace>, removed: ClusterRemoved) {
        self.reset_observed(NAMESPACE);
        for ns in namespaces {
            self.apply_namespace(ns);
        }
        for name in removed {
            self.namespaces.remove(&name);
        }
        self.changed(NAMESPACE, Op::Reset, self.namespaces.len());
    }
}

impl IndexNamespacedResource<k8s::Role> for Index {
    fn apply(&mut self, role: k8s::Role) {
        self.apply_role(role);
        self.changed(ROLE, Op::Apply, self.roles_len());
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_role(&namespace, &name);
        self.changed(ROLE, Op::Delete, self.roles_len());
    }

    fn reset(&mut self, roles: Vec<k8s::Role>, removed: NamespacedRemoved) {
        self.reset_observed(ROLE);
        for role in roles {
            self.apply_role(role);
        }
        for (namespace, names) in removed {
            for name in names {
                self.delete_role(&namespace, &name);
            }
        }
        self.changed(ROLE, Op::Reset, self.roles_len());
    }
}

impl IndexNamespacedResource<k8s::RoleBinding> for Index {
    fn apply(&mut self, rb: k8s::RoleBinding) {
        self.apply_role_binding(rb);
        self.changed(ROLE_BINDING, Op::Apply, self.role_bindings_len());
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_role_binding(&namespace, &name);
        self.changed(ROLE_BINDING, Op::Delete, self.role_bindings_len());
    }

    fn reset(&mut self, bindings: Vec<k8s::RoleBinding>, removed: NamespacedRemoved) {
        self.reset_observed(ROLE_BINDING);
        for rb in bindings {
            self.apply_role_binding(rb);
        }
        for (namespace, names) in removed {
            for name in names {
                self.delete_role_binding(&namespace, &name);
            }
        }
        self.changed(ROLE_BINDING, Op::Reset, self.role_bindings_len());
    }
}

impl IndexClusterResource<k8s::ClusterRole> for Index {
    fn apply(&mut self, cr: k8s::ClusterRole) {
        self.insert_cluster_role(cr);
        self.aggregate_cluster_roles();
        self.changed(CLUSTER_ROLE, Op::Apply, self.cluster_roles.len());
    }

    fn delete(&mut self, name: String) {
        self.cluster_roles.remove(&name);
        self.aggregate_cluster_roles();
        self.changed(CLUSTER_ROLE, Op::Delete, self.cluster_roles.len());
    }

    fn reset(&mut self, roles: Vec<k8s::ClusterRole>, removed: ClusterRemoved) {
        self.reset_observed(CLUSTER_ROLE);
        for cr in roles {
            self.insert_cluster_role(cr);
        }
        for name in removed {
            self.cluster_roles.remove(&name);
        }
        self.aggregate_cluster_roles();
        self.changed(CLUSTER_ROLE, Op::Reset, self.cluster_roles.len());
    }
}

impl IndexClusterResource<k8s::ClusterRoleBinding> for Index {
    fn apply(&mut self, crb: k8s::ClusterRoleBinding) {
        self.apply_cluster_role_binding(crb);
        self.changed(
            CLUSTER_ROLE_BINDING,
            Op::Apply,
            self.cluster_role_bindings.len(),
        );
    }

    fn delete(&mut self, name: String) {
        self.cluster_role_bindings.remove(&name);
        self.changed(
            CLUSTER_ROLE_BINDING,
            Op::Delete,
            self.cluster_role_bindings.len(),
        );
    }

    fn reset(&mut self, bindings: Vec<k8s::ClusterRoleBinding>, removed: ClusterRemoved) {
        self.reset_observed(CLUSTER_ROLE_BINDING);
        for crb in bindings {
            self.apply_cluster_role_binding(crb);
        }
        for name in removed {
            self.cluster_role_bindings.remove(&name);
        }
        self.changed(
            CLUSTER_ROLE_BINDING,
            Op::Reset,
            self.cluster_role_bindings.len(),
        );
    }
}
