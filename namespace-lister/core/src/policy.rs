use crate::{PolicyRule, Subject};
use std::{collections::BTreeMap, fmt};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Namespace {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// A namespaced set of rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Role {
    pub namespace: String,
    pub name: String,
    pub rules: Vec<PolicyRule>,
}

/// A cluster-wide set of rules.
///
/// When the role aggregates other ClusterRoles, `rules` already holds the aggregated rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterRole {
    pub name: String,
    pub rules: Vec<PolicyRule>,
}

/// Grants a role's rules to subjects within the binding's namespace, even when the role is a
/// ClusterRole.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleBinding {
    pub namespace: String,
    pub name: String,
    pub subjects: Vec<Subject>,
    pub role_ref: RoleRef,
}

/// Grants a ClusterRole's rules to subjects in every namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterRoleBinding {
    pub name: String,
    pub subjects: Vec<Subject>,
    pub role_ref: RoleRef,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoleRef {
    pub kind: RoleRefKind,
    pub name: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RoleRefKind {
    Role,
    ClusterRole,
}

// === impl Namespace ===

impl Namespace {
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            labels: BTreeMap::new(),
        }
    }
}

// === impl RoleRef ===

impl RoleRef {
    pub fn role(name: impl ToString) -> Self {
        Self {
            kind: RoleRefKind::Role,
            name: name.to_string(),
        }
    }

    pub fn cluster_role(name: impl ToString) -> Self {
        Self {
            kind: RoleRefKind::ClusterRole,
            name: name.to_string(),
        }
    }
}

impl fmt::Display for RoleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

// === impl RoleRefKind ===

impl std::str::FromStr for RoleRefKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "Role" => Ok(Self::Role),
            "ClusterRole" => Ok(Self::ClusterRole),
            kind => Err(anyhow::anyhow!("unsupported role reference kind: {kind}")),
        }
    }
}

impl fmt::Display for RoleRefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Role => f.write_str("Role"),
            Self::ClusterRole => f.write_str("ClusterRole"),
        }
    }
}
