use anyhow::{anyhow, bail, Result};
use namespace_lister_core::{
    Namespace, PolicyRule, RoleRef, RoleRefKind, Subject, SubjectKind, RBAC_API_GROUP,
};
use namespace_lister_k8s_api::{self as k8s, ResourceExt};

pub(crate) fn namespace(ns: k8s::Namespace) -> Namespace {
    Namespace {
        name: ns.name_unchecked(),
        labels: ns.metadata.labels.unwrap_or_default(),
    }
}

/// Converts rules, keeping only those that may grant `get` on namespaces.
pub(crate) fn namespace_rules(rules: Option<Vec<k8s::PolicyRule>>) -> Vec<PolicyRule> {
    rules
        .into_iter()
        .flatten()
        .map(rule)
        .filter(PolicyRule::may_grant_namespace_get)
        .collect()
}

fn rule(rule: k8s::PolicyRule) -> PolicyRule {
    PolicyRule {
        api_groups: rule.api_groups.into_iter().flatten().collect(),
        resources: rule.resources.into_iter().flatten().collect(),
        verbs: rule.verbs.into_iter().collect(),
        resource_names: rule.resource_names.into_iter().flatten().collect(),
    }
}

pub(crate) fn role_ref(role_ref: k8s::RoleRef) -> Result<RoleRef> {
    if role_ref.api_group != RBAC_API_GROUP {
        bail!("unsupported roleRef apiGroup: {}", role_ref.api_group);
    }
    Ok(RoleRef {
        kind: role_ref.kind.parse::<RoleRefKind>()?,
        name: role_ref.name,
    })
}

/// Converts binding subjects.
///
/// A ServiceAccount without a namespace refers to the binding's namespace, if it has one. User and
/// Group subjects without an API group are in the RBAC API group.
pub(crate) fn subjects(
    binding_ns: Option<&str>,
    subjects: Option<Vec<k8s::Subject>>,
) -> Result<Vec<Subject>> {
    subjects
        .into_iter()
        .flatten()
        .map(|s| subject(binding_ns, s))
        .collect()
}

fn subject(binding_ns: Option<&str>, subject: k8s::Subject) -> Result<Subject> {
    let kind = subject.kind.parse::<SubjectKind>()?;
    let api_group = subject.api_group.filter(|g| !g.is_empty());
    match kind {
        SubjectKind::ServiceAccount => {
            let namespace = subject
                .namespace
                .filter(|ns| !ns.is_empty())
                .or_else(|| binding_ns.map(Into::into))
                .ok_or_else(|| anyhow!("ServiceAccount {} has no namespace", subject.name))?;
            Ok(Subject {
                kind,
                name: subject.name,
                namespace: Some(namespace),
                api_group: api_group.unwrap_or_default(),
            })
        }
        SubjectKind::User | SubjectKind::Group => Ok(Subject {
            kind,
            name: subject.name,
            namespace: None,
            api_group: api_group.unwrap_or_else(|| RBAC_API_GROUP.to_string()),
        }),
    }
}
