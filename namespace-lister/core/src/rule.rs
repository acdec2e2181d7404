use std::collections::BTreeSet;

/// The value that matches any API group, resource or verb.
pub const WILDCARD: &str = "*";

/// Matches either any value or one of an explicit set of values.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ValueMatch {
    Any,
    Values(BTreeSet<String>),
    /// Matches nothing. An empty list in a rule grants nothing.
    #[default]
    None,
}

/// Describes actions permitted by a Role or ClusterRole.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyRule {
    pub api_groups: ValueMatch,
    pub resources: ValueMatch,
    pub verbs: ValueMatch,

    /// Restricts the rule to the named resources. Empty means any name.
    pub resource_names: BTreeSet<String>,
}

/// A resource request evaluated against policy rules.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResourceRequest<'a> {
    pub verb: &'a str,
    pub api_group: &'a str,
    pub resource: &'a str,
    pub name: &'a str,
}

// === impl ValueMatch ===

impl ValueMatch {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Values(values) => values.contains(value),
            Self::None => false,
        }
    }
}

impl<S: Into<String>> FromIterator<S> for ValueMatch {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let values = iter.into_iter().map(Into::into).collect::<BTreeSet<String>>();
        if values.contains(WILDCARD) {
            Self::Any
        } else if values.is_empty() {
            Self::None
        } else {
            Self::Values(values)
        }
    }
}

// === impl PolicyRule ===

impl PolicyRule {
    /// Returns true if this rule permits the request.
    pub fn allows(&self, req: &ResourceRequest<'_>) -> bool {
        self.allows_unnamed(req)
            && (self.resource_names.is_empty() || self.resource_names.contains(req.name))
    }

    /// Returns true if this rule may grant `get` on some namespace, whatever its name.
    ///
    /// Rules that fail this check can never contribute to the access index.
    pub fn may_grant_namespace_get(&self) -> bool {
        self.allows_unnamed(&ResourceRequest::get_namespace(""))
    }

    fn allows_unnamed(&self, req: &ResourceRequest<'_>) -> bool {
        self.verbs.matches(req.verb)
            && self.api_groups.matches(req.api_group)
            && self.resources.matches(req.resource)
    }
}

/// Returns true if any of the rules permits the request.
pub fn rules_allow<'r>(
    rules: impl IntoIterator<Item = &'r PolicyRule>,
    req: &ResourceRequest<'_>,
) -> bool {
    rules.into_iter().any(|rule| rule.allows(req))
}

// === impl ResourceRequest ===

impl<'a> ResourceRequest<'a> {
    /// A `get` of the named namespace in the core API group.
    pub fn get_namespace(name: &'a str) -> Self {
        Self {
            verb: "get",
            api_group: "",
            resource: "namespaces",
            name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule<'a>(
        api_groups: impl IntoIterator<Item = &'a str>,
        resources: impl IntoIterator<Item = &'a str>,
        verbs: impl IntoIterator<Item = &'a str>,
        names: impl IntoIterator<Item = &'a str>,
    ) -> PolicyRule {
        PolicyRule {
            api_groups: api_groups.into_iter().collect(),
            resources: resources.into_iter().collect(),
            verbs: verbs.into_iter().collect(),
            resource_names: names.into_iter().map(Into::into).collect(),
        }
    }

    #[test]
    fn test_allows() {
        let req = ResourceRequest::get_namespace("myns-1");
        for (rule, allows, msg) in [
            (rule([""], ["namespaces"], ["get"], []), true, "exact match"),
            (rule(["*"], ["*"], ["*"], []), true, "wildcards"),
            (
                rule([""], ["namespaces"], ["get", "list", "watch"], []),
                true,
                "one of many verbs",
            ),
            (
                rule([""], ["namespaces"], ["get"], ["myns-1"]),
                true,
                "named resource",
            ),
            (
                rule([""], ["namespaces"], ["get"], ["myns-2"]),
                false,
                "other named resource",
            ),
            (rule([""], ["namespaces"], ["list"], []), false, "other verb"),
            (rule(["apps"], ["namespaces"], ["get"], []), false, "other group"),
            (rule([""], ["pods"], ["get"], []), false, "other resource"),
            (
                rule([""], ["namespaces/status"], ["get"], []),
                false,
                "subresource",
            ),
            (rule([""], ["*/status"], ["get"], []), false, "any subresource"),
            (rule([""], ["namespaces"], [], []), false, "no verbs"),
            (rule([], ["namespaces"], ["get"], []), false, "no groups"),
        ] {
            assert_eq!(rule.allows(&req), allows, "{msg}");
        }
    }

    #[test]
    fn namespace_get_ignores_resource_names() {
        assert!(rule([""], ["namespaces"], ["get"], ["myns-1"]).may_grant_namespace_get());
        assert!(rule(["*"], ["namespaces"], ["*"], []).may_grant_namespace_get());
        assert!(!rule([""], ["secrets"], ["get"], []).may_grant_namespace_get());
    }

    #[test]
    fn wildcard_absorbs_values() {
        assert_eq!(
            ["get", "*"].into_iter().collect::<ValueMatch>(),
            ValueMatch::Any
        );
        assert_eq!(
            std::iter::empty::<&str>().collect::<ValueMatch>(),
            ValueMatch::None
        );
    }
}
