use crate::RBAC_API_GROUP;
use std::fmt;

/// Prefix of the usernames the API server assigns to service accounts.
pub const SERVICE_ACCOUNT_USERNAME_PREFIX: &str = "system:serviceaccount:";

/// An identity that may be granted access by a binding.
///
/// Subjects are compared structurally and used as index keys: two subjects refer to the same
/// index entry only when every field matches.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subject {
    pub kind: SubjectKind,
    pub name: String,

    /// Only set for service accounts.
    pub namespace: Option<String>,

    pub api_group: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubjectKind {
    User,
    Group,
    ServiceAccount,
}

// === impl Subject ===

impl Subject {
    pub fn user(name: impl ToString) -> Self {
        Self {
            kind: SubjectKind::User,
            name: name.to_string(),
            namespace: None,
            api_group: RBAC_API_GROUP.to_string(),
        }
    }

    pub fn group(name: impl ToString) -> Self {
        Self {
            kind: SubjectKind::Group,
            name: name.to_string(),
            namespace: None,
            api_group: RBAC_API_GROUP.to_string(),
        }
    }

    pub fn service_account(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            kind: SubjectKind::ServiceAccount,
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
            api_group: String::new(),
        }
    }

    /// Maps an authenticated username to the subject bindings refer to it by.
    ///
    /// Usernames of the form `system:serviceaccount:<namespace>:<name>` identify service accounts.
    /// Every other username, including malformed service account usernames, is a user.
    pub fn from_username(username: &str) -> Self {
        if let Some(rest) = username.strip_prefix(SERVICE_ACCOUNT_USERNAME_PREFIX) {
            if let Some((ns, name)) = rest.split_once(':') {
                if !ns.is_empty() && !name.is_empty() && !name.contains(':') {
                    return Self::service_account(ns, name);
                }
            }
        }

        Self::user(username)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}:{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}:{}", self.kind, self.name),
        }
    }
}

// === impl SubjectKind ===

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Group => "Group",
            Self::ServiceAccount => "ServiceAccount",
        }
    }
}

impl std::str::FromStr for SubjectKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "User" => Ok(Self::User),
            "Group" => Ok(Self::Group),
            "ServiceAccount" => Ok(Self::ServiceAccount),
            kind => Err(anyhow::anyhow!("unsupported subject kind: {kind}")),
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_account_usernames() {
        assert_eq!(
            Subject::from_username("system:serviceaccount:team-a:deployer"),
            Subject {
                kind: SubjectKind::ServiceAccount,
                name: "deployer".to_string(),
                namespace: Some("team-a".to_string()),
                api_group: String::new(),
            }
        );
    }

    #[test]
    fn parses_user_usernames() {
        assert_eq!(
            Subject::from_username("carol"),
            Subject {
                kind: SubjectKind::User,
                name: "carol".to_string(),
                namespace: None,
                api_group: "rbac.authorization.k8s.io".to_string(),
            }
        );
        assert_eq!(
            Subject::from_username("carol@example.com"),
            Subject::user("carol@example.com")
        );
    }

    #[test]
    fn malformed_service_accounts_are_users() {
        for username in [
            "system:serviceaccount:",
            "system:serviceaccount:team-a",
            "system:serviceaccount:team-a:",
            "system:serviceaccount::deployer",
            "system:serviceaccount:team-a:deployer:extra",
        ] {
            assert_eq!(
                Subject::from_username(username),
                Subject::user(username),
                "{username}"
            );
        }
    }

    #[test]
    fn kinds_round_trip_through_strings() {
        for kind in [
            SubjectKind::User,
            SubjectKind::Group,
            SubjectKind::ServiceAccount,
        ] {
            assert_eq!(kind.as_str().parse::<SubjectKind>().unwrap(), kind);
        }
        assert!("Robot".parse::<SubjectKind>().is_err());
    }
}
