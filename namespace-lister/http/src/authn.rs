use ahash::AHashMap;
use http::{header, HeaderMap, HeaderName};
use namespace_lister_k8s_api as k8s;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;

/// Resolves the identity that made a request.
#[async_trait::async_trait]
pub trait Authenticate {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<String, AuthnError>;
}

#[derive(Debug, Error)]
pub enum AuthnError {
    #[error("request carries no credentials")]
    Missing,

    #[error("invalid {0} header")]
    InvalidHeader(HeaderName),

    #[error("token was not authenticated{}", .0.as_deref().map(|e| format!(": {e}")).unwrap_or_default())]
    Rejected(Option<String>),

    #[error("token review failed: {0}")]
    Review(#[source] kube::Error),
}

/// Trusts a username header when one is configured and present, and otherwise reviews the
/// request's bearer token.
#[derive(Clone, Debug)]
pub struct Authenticator {
    username_header: Option<HeaderName>,
    reviewer: Option<TokenReviewer>,
}

/// Validates bearer tokens with the Kubernetes `TokenReview` API.
///
/// Authenticated tokens are remembered for [`TokenReviewer::DEFAULT_TTL`] so that clients polling
/// the list do not cause a review per request. Rejections are not cached.
#[derive(Clone)]
pub struct TokenReviewer {
    api: k8s::Api<k8s::TokenReview>,
    cache: Arc<Mutex<AHashMap<String, Cached>>>,
    ttl: Duration,
}

#[derive(Clone, Debug)]
struct Cached {
    username: String,
    expires: Instant,
}

const MAX_CACHED_TOKENS: usize = 4096;

// === impl AuthnError ===

impl AuthnError {
    /// Indicates that the credentials could not be checked, rather than that they were bad.
    pub fn is_review_failure(&self) -> bool {
        matches!(self, Self::Review(_))
    }
}

// === impl Authenticator ===

impl Authenticator {
    pub fn new(username_header: Option<HeaderName>, reviewer: Option<TokenReviewer>) -> Self {
        Self {
            username_header,
            reviewer,
        }
    }

    fn trusted_username(&self, headers: &HeaderMap) -> Result<Option<String>, AuthnError> {
        let Some(name) = self.username_header.as_ref() else {
            return Ok(None);
        };
        let Some(value) = headers.get(name) else {
            return Ok(None);
        };
        let value = value
            .to_str()
            .map_err(|_| AuthnError::InvalidHeader(name.clone()))?
            .trim();
        if value.is_empty() {
            return Ok(None);
        }
        Ok(Some(value.to_string()))
    }
}

#[async_trait::async_trait]
impl Authenticate for Authenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<String, AuthnError> {
        if let Some(username) = self.trusted_username(headers)? {
            return Ok(username);
        }

        let reviewer = self.reviewer.as_ref().ok_or(AuthnError::Missing)?;
        let token = bearer_token(headers)?.ok_or(AuthnError::Missing)?;
        reviewer.review(token).await
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<Option<&str>, AuthnError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| AuthnError::InvalidHeader(header::AUTHORIZATION))?;
    let Some((scheme, token)) = value.split_once(' ') else {
        return Ok(None);
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Ok(None);
    }
    let token = token.trim();
    if token.is_empty() {
        return Ok(None);
    }
    Ok(Some(token))
}

// === impl TokenReviewer ===

impl TokenReviewer {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

    pub fn new(client: k8s::Client) -> Self {
        Self {
            api: k8s::Api::all(client),
            cache: Default::default(),
            ttl: Self::DEFAULT_TTL,
        }
    }

    async fn review(&self, token: &str) -> Result<String, AuthnError> {
        if let Some(username) = self.cached(token) {
            return Ok(username);
        }

        let review = k8s::TokenReview {
            spec: k8s::TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: None,
            },
            ..Default::default()
        };
        let review = self
            .api
            .create(&k8s::PostParams::default(), &review)
            .await
            .map_err(AuthnError::Review)?;

        let status = review.status.unwrap_or_default();
        if status.authenticated != Some(true) {
            return Err(AuthnError::Rejected(status.error));
        }
        let username = status
            .user
            .and_then(|user| user.username)
            .filter(|username| !username.is_empty())
            .ok_or(AuthnError::Rejected(None))?;

        self.remember(token, &username);
        tracing::debug!(%username, "Token reviewed");
        Ok(username)
    }

    fn cached(&self, token: &str) -> Option<String> {
        let cache = self.cache.lock();
        let cached = cache.get(token)?;
        if cached.expires <= Instant::now() {
            return None;
        }
        Some(cached.username.clone())
    }

    fn remember(&self, token: &str, username: &str) {
        let now = Instant::now();
        let mut cache = self.cache.lock();
        if cache.len() >= MAX_CACHED_TOKENS {
            cache.retain(|_, cached| cached.expires > now);
            if cache.len() >= MAX_CACHED_TOKENS {
                cache.clear();
            }
        }
        cache.insert(
            token.to_string(),
            Cached {
                username: username.to_string(),
                expires: now + self.ttl,
            },
        );
    }
}

impl std::fmt::Debug for TokenReviewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenReviewer")
            .field("ttl", &self.ttl)
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        pairs
            .iter()
            .map(|(k, v)| (HeaderName::from_static(k), HeaderValue::from_static(v)))
            .collect()
    }

    #[tokio::test]
    async fn trusts_configured_username_header() {
        let authn = Authenticator::new(Some(HeaderName::from_static("x-email")), None);
        let identity = authn
            .authenticate(&headers(&[("x-email", "alice@example.com")]))
            .await
            .expect("header must authenticate");
        assert_eq!(identity, "alice@example.com");
    }

    #[tokio::test]
    async fn ignores_unconfigured_username_header() {
        let authn = Authenticator::new(None, None);
        let err = authn
            .authenticate(&headers(&[("x-email", "alice@example.com")]))
            .await
            .expect_err("header must not be trusted");
        assert!(matches!(err, AuthnError::Missing));
    }

    #[tokio::test]
    async fn empty_username_header_is_not_an_identity() {
        let authn = Authenticator::new(Some(HeaderName::from_static("x-email")), None);
        let err = authn
            .authenticate(&headers(&[("x-email", " ")]))
            .await
            .expect_err("empty header must not authenticate");
        assert!(matches!(err, AuthnError::Missing));
        assert!(!err.is_review_failure());
    }

    #[test]
    fn parses_bearer_tokens() {
        assert_eq!(
            bearer_token(&headers(&[("authorization", "Bearer abc.def")])).unwrap(),
            Some("abc.def")
        );
        assert_eq!(
            bearer_token(&headers(&[("authorization", "bearer abc")])).unwrap(),
            Some("abc")
        );
        assert_eq!(
            bearer_token(&headers(&[("authorization", "Basic YWxpY2U6cHc=")])).unwrap(),
            None
        );
        assert_eq!(
            bearer_token(&headers(&[("authorization", "Bearer ")])).unwrap(),
            None
        );
        assert_eq!(bearer_token(&headers(&[])).unwrap(), None);
    }

    #[test]
    fn rejections_describe_the_review_error() {
        assert_eq!(
            AuthnError::Rejected(Some("token expired".to_string())).to_string(),
            "token was not authenticated: token expired"
        );
        assert_eq!(
            AuthnError::Rejected(None).to_string(),
            "token was not authenticated"
        );
    }
}
