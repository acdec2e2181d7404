use crate::{AccessCache, Namespace, Subject};
use std::sync::Arc;

/// Lists the namespaces visible to an authenticated identity.
#[async_trait::async_trait]
pub trait ListNamespaces {
    /// An identity without access lists no namespaces; that is not an error.
    async fn list_namespaces(&self, identity: &str) -> anyhow::Result<Vec<Arc<Namespace>>>;

    /// False until listings reflect a complete view of the cluster.
    fn is_synchronized(&self) -> bool;
}

/// Answers namespace listings from an [`AccessCache`].
///
/// The cached index is the authorization decision, so listings are only as fresh as the last
/// successful synchronization.
#[derive(Clone, Debug)]
pub struct NamespaceLister {
    cache: Arc<AccessCache>,
}

impl NamespaceLister {
    pub fn new(cache: Arc<AccessCache>) -> Self {
        Self { cache }
    }

    pub fn list(&self, identity: &str) -> Vec<Arc<Namespace>> {
        let subject = Subject::from_username(identity);
        let namespaces = self.cache.list(&subject);
        tracing::trace!(%subject, namespaces = namespaces.len(), "Listed");
        namespaces
    }
}

#[async_trait::async_trait]
impl ListNamespaces for NamespaceLister {
    async fn list_namespaces(&self, identity: &str) -> anyhow::Result<Vec<Arc<Namespace>>> {
        Ok(self.list(identity))
    }

    fn is_synchronized(&self) -> bool {
        self.cache.is_synchronized()
    }
}
