use crate::{Namespace, Subject};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use arc_swap::ArcSwapOption;
use std::sync::Arc;

/// Holds the most recently built [`AccessIndex`].
///
/// The index is replaced wholesale by an atomic pointer swap. Readers never wait on the writer.
#[derive(Debug, Default)]
pub struct AccessCache {
    current: ArcSwapOption<AccessIndex>,
}

/// An immutable mapping of subjects to the namespaces they may `get`.
#[derive(Debug, Default)]
pub struct AccessIndex {
    by_subject: HashMap<Subject, Vec<Arc<Namespace>>>,
}

/// Accumulates an [`AccessIndex`] one grant at a time.
#[derive(Debug, Default)]
pub(crate) struct IndexBuilder {
    by_subject: HashMap<Subject, Grants>,
}

#[derive(Debug, Default)]
struct Grants {
    names: HashSet<String>,
    namespaces: Vec<Arc<Namespace>>,
}

// === impl AccessCache ===

impl AccessCache {
    /// Lists the namespaces the subject may `get`.
    ///
    /// Before the cache is first synchronized, every subject has access to nothing.
    pub fn list(&self, subject: &Subject) -> Vec<Arc<Namespace>> {
        match &*self.current.load() {
            Some(index) => index.get(subject).to_vec(),
            None => Vec::new(),
        }
    }

    /// Returns the current index, if one has been built.
    pub fn snapshot(&self) -> Option<Arc<AccessIndex>> {
        self.current.load_full()
    }

    /// Replaces the current index, returning the prior one.
    pub fn restock(&self, index: AccessIndex) -> Option<Arc<AccessIndex>> {
        self.current.swap(Some(Arc::new(index)))
    }

    /// Indicates whether an index has been built.
    ///
    /// A subject without access and a cache that has never been synchronized both list no
    /// namespaces; this distinguishes the two for readiness checks.
    pub fn is_synchronized(&self) -> bool {
        self.current.load().is_some()
    }
}

// === impl AccessIndex ===

impl AccessIndex {
    pub fn get(&self, subject: &Subject) -> &[Arc<Namespace>] {
        self.by_subject
            .get(subject)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The number of subjects with access to at least one namespace.
    pub fn len(&self) -> usize {
        self.by_subject.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_subject.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Subject, &[Arc<Namespace>])> {
        self.by_subject.iter().map(|(s, nss)| (s, nss.as_slice()))
    }
}

impl FromIterator<(Subject, Arc<Namespace>)> for AccessIndex {
    fn from_iter<T: IntoIterator<Item = (Subject, Arc<Namespace>)>>(iter: T) -> Self {
        let mut builder = IndexBuilder::default();
        for (subject, ns) in iter {
            builder.grant(subject, &ns);
        }
        builder.build()
    }
}

// === impl IndexBuilder ===

impl IndexBuilder {
    /// Records that the subject may `get` the namespace.
    ///
    /// A subject's namespaces keep the order of their first grant; repeated grants are ignored.
    pub(crate) fn grant(&mut self, subject: Subject, ns: &Arc<Namespace>) {
        let grants = self.by_subject.entry(subject).or_default();
        if grants.names.insert(ns.name.clone()) {
            grants.namespaces.push(ns.clone());
        }
    }

    pub(crate) fn build(self) -> AccessIndex {
        AccessIndex {
            by_subject: self
                .by_subject
                .into_iter()
                .map(|(subject, grants)| (subject, grants.namespaces))
                .collect(),
        }
    }
}
