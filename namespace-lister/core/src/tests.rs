use crate::{
    AccessIndex, ClusterRole, ClusterRoleBinding, ListNamespaces, Namespace, NamespaceLister,
    PolicyRule, PolicyStore, Role, RoleBinding, RoleRef, StoreError, Subject, SyncConfig,
    SyncError, Synchronizer,
};
use ahash::AHashMap as HashMap;
use maplit::btreemap;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// A PolicyStore backed by fixed maps.
#[derive(Debug, Default)]
struct StaticStore {
    state: RwLock<State>,
    fail_listing: AtomicBool,
    namespace_lists: AtomicUsize,
}

#[derive(Debug, Default)]
struct State {
    namespaces: Vec<Arc<Namespace>>,
    roles: HashMap<(String, String), Arc<Role>>,
    cluster_roles: HashMap<String, Arc<ClusterRole>>,
    role_bindings: Vec<Arc<RoleBinding>>,
    cluster_role_bindings: Vec<Arc<ClusterRoleBinding>>,
}

/// Blocks namespace listing until released, signaling when a listing has begun.
struct GatedStore {
    inner: StaticStore,
    entered: std::sync::mpsc::SyncSender<()>,
    release: Mutex<std::sync::mpsc::Receiver<()>>,
}

fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .finish(),
    )
}

// === Scenarios ===

#[test]
fn cluster_role_binding_grants_every_namespace() {
    let _tracing = init_tracing();
    let sync = Synchronizer::new(mk_store(), SyncConfig::default());
    let stats = sync.synchronize().expect("sync must succeed");
    assert_eq!(stats.namespaces, 2);
    assert_eq!(stats.resolve_errors, 0);

    let lister = NamespaceLister::new(sync.cache().clone());
    assert_eq!(names(&lister.list("alice")), ["myns-1", "myns-2"]);
}

#[test]
fn role_binding_grants_only_its_namespace() {
    let _tracing = init_tracing();
    let sync = Synchronizer::new(mk_store(), SyncConfig::default());
    sync.synchronize().expect("sync must succeed");

    let lister = NamespaceLister::new(sync.cache().clone());
    assert_eq!(names(&lister.list("bob")), ["myns-1"]);
}

#[test]
fn resource_names_restrict_cluster_role_bindings() {
    let _tracing = init_tracing();
    let sync = Synchronizer::new(mk_store(), SyncConfig::default());
    sync.synchronize().expect("sync must succeed");

    let lister = NamespaceLister::new(sync.cache().clone());
    assert_eq!(names(&lister.list("carol")), ["myns-1"]);
}

#[test]
fn service_accounts_are_looked_up_by_username() {
    let _tracing = init_tracing();
    let store = mk_store();
    store.update(|s| {
        s.cluster_role_bindings.push(mk_cluster_role_binding(
            "deployer-ns-get",
            "ns-get",
            vec![Subject::service_account("team-a", "deployer")],
        ))
    });
    let sync = Synchronizer::new(store, SyncConfig::default());
    sync.synchronize().expect("sync must succeed");

    let lister = NamespaceLister::new(sync.cache().clone());
    assert_eq!(
        names(&lister.list("system:serviceaccount:team-a:deployer")),
        ["myns-1", "myns-2"]
    );
    // A user that happens to share the name is a different subject.
    assert!(lister.list("deployer").is_empty());
}

#[tokio::test]
async fn lists_nothing_before_first_sync() {
    let _tracing = init_tracing();
    let sync = Synchronizer::new(mk_store(), SyncConfig::default());
    let lister = NamespaceLister::new(sync.cache().clone());
    let namespaces = lister
        .list_namespaces("alice")
        .await
        .expect("listing must not fail");
    assert!(namespaces.is_empty());
    assert!(!lister.is_synchronized());

    sync.synchronize().expect("sync must succeed");
    assert!(lister.is_synchronized());
}

// === Evaluation ===

#[test]
fn subjects_without_bindings_list_nothing() {
    let _tracing = init_tracing();
    let sync = Synchronizer::new(mk_store(), SyncConfig::default());
    sync.synchronize().expect("sync must succeed");
    assert!(sync.cache().is_synchronized());
    assert!(sync.cache().list(&Subject::user("mallory")).is_empty());
    assert!(sync.cache().list(&Subject::group("alice")).is_empty());
}

#[test]
fn duplicate_grants_list_a_namespace_once() {
    let _tracing = init_tracing();
    let store = mk_store();
    store.update(|s| {
        s.role_bindings.push(mk_role_binding(
            "myns-1",
            "bob-ns-get-again",
            RoleRef::role("ns-get"),
            vec![Subject::user("bob")],
        ));
        s.cluster_role_bindings.push(mk_cluster_role_binding(
            "bob-ns-get",
            "ns-get",
            vec![Subject::user("bob")],
        ));
    });
    let sync = Synchronizer::new(store, SyncConfig::default());
    sync.synchronize().expect("sync must succeed");
    assert_eq!(
        names(&sync.cache().list(&Subject::user("bob"))),
        ["myns-1", "myns-2"]
    );
}

#[test]
fn duplicate_namespaces_are_evaluated_once() {
    let _tracing = init_tracing();
    let store = mk_store();
    store.update(|s| {
        let dup = s.namespaces[0].clone();
        s.namespaces.push(dup);
    });
    let sync = Synchronizer::new(store, SyncConfig::default());
    let stats = sync.synchronize().expect("sync must succeed");
    assert_eq!(stats.namespaces, 2);
    assert_eq!(
        names(&sync.cache().list(&Subject::user("alice"))),
        ["myns-1", "myns-2"]
    );
}

#[test]
fn role_binding_to_cluster_role_is_namespace_scoped() {
    let _tracing = init_tracing();
    let store = mk_store();
    store.update(|s| {
        s.role_bindings.push(mk_role_binding(
            "myns-2",
            "dave-ns-get",
            RoleRef::cluster_role("ns-get"),
            vec![Subject::user("dave")],
        ))
    });
    let sync = Synchronizer::new(store, SyncConfig::default());
    sync.synchronize().expect("sync must succeed");
    assert_eq!(names(&sync.cache().list(&Subject::user("dave"))), ["myns-2"]);
}

#[test]
fn wildcard_rules_grant_every_namespace() {
    let _tracing = init_tracing();
    let store = mk_store();
    store.update(|s| {
        s.cluster_roles.insert(
            "admin".to_string(),
            Arc::new(ClusterRole {
                name: "admin".to_string(),
                rules: vec![mk_rule(["*"], ["*"], ["*"], [])],
            }),
        );
        s.cluster_role_bindings.push(mk_cluster_role_binding(
            "admins",
            "admin",
            vec![Subject::group("admins")],
        ));
    });
    let sync = Synchronizer::new(store, SyncConfig::default());
    sync.synchronize().expect("sync must succeed");
    assert_eq!(
        names(&sync.cache().list(&Subject::group("admins"))),
        ["myns-1", "myns-2"]
    );
}

#[test]
fn rules_for_other_resources_grant_nothing() {
    let _tracing = init_tracing();
    let store = mk_store();
    store.update(|s| {
        s.cluster_roles.insert(
            "pod-reader".to_string(),
            Arc::new(ClusterRole {
                name: "pod-reader".to_string(),
                rules: vec![
                    mk_rule([""], ["pods"], ["get", "list"], []),
                    mk_rule([""], ["namespaces"], ["list", "watch"], []),
                    mk_rule(["apps"], ["namespaces"], ["get"], []),
                ],
            }),
        );
        s.cluster_role_bindings.push(mk_cluster_role_binding(
            "erin-pod-reader",
            "pod-reader",
            vec![Subject::user("erin")],
        ));
    });
    let sync = Synchronizer::new(store, SyncConfig::default());
    sync.synchronize().expect("sync must succeed");
    assert!(sync.cache().list(&Subject::user("erin")).is_empty());
}

#[test]
fn dangling_references_are_skipped() {
    let _tracing = init_tracing();
    let store = mk_store();
    store.update(|s| {
        s.role_bindings.push(mk_role_binding(
            "myns-1",
            "missing-role",
            RoleRef::role("does-not-exist"),
            vec![Subject::user("bob")],
        ));
        s.cluster_role_bindings.insert(
            0,
            mk_cluster_role_binding(
                "missing-cluster-role",
                "does-not-exist",
                vec![Subject::user("alice")],
            ),
        );
        s.cluster_role_bindings.push(Arc::new(ClusterRoleBinding {
            name: "role-ref".to_string(),
            subjects: vec![Subject::user("frank")],
            role_ref: RoleRef::role("ns-get"),
        }));
    });
    let sync = Synchronizer::new(store, SyncConfig::default());
    let stats = sync.synchronize().expect("sync must succeed");

    // The missing ClusterRole and the invalid ClusterRoleBinding are reported for each namespace;
    // the missing Role only for its own.
    assert_eq!(stats.resolve_errors, 5);
    assert_eq!(
        names(&sync.cache().list(&Subject::user("alice"))),
        ["myns-1", "myns-2"]
    );
    assert_eq!(names(&sync.cache().list(&Subject::user("bob"))), ["myns-1"]);
    assert!(sync.cache().list(&Subject::user("frank")).is_empty());
}

#[test]
fn allowed_subjects_reports_resolution_errors() {
    let _tracing = init_tracing();
    let store = mk_store();
    store.update(|s| {
        s.role_bindings.push(mk_role_binding(
            "myns-1",
            "missing-role",
            RoleRef::role("does-not-exist"),
            vec![Subject::user("bob")],
        ))
    });
    let evaluator = crate::PolicyEvaluator::new(store);
    let allowed = evaluator.allowed_subjects("myns-1");
    assert_eq!(
        allowed.subjects,
        [
            Subject::user("alice"),
            Subject::user("carol"),
            Subject::user("bob")
        ]
    );
    assert_eq!(allowed.errors.len(), 1);
    match &allowed.errors[0] {
        crate::ResolveError::RoleBinding {
            namespace,
            binding,
            source,
        } => {
            assert_eq!(namespace, "myns-1");
            assert_eq!(binding, "missing-role");
            assert!(source.is_not_found());
        }
        error => panic!("unexpected error: {error}"),
    }
}

// === Synchronization ===

#[test]
fn synchronize_is_idempotent() {
    let _tracing = init_tracing();
    let sync = Synchronizer::new(mk_store(), SyncConfig::default());
    sync.synchronize().expect("sync must succeed");
    let first = sync.cache().snapshot().expect("index must be set");
    let stats = sync.synchronize().expect("sync must succeed");
    let second = sync.cache().snapshot().expect("index must be set");

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(contents(&first), contents(&second));
    assert_eq!(stats.subjects, 3);
}

#[test]
fn synchronize_replaces_rather_than_merges() {
    let _tracing = init_tracing();
    let store = mk_store();
    let sync = Synchronizer::new(store.clone(), SyncConfig::default());
    sync.synchronize().expect("sync must succeed");
    assert_eq!(names(&sync.cache().list(&Subject::user("bob"))), ["myns-1"]);

    store.update(|s| s.role_bindings.clear());
    sync.synchronize().expect("sync must succeed");
    assert!(sync.cache().list(&Subject::user("bob")).is_empty());
}

#[test]
fn listing_failure_keeps_prior_index() {
    let _tracing = init_tracing();
    let store = mk_store();
    let sync = Synchronizer::new(store.clone(), SyncConfig::default());
    sync.synchronize().expect("sync must succeed");
    let prior = sync.cache().snapshot().expect("index must be set");

    store.update(|s| s.role_bindings.clear());
    store.fail_listing.store(true, Ordering::SeqCst);
    let error = sync.synchronize().expect_err("sync must fail");
    assert!(matches!(error, SyncError::ListNamespaces(_)), "{error}");

    let current = sync.cache().snapshot().expect("index must be set");
    assert!(Arc::ptr_eq(&prior, &current));
    assert_eq!(names(&sync.cache().list(&Subject::user("bob"))), ["myns-1"]);

    // The guard is released after a failure.
    store.fail_listing.store(false, Ordering::SeqCst);
    sync.synchronize().expect("sync must succeed");
    assert!(sync.cache().list(&Subject::user("bob")).is_empty());
}

#[test]
fn concurrent_synchronize_is_rejected() {
    let _tracing = init_tracing();
    let (entered_tx, entered_rx) = std::sync::mpsc::sync_channel(1);
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let store = Arc::new(GatedStore {
        inner: Arc::try_unwrap(mk_store()).expect("store must not be shared"),
        entered: entered_tx,
        release: Mutex::new(release_rx),
    });
    let sync = Synchronizer::new(store, SyncConfig::default());

    let running = {
        let sync = sync.clone();
        std::thread::spawn(move || sync.synchronize())
    };
    entered_rx.recv().expect("first sync must start");

    let error = sync.synchronize().expect_err("second sync must not run");
    assert!(error.is_already_running());
    assert!(!sync.cache().is_synchronized());

    release_tx.send(()).expect("first sync must be waiting");
    let stats = running
        .join()
        .expect("thread must not panic")
        .expect("first sync must succeed");
    assert_eq!(stats.namespaces, 2);
    assert!(sync.cache().is_synchronized());
}

#[tokio::test(start_paused = true)]
async fn pending_requests_are_coalesced() {
    let _tracing = init_tracing();
    let store = mk_store();
    let sync = Synchronizer::new(store.clone(), SyncConfig::default());

    assert!(sync.request());
    for _ in 0..4 {
        assert!(!sync.request(), "requests must coalesce");
    }

    let shutdown = CancellationToken::new();
    assert!(sync.start(shutdown.clone()));
    eventually(|| sync.cache().is_synchronized()).await;

    time::sleep(Duration::from_secs(60)).await;
    assert_eq!(store.namespace_lists.load(Ordering::SeqCst), 1);

    // Once the pending request is consumed, another may be queued.
    assert!(sync.request());
    eventually(|| store.namespace_lists.load(Ordering::SeqCst) == 2).await;
    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn resyncs_periodically() {
    let _tracing = init_tracing();
    let store = mk_store();
    let sync = Synchronizer::new(
        store.clone(),
        SyncConfig::default().with_resync_period(Duration::from_secs(60)),
    );
    let shutdown = CancellationToken::new();
    assert!(sync.start(shutdown.clone()));

    time::sleep(Duration::from_secs(30)).await;
    assert_eq!(store.namespace_lists.load(Ordering::SeqCst), 0);
    assert!(!sync.cache().is_synchronized());

    time::sleep(Duration::from_secs(31)).await;
    eventually(|| store.namespace_lists.load(Ordering::SeqCst) == 1).await;
    assert!(sync.cache().is_synchronized());

    time::sleep(Duration::from_secs(60)).await;
    eventually(|| store.namespace_lists.load(Ordering::SeqCst) == 2).await;
    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_background_tasks() {
    let _tracing = init_tracing();
    let store = mk_store();
    let sync = Synchronizer::new(
        store.clone(),
        SyncConfig::default().with_resync_period(Duration::from_secs(60)),
    );
    let shutdown = CancellationToken::new();
    assert!(sync.start(shutdown.clone()));
    shutdown.cancel();

    time::sleep(Duration::from_secs(5 * 60)).await;
    assert!(!sync.request(), "requests must not be accepted after shutdown");
    assert_eq!(store.namespace_lists.load(Ordering::SeqCst), 0);
    assert!(!sync.cache().is_synchronized());
}

#[tokio::test]
async fn start_is_idempotent() {
    let _tracing = init_tracing();
    let sync = Synchronizer::new(mk_store(), SyncConfig::default());
    let shutdown = CancellationToken::new();
    assert!(sync.start(shutdown.clone()));
    assert!(!sync.start(shutdown.clone()));
    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn background_failures_are_reported() {
    let _tracing = init_tracing();
    let store = mk_store();
    store.fail_listing.store(true, Ordering::SeqCst);

    let errors = Arc::new(Mutex::new(Vec::new()));
    let config = SyncConfig::default().with_error_handler({
        let errors = errors.clone();
        move |error: &SyncError, _: &crate::SyncRequester| errors.lock().push(error.to_string())
    });
    let sync = Synchronizer::new(store.clone(), config);
    assert!(sync.request());

    let shutdown = CancellationToken::new();
    assert!(sync.start(shutdown.clone()));
    eventually(|| !errors.lock().is_empty()).await;
    assert_eq!(
        *errors.lock(),
        ["failed to list namespaces: listing namespaces is unavailable"]
    );
    assert!(!sync.cache().is_synchronized());
    shutdown.cancel();
}

#[tokio::test(start_paused = true)]
async fn error_handler_may_request_another_sync() {
    let _tracing = init_tracing();
    let store = mk_store();
    store.fail_listing.store(true, Ordering::SeqCst);

    let config = SyncConfig::default().with_error_handler({
        let store = store.clone();
        move |_: &SyncError, requests: &crate::SyncRequester| {
            store.fail_listing.store(false, Ordering::SeqCst);
            requests.request();
        }
    });
    let sync = Synchronizer::new(store.clone(), config);
    assert!(sync.request());

    let shutdown = CancellationToken::new();
    assert!(sync.start(shutdown.clone()));
    eventually(|| sync.cache().is_synchronized()).await;
    assert_eq!(store.namespace_lists.load(Ordering::SeqCst), 2);
    shutdown.cancel();
}

#[test]
fn zero_resync_period_selects_default() {
    let config = SyncConfig::default().with_resync_period(Duration::ZERO);
    assert_eq!(config.resync_period(), crate::sync::DEFAULT_RESYNC_PERIOD);
}

// === Fixtures ===

/// Builds a store holding:
///
/// - namespaces `myns-1` and `myns-2`;
/// - a `ns-get` ClusterRole bound cluster-wide to `alice`;
/// - a `ns-get` Role in `myns-1` bound to `bob`;
/// - a `myns-1-get` ClusterRole, restricted to `myns-1`, bound cluster-wide to `carol`.
fn mk_store() -> Arc<StaticStore> {
    let store = StaticStore::default();
    store.update(|s| {
        s.namespaces = vec![
            Arc::new(Namespace {
                name: "myns-1".to_string(),
                labels: btreemap! { "team".to_string() => "a".to_string() },
            }),
            Arc::new(Namespace::new("myns-2")),
        ];

        s.cluster_roles.insert(
            "ns-get".to_string(),
            Arc::new(ClusterRole {
                name: "ns-get".to_string(),
                rules: vec![mk_rule([""], ["namespaces"], ["get"], [])],
            }),
        );
        s.cluster_roles.insert(
            "myns-1-get".to_string(),
            Arc::new(ClusterRole {
                name: "myns-1-get".to_string(),
                rules: vec![mk_rule([""], ["namespaces"], ["get"], ["myns-1"])],
            }),
        );
        s.roles.insert(
            ("myns-1".to_string(), "ns-get".to_string()),
            Arc::new(Role {
                namespace: "myns-1".to_string(),
                name: "ns-get".to_string(),
                rules: vec![mk_rule([""], ["namespaces"], ["get"], [])],
            }),
        );

        s.cluster_role_bindings = vec![
            mk_cluster_role_binding("alice-ns-get", "ns-get", vec![Subject::user("alice")]),
            mk_cluster_role_binding("carol-myns-1-get", "myns-1-get", vec![Subject::user("carol")]),
        ];
        s.role_bindings = vec![mk_role_binding(
            "myns-1",
            "bob-ns-get",
            RoleRef::role("ns-get"),
            vec![Subject::user("bob")],
        )];
    });
    Arc::new(store)
}

fn mk_rule<'a, const G: usize, const R: usize, const V: usize, const N: usize>(
    api_groups: [&'a str; G],
    resources: [&'a str; R],
    verbs: [&'a str; V],
    names: [&'a str; N],
) -> PolicyRule {
    PolicyRule {
        api_groups: api_groups.into_iter().collect(),
        resources: resources.into_iter().collect(),
        verbs: verbs.into_iter().collect(),
        resource_names: names.into_iter().map(Into::into).collect(),
    }
}

fn mk_role_binding(
    ns: &str,
    name: &str,
    role_ref: RoleRef,
    subjects: Vec<Subject>,
) -> Arc<RoleBinding> {
    Arc::new(RoleBinding {
        namespace: ns.to_string(),
        name: name.to_string(),
        subjects,
        role_ref,
    })
}

fn mk_cluster_role_binding(
    name: &str,
    cluster_role: &str,
    subjects: Vec<Subject>,
) -> Arc<ClusterRoleBinding> {
    Arc::new(ClusterRoleBinding {
        name: name.to_string(),
        subjects,
        role_ref: RoleRef::cluster_role(cluster_role),
    })
}

fn names(namespaces: &[Arc<Namespace>]) -> Vec<&str> {
    namespaces.iter().map(|ns| ns.name.as_str()).collect()
}

fn contents(index: &AccessIndex) -> BTreeMap<Subject, Vec<String>> {
    index
        .iter()
        .map(|(subject, nss)| {
            let names = nss.iter().map(|ns| ns.name.clone()).collect();
            (subject.clone(), names)
        })
        .collect()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not satisfied");
}

// === impl StaticStore ===

impl StaticStore {
    fn update(&self, f: impl FnOnce(&mut State)) {
        f(&mut self.state.write());
    }
}

impl PolicyStore for StaticStore {
    fn get_role(&self, namespace: &str, name: &str) -> Result<Arc<Role>, StoreError> {
        self.state
            .read()
            .roles
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::role_not_found(namespace, name))
    }

    fn get_cluster_role(&self, name: &str) -> Result<Arc<ClusterRole>, StoreError> {
        self.state
            .read()
            .cluster_roles
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::cluster_role_not_found(name))
    }

    fn list_role_bindings(&self, namespace: &str) -> Result<Vec<Arc<RoleBinding>>, StoreError> {
        Ok(self
            .state
            .read()
            .role_bindings
            .iter()
            .filter(|rb| rb.namespace == namespace)
            .cloned()
            .collect())
    }

    fn list_cluster_role_bindings(&self) -> Result<Vec<Arc<ClusterRoleBinding>>, StoreError> {
        Ok(self.state.read().cluster_role_bindings.clone())
    }

    fn list_namespaces(&self) -> Result<Vec<Arc<Namespace>>, StoreError> {
        self.namespace_lists.fetch_add(1, Ordering::SeqCst);
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("listing namespaces is unavailable").into());
        }
        Ok(self.state.read().namespaces.clone())
    }
}

// === impl GatedStore ===

impl PolicyStore for GatedStore {
    fn get_role(&self, namespace: &str, name: &str) -> Result<Arc<Role>, StoreError> {
        self.inner.get_role(namespace, name)
    }

    fn get_cluster_role(&self, name: &str) -> Result<Arc<ClusterRole>, StoreError> {
        self.inner.get_cluster_role(name)
    }

    fn list_role_bindings(&self, namespace: &str) -> Result<Vec<Arc<RoleBinding>>, StoreError> {
        self.inner.list_role_bindings(namespace)
    }

    fn list_cluster_role_bindings(&self) -> Result<Vec<Arc<ClusterRoleBinding>>, StoreError> {
        self.inner.list_cluster_role_bindings()
    }

    fn list_namespaces(&self) -> Result<Vec<Arc<Namespace>>, StoreError> {
        self.entered
            .send(())
            .map_err(|_| anyhow::anyhow!("test dropped"))?;
        self.release
            .lock()
            .recv()
            .map_err(|_| anyhow::anyhow!("test dropped"))?;
        self.inner.list_namespaces()
    }
}
