use crate::{
    access::IndexBuilder, AccessCache, PolicyEvaluator, PolicyStore, StoreError, SyncMetrics,
};
use ahash::AHashSet as HashSet;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{sync::mpsc, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, trace, Instrument};

/// Applies when no resync period is configured.
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Rebuilds the [`AccessCache`] from a [`PolicyStore`].
///
/// Rebuilds are single-flight: at most one runs at a time, and a rebuild attempted while another
/// is in flight fails with [`SyncError::AlreadyRunning`] instead of waiting. Rebuild requests are
/// coalesced so that any number of requests made before the background task wakes result in one
/// rebuild.
pub struct Synchronizer<S> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    evaluator: PolicyEvaluator<S>,
    cache: Arc<AccessCache>,
    running: AtomicBool,
    requests: SyncRequester,
    pending: Mutex<Option<mpsc::Receiver<()>>>,
    config: SyncConfig,
}

/// Signals that the access cache should be rebuilt.
///
/// At most one request is ever pending; a request made while another is pending is absorbed by it.
#[derive(Clone, Debug)]
pub struct SyncRequester(mpsc::Sender<()>);

pub type ErrorHandler = Arc<dyn Fn(&SyncError, &SyncRequester) + Send + Sync>;

#[derive(Clone)]
pub struct SyncConfig {
    resync_period: Duration,
    on_error: ErrorHandler,
    metrics: SyncMetrics,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Distinct namespaces evaluated.
    pub namespaces: usize,
    /// Subjects with access to at least one namespace.
    pub subjects: usize,
    /// Bindings skipped because they could not be resolved.
    pub resolve_errors: usize,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("access cache synchronization is already running")]
    AlreadyRunning,

    #[error("failed to list namespaces: {0}")]
    ListNamespaces(#[source] StoreError),

    #[error("access cache synchronization task failed: {0}")]
    Task(#[source] tokio::task::JoinError),
}

/// Clears the running flag when a rebuild completes, however it completes.
struct RunningGuard<'a>(&'a AtomicBool);

// === impl Synchronizer ===

impl<S> Synchronizer<S>
where
    S: PolicyStore + Send + Sync + 'static,
{
    pub fn new(store: S, config: SyncConfig) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(Inner {
                evaluator: PolicyEvaluator::new(store),
                cache: Default::default(),
                running: AtomicBool::new(false),
                requests: SyncRequester(tx),
                pending: Mutex::new(Some(rx)),
                config,
            }),
        }
    }

    pub fn cache(&self) -> &Arc<AccessCache> {
        &self.inner.cache
    }

    pub fn requester(&self) -> SyncRequester {
        self.inner.requests.clone()
    }

    /// Requests a rebuild, returning false if a request was already pending.
    pub fn request(&self) -> bool {
        self.inner.requests.request()
    }

    /// Spawns the resync timer and the rebuild loop onto the current runtime.
    ///
    /// Both tasks stop when `shutdown` is cancelled; a rebuild that is in flight at that point
    /// completes. Requests made before the synchronizer is started are processed once it starts.
    /// Returns false if the synchronizer was already started.
    pub fn start(&self, shutdown: CancellationToken) -> bool {
        let Some(requests) = self.inner.pending.lock().take() else {
            return false;
        };

        tokio::spawn(
            resync(
                self.inner.requests.clone(),
                self.inner.config.resync_period,
                shutdown.clone(),
            )
            .instrument(info_span!("resync")),
        );
        tokio::spawn(
            self.clone()
                .process(requests, shutdown)
                .instrument(info_span!("synchronize")),
        );
        true
    }

    /// Rebuilds the access cache from the store's current contents.
    ///
    /// If the store's namespaces cannot be listed, the current index is left in place.
    pub fn synchronize(&self) -> Result<SyncStats, SyncError> {
        let metrics = &self.inner.config.metrics;
        let Some(_running) = RunningGuard::acquire(&self.inner.running) else {
            metrics.already_running();
            return Err(SyncError::AlreadyRunning);
        };

        let start = Instant::now();
        let namespaces = self
            .inner
            .evaluator
            .store()
            .list_namespaces()
            .map_err(|error| {
                metrics.failed();
                SyncError::ListNamespaces(error)
            })?;

        let mut stats = SyncStats::default();
        let mut seen = HashSet::with_capacity(namespaces.len());
        let mut index = IndexBuilder::default();
        for ns in namespaces {
            if !seen.insert(ns.name.clone()) {
                continue;
            }
            let allowed = self.inner.evaluator.allowed_subjects(&ns.name);
            trace!(namespace = %ns.name, subjects = allowed.subjects.len(), "Evaluated");
            stats.namespaces += 1;
            stats.resolve_errors += allowed.errors.len();
            for subject in allowed.subjects {
                index.grant(subject, &ns);
            }
        }

        let index = index.build();
        stats.subjects = index.len();
        self.inner.cache.restock(index);

        let elapsed = start.elapsed();
        metrics.synchronized(&stats, elapsed);
        debug!(
            namespaces = stats.namespaces,
            subjects = stats.subjects,
            resolve_errors = stats.resolve_errors,
            ?elapsed,
            "Synchronized access cache"
        );
        Ok(stats)
    }

    async fn process(self, mut requests: mpsc::Receiver<()>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Shutting down");
                    return;
                }
                req = requests.recv() => {
                    if req.is_none() {
                        return;
                    }
                }
            }

            let sync = self.clone();
            let res = tokio::task::spawn_blocking(move || sync.synchronize())
                .await
                .unwrap_or_else(|error| Err(SyncError::Task(error)));
            if let Err(error) = res {
                (self.inner.config.on_error)(&error, &self.inner.requests);
            }
        }
    }
}

impl<S> Clone for Synchronizer<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> fmt::Debug for Synchronizer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("running", &self.inner.running.load(Ordering::Relaxed))
            .field("started", &self.inner.pending.lock().is_none())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

async fn resync(requests: SyncRequester, period: Duration, shutdown: CancellationToken) {
    let mut timer = time::interval_at(time::Instant::now() + period, period);
    timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = timer.tick() => {
                let queued = requests.request();
                trace!(queued, "Resync period elapsed");
            }
        }
    }
}

// === impl SyncRequester ===

impl SyncRequester {
    /// Returns true if the request was queued and false if it was absorbed by a pending request
    /// (or the synchronizer has shut down).
    pub fn request(&self) -> bool {
        self.0.try_send(()).is_ok()
    }
}

// === impl SyncConfig ===

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resync_period: DEFAULT_RESYNC_PERIOD,
            on_error: Arc::new(log_error),
            metrics: SyncMetrics::default(),
        }
    }
}

impl SyncConfig {
    /// A zero period selects [`DEFAULT_RESYNC_PERIOD`].
    pub fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period = if period.is_zero() {
            DEFAULT_RESYNC_PERIOD
        } else {
            period
        };
        self
    }

    /// Replaces the handler invoked when a background rebuild fails.
    ///
    /// The default handler logs the error. Handlers run on the rebuild task and must not block.
    pub fn with_error_handler(
        mut self,
        on_error: impl Fn(&SyncError, &SyncRequester) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Arc::new(on_error);
        self
    }

    pub fn with_metrics(mut self, metrics: SyncMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn resync_period(&self) -> Duration {
        self.resync_period
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("resync_period", &self.resync_period)
            .finish_non_exhaustive()
    }
}

fn log_error(error: &SyncError, _: &SyncRequester) {
    error!(%error, "Failed to synchronize access cache");
}

// === impl SyncError ===

impl SyncError {
    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning)
    }
}

// === impl RunningGuard ===

impl<'a> RunningGuard<'a> {
    fn acquire(running: &'a AtomicBool) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(running))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
