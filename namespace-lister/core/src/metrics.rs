use crate::SyncStats;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};
use std::time::Duration;

/// Describes access cache synchronizations.
///
/// Metrics that are never registered are still updated, so a default instance may be used when no
/// registry is available.
#[derive(Clone, Debug)]
pub struct SyncMetrics {
    syncs: Family<SyncLabels, Counter>,
    duration: Histogram,
    subjects: Gauge,
    namespaces: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SyncLabels {
    result: &'static str,
}

impl SyncMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "sync",
            "Count of access cache synchronizations by result",
            metrics.syncs.clone(),
        );
        prom.register(
            "sync_duration_seconds",
            "Distribution of successful access cache synchronization durations",
            metrics.duration.clone(),
        );
        prom.register(
            "index_subjects",
            "The number of subjects in the access index",
            metrics.subjects.clone(),
        );
        prom.register(
            "index_namespaces",
            "The number of namespaces evaluated by the last synchronization",
            metrics.namespaces.clone(),
        );
        metrics
    }

    pub(crate) fn synchronized(&self, stats: &SyncStats, elapsed: Duration) {
        self.syncs
            .get_or_create(&SyncLabels { result: "ok" })
            .inc();
        self.duration.observe(elapsed.as_secs_f64());
        self.subjects.set(stats.subjects as i64);
        self.namespaces.set(stats.namespaces as i64);
    }

    pub(crate) fn failed(&self) {
        self.syncs
            .get_or_create(&SyncLabels { result: "error" })
            .inc();
    }

    pub(crate) fn already_running(&self) {
        self.syncs
            .get_or_create(&SyncLabels { result: "already_running" })
            .inc();
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self {
            syncs: Family::default(),
            // 1ms to ~65s.
            duration: Histogram::new(
                prometheus_client::metrics::histogram::exponential_buckets(0.001, 2.0, 17),
            ),
            subjects: Gauge::default(),
            namespaces: Gauge::default(),
        }
    }
}
