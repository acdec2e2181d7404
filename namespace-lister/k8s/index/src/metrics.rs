use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct IndexMetrics {
    size: Family<KindLabels, Gauge>,
    updates: Family<UpdateLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct UpdateLabels {
    kind: &'static str,
    op: &'static str,
}

#[derive(Copy, Clone, Debug)]
pub(crate) enum Op {
    Apply,
    Delete,
    Reset,
}

impl IndexMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "index_size",
            "Gauge of the number of resources in the index",
            metrics.size.clone(),
        );
        prom.register(
            "index_updates",
            "Count of watch updates applied to the index",
            metrics.updates.clone(),
        );
        metrics
    }

    pub(crate) fn update(&self, kind: &'static str, op: Op, size: usize) {
        let op = match op {
            Op::Apply => "apply",
            Op::Delete => "delete",
            Op::Reset => "reset",
        };
        self.updates.get_or_create(&UpdateLabels { kind, op }).inc();
        self.size.get_or_create(&KindLabels { kind }).set(size as i64);
    }
}
