use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        gauge::Gauge,
        histogram::{exponential_buckets, Histogram},
    },
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct HttpMetrics {
    requests: Family<RequestLabels, Counter>,
    durations: Family<RequestLabels, Histogram>,
    response_sizes: Family<RequestLabels, Histogram>,
    in_flight: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    method: &'static str,
    code: u16,
}

/// Tracks a single request from when it is received until its response is built.
///
/// A request that is dropped before completing is only removed from the in-flight gauge.
#[derive(Debug)]
pub(crate) struct RequestObserver {
    metrics: HttpMetrics,
    method: &'static str,
    start: time::Instant,
}

// === impl HttpMetrics ===

impl Default for HttpMetrics {
    fn default() -> Self {
        Self {
            requests: Family::default(),
            durations: Family::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.0005, 2.0, 14))
            }),
            response_sizes: Family::new_with_constructor(|| {
                Histogram::new(exponential_buckets(64.0, 4.0, 10))
            }),
            in_flight: Gauge::default(),
        }
    }
}

impl HttpMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "requests",
            "Count of HTTP requests by response status code and method",
            metrics.requests.clone(),
        );
        prom.register_with_unit(
            "request_duration",
            "Histogram of HTTP request latency by response status code and method",
            Unit::Seconds,
            metrics.durations.clone(),
        );
        prom.register_with_unit(
            "response_size",
            "Histogram of HTTP response body sizes",
            Unit::Bytes,
            metrics.response_sizes.clone(),
        );
        prom.register(
            "requests_in_flight",
            "Gauge of HTTP requests currently being served",
            metrics.in_flight.clone(),
        );
        metrics
    }

    pub(crate) fn start(&self, method: &http::Method) -> RequestObserver {
        self.in_flight.inc();
        RequestObserver {
            metrics: self.clone(),
            method: method_label(method),
            start: time::Instant::now(),
        }
    }
}

fn method_label(method: &http::Method) -> &'static str {
    match method.as_str() {
        "GET" => "get",
        "HEAD" => "head",
        "POST" => "post",
        "PUT" => "put",
        "PATCH" => "patch",
        "DELETE" => "delete",
        "OPTIONS" => "options",
        _ => "other",
    }
}

// === impl RequestObserver ===

impl RequestObserver {
    pub(crate) fn end(self, code: http::StatusCode, body_size: usize) {
        let labels = RequestLabels {
            method: self.method,
            code: code.as_u16(),
        };
        self.metrics.requests.get_or_create(&labels).inc();
        self.metrics
            .durations
            .get_or_create(&labels)
            .observe(self.start.elapsed().as_secs_f64());
        self.metrics
            .response_sizes
            .get_or_create(&labels)
            .observe(body_size as f64);
    }
}

impl Drop for RequestObserver {
    fn drop(&mut self) {
        self.metrics.in_flight.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_tracks_open_requests() {
        let metrics = HttpMetrics::default();
        let first = metrics.start(&http::Method::GET);
        let second = metrics.start(&http::Method::POST);
        assert_eq!(metrics.in_flight.get(), 2);

        first.end(http::StatusCode::OK, 12);
        assert_eq!(metrics.in_flight.get(), 1);
        drop(second);
        assert_eq!(metrics.in_flight.get(), 0);

        let ok = RequestLabels {
            method: "get",
            code: 200,
        };
        assert_eq!(metrics.requests.get_or_create(&ok).get(), 1);
        // Abandoned requests are not counted as completed.
        let abandoned = RequestLabels {
            method: "post",
            code: 200,
        };
        assert_eq!(metrics.requests.get_or_create(&abandoned).get(), 0);
    }
}
