use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Latency samples kept per series; older samples are discarded
const MAX_SAMPLES: usize = 4096;

/// Process-wide metrics collector.
///
/// Tracks requests, detections, recognition and translation calls,
/// translation cache performance and pipeline latency.
/// Cheap to clone; all clones share the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Requests
    requests_total: AtomicUsize,
    requests_failed: AtomicUsize,
    detections_total: AtomicUsize,
    pipeline_latency_ms: RwLock<Vec<u64>>,

    // Recognition
    recognition_calls: AtomicUsize,
    recognition_failures: AtomicUsize,
    recognition_empty: AtomicUsize,

    // Translation
    translation_calls: AtomicUsize,
    translation_failures: AtomicUsize,
    translation_skipped: AtomicUsize,
    translation_latency_ms: RwLock<Vec<u64>>,

    // Translation cache
    cache_hits: AtomicUsize,
    cache_misses: AtomicUsize,

    // Circuit breakers
    circuit_breaker_rejections: AtomicUsize,

    // Per-endpoint request counters
    endpoint_counters: DashMap<String, AtomicUsize>,

    start_time: Instant,
}

fn push_sample(series: &RwLock<Vec<u64>>, duration: Duration) {
    let mut samples = series.write();
    if samples.len() >= MAX_SAMPLES {
        samples.remove(0);
    }
    samples.push(duration.as_millis() as u64);
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                requests_total: AtomicUsize::new(0),
                requests_failed: AtomicUsize::new(0),
                detections_total: AtomicUsize::new(0),
                pipeline_latency_ms: RwLock::new(Vec::new()),
                recognition_calls: AtomicUsize::new(0),
                recognition_failures: AtomicUsize::new(0),
                recognition_empty: AtomicUsize::new(0),
                translation_calls: AtomicUsize::new(0),
                translation_failures: AtomicUsize::new(0),
                translation_skipped: AtomicUsize::new(0),
                translation_latency_ms: RwLock::new(Vec::new()),
                cache_hits: AtomicUsize::new(0),
                cache_misses: AtomicUsize::new(0),
                circuit_breaker_rejections: AtomicUsize::new(0),
                endpoint_counters: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    // Requests
    pub fn record_request(&self, success: bool, detections: usize, duration: Duration) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.inner
            .detections_total
            .fetch_add(detections, Ordering::Relaxed);
        push_sample(&self.inner.pipeline_latency_ms, duration);
    }

    // Recognition
    pub fn record_recognition(&self, success: bool, empty: bool) {
        self.inner.recognition_calls.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.inner
                .recognition_failures
                .fetch_add(1, Ordering::Relaxed);
        }
        if empty {
            self.inner.recognition_empty.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Translation
    pub fn record_translation(&self, success: bool, duration: Duration) {
        self.inner.translation_calls.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.inner
                .translation_failures
                .fetch_add(1, Ordering::Relaxed);
        }
        push_sample(&self.inner.translation_latency_ms, duration);
    }

    pub fn record_translation_skipped(&self) {
        self.inner
            .translation_skipped
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_breaker_rejection(&self) {
        self.inner
            .circuit_breaker_rejections
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner
            .endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let pipeline = self.inner.pipeline_latency_ms.read();
        let pipeline_latency_avg_ms = avg(&pipeline);
        let pipeline_latency_p95_ms = percentile(&pipeline, 0.95);
        drop(pipeline);

        let translation = self.inner.translation_latency_ms.read();
        let translation_latency_avg_ms = avg(&translation);
        drop(translation);

        let cache_hits = self.inner.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.inner.cache_misses.load(Ordering::Relaxed);
        let cache_total = cache_hits + cache_misses;
        let cache_hit_rate = if cache_total > 0 {
            cache_hits as f64 / cache_total as f64
        } else {
            0.0
        };

        let mut endpoints: Vec<(String, usize)> = self
            .inner
            .endpoint_counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        endpoints.sort();

        MetricsSnapshot {
            requests_total: self.inner.requests_total.load(Ordering::Relaxed),
            requests_failed: self.inner.requests_failed.load(Ordering::Relaxed),
            detections_total: self.inner.detections_total.load(Ordering::Relaxed),
            pipeline_latency_avg_ms,
            pipeline_latency_p95_ms,
            recognition_calls: self.inner.recognition_calls.load(Ordering::Relaxed),
            recognition_failures: self.inner.recognition_failures.load(Ordering::Relaxed),
            recognition_empty: self.inner.recognition_empty.load(Ordering::Relaxed),
            translation_calls: self.inner.translation_calls.load(Ordering::Relaxed),
            translation_failures: self.inner.translation_failures.load(Ordering::Relaxed),
            translation_skipped: self.inner.translation_skipped.load(Ordering::Relaxed),
            translation_latency_avg_ms,
            cache_hits,
            cache_misses,
            cache_hit_rate,
            circuit_breaker_rejections: self
                .inner
                .circuit_breaker_rejections
                .load(Ordering::Relaxed),
            endpoints,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = format!(
            r#"# HELP requests_total Detection requests handled
# TYPE requests_total counter
requests_total {}

# HELP requests_failed_total Detection requests that ended in an error
# TYPE requests_failed_total counter
requests_failed_total {}

# HELP detections_total Detections returned to callers
# TYPE detections_total counter
detections_total {}

# HELP pipeline_latency_ms Pipeline latency in milliseconds
# TYPE pipeline_latency_ms gauge
pipeline_latency_ms{{stat="avg"}} {}
pipeline_latency_ms{{stat="p95"}} {}

# HELP recognition_calls_total Region recognition attempts
# TYPE recognition_calls_total counter
recognition_calls_total {}
recognition_failures_total {}
recognition_empty_total {}

# HELP translation_calls_total Provider translation calls
# TYPE translation_calls_total counter
translation_calls_total {}
translation_failures_total {}
translation_skipped_total {}

# HELP translation_latency_avg_ms Average provider latency in milliseconds
# TYPE translation_latency_avg_ms gauge
translation_latency_avg_ms {}

# HELP cache_hit_rate Translation cache hit rate (0.0 to 1.0)
# TYPE cache_hit_rate gauge
cache_hit_rate {}

# HELP circuit_breaker_rejections_total Calls skipped by an open circuit
# TYPE circuit_breaker_rejections_total counter
circuit_breaker_rejections_total {}

# HELP uptime_seconds Process uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {}
"#,
            s.requests_total,
            s.requests_failed,
            s.detections_total,
            s.pipeline_latency_avg_ms,
            s.pipeline_latency_p95_ms,
            s.recognition_calls,
            s.recognition_failures,
            s.recognition_empty,
            s.translation_calls,
            s.translation_failures,
            s.translation_skipped,
            s.translation_latency_avg_ms,
            s.cache_hit_rate,
            s.circuit_breaker_rejections,
            s.uptime_seconds,
        );

        if !s.endpoints.is_empty() {
            out.push_str("\n# HELP http_requests_total HTTP requests per endpoint\n");
            out.push_str("# TYPE http_requests_total counter\n");
            for (endpoint, count) in &s.endpoints {
                out.push_str(&format!(
                    "http_requests_total{{endpoint=\"{}\"}} {}\n",
                    endpoint, count
                ));
            }
        }

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_total: usize,
    pub requests_failed: usize,
    pub detections_total: usize,
    pub pipeline_latency_avg_ms: u64,
    pub pipeline_latency_p95_ms: u64,
    pub recognition_calls: usize,
    pub recognition_failures: usize,
    pub recognition_empty: usize,
    pub translation_calls: usize,
    pub translation_failures: usize,
    pub translation_skipped: usize,
    pub translation_latency_avg_ms: u64,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub cache_hit_rate: f64,
    pub circuit_breaker_rejections: usize,
    pub endpoints: Vec<(String, usize)>,
    pub uptime_seconds: u64,
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}
