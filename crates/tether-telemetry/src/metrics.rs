use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Observations kept per histogram; older ones are discarded first.
const HISTOGRAM_WINDOW: usize = 4096;

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        labels.sort();
        Self {
            name: name.to_owned(),
            labels,
        }
    }

    fn labels_map(&self) -> HashMap<String, String> {
        self.labels.iter().cloned().collect()
    }
}

/// f64 stored as raw bits so updates stay lock-free.
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new() -> Self {
        Self(AtomicU64::new(0f64.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }

    fn add(&self, delta: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }
}

struct Window(Mutex<VecDeque<f64>>);

impl Window {
    fn new() -> Self {
        Self(Mutex::new(VecDeque::new()))
    }

    fn push(&self, v: f64) {
        let mut obs = self.0.lock();
        if obs.len() == HISTOGRAM_WINDOW {
            let _ = obs.pop_front();
        }
        obs.push_back(v);
    }

    fn summary(&self) -> HistogramSummary {
        let mut sorted: Vec<f64> = self.0.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSummary::default();
        }
        sorted.sort_by(f64::total_cmp);
        let rank = |q: f64| {
            let idx = ((sorted.len() as f64 * q).ceil() as usize).saturating_sub(1);
            sorted[idx.min(sorted.len() - 1)]
        };
        HistogramSummary {
            count: sorted.len() as u64,
            sum: sorted.iter().sum(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p50: rank(0.50),
            p95: rank(0.95),
            p99: rank(0.99),
        }
    }
}

/// Nearest-rank summary over the retained observation window.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CounterValue {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub value: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GaugeValue {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub value: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramValue {
    pub name: String,
    pub labels: HashMap<String, String>,
    #[serde(flatten)]
    pub summary: HistogramSummary,
}

/// Point-in-time view of every metric, sorted by name then labels.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<CounterValue>,
    pub gauges: Vec<GaugeValue>,
    pub histograms: Vec<HistogramValue>,
}

/// Look up `key`, inserting a fresh metric on first use, and apply `f`.
fn with_metric<M>(
    map: &RwLock<HashMap<MetricKey, M>>,
    key: MetricKey,
    make: fn() -> M,
    f: impl FnOnce(&M),
) {
    if let Some(m) = map.read().get(&key) {
        f(m);
        return;
    }
    let mut write = map.write();
    f(write.entry(key).or_insert_with(make));
}

fn sorted_entries<M, T>(
    map: &RwLock<HashMap<MetricKey, M>>,
    project: impl Fn(&MetricKey, &M) -> T,
) -> Vec<T> {
    let read = map.read();
    let mut keys: Vec<&MetricKey> = read.keys().collect();
    keys.sort();
    keys.into_iter()
        .filter_map(|k| read.get(k).map(|m| project(k, m)))
        .collect()
}

/// Thread-safe in-memory metrics recorder.
///
/// Metrics are keyed by name plus label set; label order does not matter.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, AtomicU64>>,
    gauges: RwLock<HashMap<MetricKey, AtomicF64>>,
    histograms: RwLock<HashMap<MetricKey, Window>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        with_metric(&self.counters, MetricKey::new(name, labels), || AtomicU64::new(0), |c| {
            let _ = c.fetch_add(n, Ordering::Relaxed);
        });
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_metric(&self.gauges, MetricKey::new(name, labels), AtomicF64::new, |g| g.store(value));
    }

    pub fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        with_metric(&self.gauges, MetricKey::new(name, labels), AtomicF64::new, |g| g.add(delta));
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_metric(&self.histograms, MetricKey::new(name, labels), Window::new, |h| h.push(value));
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .get(&MetricKey::new(name, labels))
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges
            .read()
            .get(&MetricKey::new(name, labels))
            .map_or(0.0, AtomicF64::load)
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .read()
            .get(&MetricKey::new(name, labels))
            .map(Window::summary)
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: sorted_entries(&self.counters, |k, c| CounterValue {
                name: k.name.clone(),
                labels: k.labels_map(),
                value: c.load(Ordering::Relaxed),
            }),
            gauges: sorted_entries(&self.gauges, |k, g| GaugeValue {
                name: k.name.clone(),
                labels: k.labels_map(),
                value: g.load(),
            }),
            histograms: sorted_entries(&self.histograms, |k, h| HistogramValue {
                name: k.name.clone(),
                labels: k.labels_map(),
                summary: h.summary(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_are_keyed_by_labels() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("connections_rejected_total", &[("reason", "auth")], 1);
        recorder.counter_inc("connections_rejected_total", &[("reason", "auth")], 2);
        recorder.counter_inc("connections_rejected_total", &[("reason", "limit")], 1);

        assert_eq!(recorder.counter_get("connections_rejected_total", &[("reason", "auth")]), 3);
        assert_eq!(recorder.counter_get("connections_rejected_total", &[("reason", "limit")]), 1);
        assert_eq!(recorder.counter_get("connections_rejected_total", &[]), 0);
    }

    #[test]
    fn label_order_is_irrelevant() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("frames", &[("a", "1"), ("b", "2")], 1);
        recorder.counter_inc("frames", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(recorder.counter_get("frames", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn gauge_moves_both_ways() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_set("connections_active", &[], 4.0);
        recorder.gauge_add("connections_active", &[], 2.0);
        recorder.gauge_add("connections_active", &[], -5.0);
        assert_eq!(recorder.gauge_get("connections_active", &[]), 1.0);
    }

    #[test]
    fn histogram_nearest_rank() {
        let recorder = MetricsRecorder::new();
        for v in 1..=100 {
            recorder.histogram_observe("broadcast_fanout", &[], f64::from(v));
        }
        let summary = recorder.histogram_summary("broadcast_fanout", &[]);
        assert_eq!(summary.count, 100);
        assert_eq!(summary.sum, 5050.0);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 100.0);
        assert_eq!(summary.p50, 50.0);
        assert_eq!(summary.p95, 95.0);
        assert_eq!(summary.p99, 99.0);
    }

    #[test]
    fn histogram_window_is_bounded() {
        let recorder = MetricsRecorder::new();
        for v in 0..(HISTOGRAM_WINDOW + 10) {
            recorder.histogram_observe("h", &[], v as f64);
        }
        let summary = recorder.histogram_summary("h", &[]);
        assert_eq!(summary.count, HISTOGRAM_WINDOW as u64);
        assert_eq!(summary.min, 10.0);
    }

    #[test]
    fn missing_histogram_is_empty() {
        let recorder = MetricsRecorder::new();
        assert_eq!(recorder.histogram_summary("nope", &[]), HistogramSummary::default());
    }

    #[test]
    fn snapshot_is_sorted_and_serializable() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("b_total", &[], 1);
        recorder.counter_inc("a_total", &[("k", "v")], 7);
        recorder.gauge_set("connections_active", &[], 3.0);
        recorder.histogram_observe("broadcast_fanout", &[], 2.0);

        let snapshot = recorder.snapshot();
        let names: Vec<&str> = snapshot.counters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["a_total", "b_total"]);
        assert_eq!(snapshot.counters[0].labels["k"], "v");

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["gauges"][0]["value"], 3.0);
        assert_eq!(json["histograms"][0]["count"], 1);
    }

    #[test]
    fn concurrent_increments() {
        let recorder = Arc::new(MetricsRecorder::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&recorder);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        r.counter_inc("frames_relayed_total", &[], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(recorder.counter_get("frames_relayed_total", &[]), 8000);
    }
}
