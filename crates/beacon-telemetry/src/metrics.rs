//! In-memory metrics, served as a JSON snapshot on `/metrics`.
//!
//! Every series is keyed by kind, name and sorted labels, so
//! `[("a", "1"), ("b", "2")]` and `[("b", "2"), ("a", "1")]` hit the same
//! series.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

/// Observations kept per histogram for percentile computation.
const HISTOGRAM_WINDOW: usize = 1024;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct SeriesKey {
    kind: MetricType,
    name: String,
    labels: BTreeMap<String, String>,
}

impl SeriesKey {
    fn new(kind: MetricType, name: &str, labels: &[(&str, &str)]) -> Self {
        Self {
            kind,
            name: name.to_owned(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        }
    }
}

enum Series {
    Counter(AtomicU64),
    /// f64 bits.
    Gauge(AtomicU64),
    Histogram(Mutex<VecDeque<f64>>),
}

impl Series {
    fn empty(kind: MetricType) -> Self {
        match kind {
            MetricType::Counter => Self::Counter(AtomicU64::new(0)),
            MetricType::Gauge => Self::Gauge(AtomicU64::new(0f64.to_bits())),
            MetricType::Histogram => Self::Histogram(Mutex::new(VecDeque::new())),
        }
    }

    fn value(&self) -> f64 {
        match self {
            Self::Counter(n) => n.load(Ordering::Relaxed) as f64,
            Self::Gauge(bits) => f64::from_bits(bits.load(Ordering::Relaxed)),
            Self::Histogram(_) => self.summary().p50,
        }
    }

    fn summary(&self) -> HistogramSummary {
        let Self::Histogram(window) = self else {
            return HistogramSummary::default();
        };
        let mut sorted: Vec<f64> = window.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSummary::default();
        }
        sorted.sort_by(f64::total_cmp);
        let count = sorted.len();
        let rank = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];
        HistogramSummary {
            count: count as u64,
            sum: sorted.iter().sum(),
            p50: rank(0.5),
            p95: rank(0.95),
            p99: rank(0.99),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricEntry {
    pub name: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub metric_type: MetricType,
    /// Current value; the median for histograms.
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<HistogramSummary>,
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricsReport {
    pub timestamp: DateTime<Utc>,
    pub metrics: Vec<MetricEntry>,
}

/// Thread-safe in-memory metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    series: RwLock<HashMap<SeriesKey, Series>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on the series, creating it on first use. The common path only
    /// takes the read lock.
    fn with_series<R>(&self, key: SeriesKey, f: impl FnOnce(&Series) -> R) -> R {
        if let Some(series) = self.series.read().get(&key) {
            return f(series);
        }
        let mut all = self.series.write();
        let series = all.entry(key).or_insert_with_key(|k| Series::empty(k.kind));
        f(series)
    }

    fn read_series<R>(&self, key: &SeriesKey, f: impl FnOnce(&Series) -> R) -> Option<R> {
        self.series.read().get(key).map(f)
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.with_series(SeriesKey::new(MetricType::Counter, name, labels), |s| {
            if let Series::Counter(count) = s {
                count.fetch_add(n, Ordering::Relaxed);
            }
        });
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.with_series(SeriesKey::new(MetricType::Gauge, name, labels), |s| {
            if let Series::Gauge(bits) = s {
                bits.store(value.to_bits(), Ordering::Relaxed);
            }
        });
    }

    /// Record an observation, evicting the oldest once the window is full.
    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.with_series(SeriesKey::new(MetricType::Histogram, name, labels), |s| {
            if let Series::Histogram(window) = s {
                let mut window = window.lock();
                if window.len() == HISTOGRAM_WINDOW {
                    window.pop_front();
                }
                window.push_back(value);
            }
        });
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.read_series(&SeriesKey::new(MetricType::Counter, name, labels), |s| s.value() as u64)
            .unwrap_or(0)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.read_series(&SeriesKey::new(MetricType::Gauge, name, labels), Series::value)
            .unwrap_or(0.0)
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.read_series(&SeriesKey::new(MetricType::Histogram, name, labels), Series::summary)
            .unwrap_or_default()
    }

    /// Snapshot every series, sorted by name for stable output.
    pub fn report(&self) -> MetricsReport {
        let mut metrics: Vec<MetricEntry> = self
            .series
            .read()
            .iter()
            .map(|(key, series)| MetricEntry {
                name: key.name.clone(),
                labels: key.labels.clone(),
                metric_type: key.kind,
                value: series.value(),
                summary: matches!(key.kind, MetricType::Histogram).then(|| series.summary()),
            })
            .collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        MetricsReport {
            timestamp: Utc::now(),
            metrics,
        }
    }
}
