//! In-memory metrics backend.
//!
//! A small, thread-safe backend for tests and local development. Series
//! are keyed by the rendered label string; counters are atomics behind a
//! read-mostly lock, histograms keep cumulative bucket counts plus a sum
//! and an observation count per series.
//!
//! Absent measurements (`observe(labels, None)`) are dropped rather than
//! recorded as zero.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::backend::{Counter, Histogram, InstrumentSpec, MetricsBackend};
use crate::error::BackendError;
use crate::labels::LabelSet;

/// Thread-safe in-memory metrics store.
///
/// Instrument declaration is idempotent: redeclaring a name returns a
/// handle to the existing storage.
#[derive(Default)]
pub struct MemoryBackend {
    counters: RwLock<HashMap<String, Arc<MemoryCounter>>>,
    histograms: RwLock<HashMap<String, Arc<MemoryHistogram>>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter series; zero if never touched.
    pub fn counter_value(&self, name: &str, labels: &LabelSet) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.value(labels))
            .unwrap_or(0)
    }

    /// Number of observations recorded for a histogram series.
    pub fn observation_count(&self, name: &str, labels: &LabelSet) -> u64 {
        self.histograms
            .read()
            .get(name)
            .map(|h| h.count(labels))
            .unwrap_or(0)
    }

    /// Sum of the values observed for a histogram series.
    pub fn observation_sum(&self, name: &str, labels: &LabelSet) -> f64 {
        self.histograms
            .read()
            .get(name)
            .map(|h| h.sum(labels))
            .unwrap_or(0.0)
    }

    /// Snapshot of every series of a histogram, for inspection or export.
    pub fn histogram_snapshots(&self, name: &str) -> Vec<HistogramSnapshot> {
        self.histograms
            .read()
            .get(name)
            .map(|h| h.snapshots())
            .unwrap_or_default()
    }
}

impl MetricsBackend for MemoryBackend {
    fn define_counter(&self, spec: InstrumentSpec) -> Result<Arc<dyn Counter>, BackendError> {
        let mut counters = self.counters.write();
        let counter = counters
            .entry(spec.name.to_string())
            .or_insert_with(|| Arc::new(MemoryCounter::default()));
        Ok(Arc::clone(counter) as Arc<dyn Counter>)
    }

    fn define_histogram(&self, spec: InstrumentSpec) -> Result<Arc<dyn Histogram>, BackendError> {
        let buckets = spec.buckets.ok_or_else(|| {
            BackendError::new(format!("histogram `{}` declared without buckets", spec.name))
        })?;

        let mut histograms = self.histograms.write();
        let histogram = histograms
            .entry(spec.name.to_string())
            .or_insert_with(|| Arc::new(MemoryHistogram::new(buckets)));
        Ok(Arc::clone(histogram) as Arc<dyn Histogram>)
    }
}

/// Histogram data for a single label combination.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    /// Rendered label string, e.g. `controller="users",method="get"`.
    pub labels: String,
    /// Bucket upper bounds.
    pub buckets: Vec<f64>,
    /// Cumulative count per bucket.
    pub counts: Vec<u64>,
    /// Sum of all observed values.
    pub sum: f64,
    /// Total number of observations.
    pub count: u64,
}

#[derive(Default)]
struct MemoryCounter {
    values: RwLock<HashMap<String, AtomicU64>>,
}

impl MemoryCounter {
    fn add(&self, key: &str, value: u64) {
        // Fast path: the series already exists.
        {
            let values = self.values.read();
            if let Some(counter) = values.get(key) {
                counter.fetch_add(value, Ordering::Relaxed);
                return;
            }
        }

        // Slow path: create the series.
        let mut values = self.values.write();
        values
            .entry(key.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    fn value(&self, labels: &LabelSet) -> u64 {
        self.values
            .read()
            .get(&labels.render())
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Counter for MemoryCounter {
    fn increment(&self, labels: &LabelSet) -> Result<(), BackendError> {
        self.add(&labels.render(), 1);
        Ok(())
    }
}

struct Series {
    counts: Vec<AtomicU64>,
    sum: Mutex<f64>,
    count: AtomicU64,
}

impl Series {
    fn new(buckets: usize) -> Self {
        Self {
            counts: (0..buckets).map(|_| AtomicU64::new(0)).collect(),
            sum: Mutex::new(0.0),
            count: AtomicU64::new(0),
        }
    }
}

struct MemoryHistogram {
    buckets: Vec<f64>,
    series: RwLock<HashMap<String, Series>>,
}

impl MemoryHistogram {
    fn new(buckets: &[f64]) -> Self {
        Self {
            buckets: buckets.to_vec(),
            series: RwLock::new(HashMap::new()),
        }
    }

    fn with_series(&self, key: &str, f: impl FnOnce(&Series)) {
        // Fast path: the series already exists.
        {
            let series = self.series.read();
            if let Some(s) = series.get(key) {
                f(s);
                return;
            }
        }

        // Slow path: create the series.
        let mut series = self.series.write();
        let s = series
            .entry(key.to_string())
            .or_insert_with(|| Series::new(self.buckets.len()));
        f(s);
    }

    fn count(&self, labels: &LabelSet) -> u64 {
        self.series
            .read()
            .get(&labels.render())
            .map(|s| s.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn sum(&self, labels: &LabelSet) -> f64 {
        self.series
            .read()
            .get(&labels.render())
            .map(|s| *s.sum.lock())
            .unwrap_or(0.0)
    }

    fn snapshots(&self) -> Vec<HistogramSnapshot> {
        let series = self.series.read();
        series
            .iter()
            .map(|(labels, s)| HistogramSnapshot {
                labels: labels.clone(),
                buckets: self.buckets.clone(),
                counts: s
                    .counts
                    .iter()
                    .map(|c| c.load(Ordering::Relaxed))
                    .collect(),
                sum: *s.sum.lock(),
                count: s.count.load(Ordering::Relaxed),
            })
            .collect()
    }
}

impl Histogram for MemoryHistogram {
    fn observe(&self, labels: &LabelSet, value: Option<f64>) -> Result<(), BackendError> {
        let Some(value) = value else {
            return Ok(());
        };

        self.with_series(&labels.render(), |series| {
            // Cumulative buckets: a value lands in every bucket whose bound
            // is >= the value.
            for (i, &bound) in self.buckets.iter().enumerate() {
                if value <= bound {
                    series.counts[i].fetch_add(1, Ordering::Relaxed);
                }
            }
            *series.sum.lock() += value;
            series.count.fetch_add(1, Ordering::Relaxed);
        });
        Ok(())
    }
}
