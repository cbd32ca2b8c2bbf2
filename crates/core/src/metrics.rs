//! In-process metrics, injected into each engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const CAPABILITY_INVOCATIONS: &str = "capability_invocations_total";
pub const STEP_ERRORS: &str = "step_errors_total";
pub const EXECUTIONS_FINISHED: &str = "executions_finished_total";
pub const EXECUTIONS_IN_FLIGHT: &str = "executions_in_flight";
pub const EXECUTION_DURATION: &str = "execution_duration_seconds";
pub const TRIGGER_REGISTRATION_FAILURES: &str = "trigger_registration_failures_total";

/// Metric labels, ordered so equal label sets share a key
pub type Labels = BTreeMap<String, String>;

/// Build a label set from string pairs
pub fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Default histogram buckets, in seconds
const DEFAULT_BUCKETS: [f64; 10] = [0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Counter {
    pub name: String,
    pub value: u64,
    pub labels: Labels,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gauge {
    pub name: String,
    pub value: f64,
    pub labels: Labels,
    pub last_updated: DateTime<Utc>,
}

/// Cumulative histogram: `counts[i]` holds observations `<= buckets[i]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Histogram {
    pub name: String,
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
    pub labels: Labels,
    pub last_updated: DateTime<Utc>,
}

impl Histogram {
    fn new(name: &str, labels: Labels) -> Self {
        Self {
            name: name.to_string(),
            buckets: DEFAULT_BUCKETS.to_vec(),
            counts: vec![0; DEFAULT_BUCKETS.len()],
            sum: 0.0,
            count: 0,
            labels,
            last_updated: Utc::now(),
        }
    }

    fn observe(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        for (bucket, count) in self.buckets.iter().zip(self.counts.iter_mut()) {
            if value <= *bucket {
                *count += 1;
            }
        }
        self.last_updated = Utc::now();
    }

    /// Upper bound of the bucket holding the p-th percentile
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 || !(0.0..=100.0).contains(&p) {
            return None;
        }

        let target = ((self.count as f64) * (p / 100.0)).ceil() as u64;
        self.buckets
            .iter()
            .zip(&self.counts)
            .find(|(_, count)| **count >= target)
            .map(|(bucket, _)| *bucket)
    }

    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Everything recorded so far
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<Counter>,
    pub gauges: Vec<Gauge>,
    pub histograms: Vec<Histogram>,
}

#[derive(Default)]
pub struct MetricsCollector {
    counters: Mutex<BTreeMap<String, Counter>>,
    gauges: Mutex<BTreeMap<String, Gauge>>,
    histograms: Mutex<BTreeMap<String, Histogram>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicking recorder leaves plain numbers behind, still usable
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, labels: Labels) {
        self.increment_counter_by(name, 1, labels);
    }

    pub fn increment_counter_by(&self, name: &str, value: u64, labels: Labels) {
        let key = metric_key(name, &labels);
        let now = Utc::now();
        lock(&self.counters)
            .entry(key)
            .and_modify(|c| {
                c.value += value;
                c.last_updated = now;
            })
            .or_insert_with(|| Counter {
                name: name.to_string(),
                value,
                labels,
                last_updated: now,
            });
    }

    pub fn set_gauge(&self, name: &str, value: f64, labels: Labels) {
        let key = metric_key(name, &labels);
        let now = Utc::now();
        lock(&self.gauges).insert(
            key,
            Gauge {
                name: name.to_string(),
                value,
                labels,
                last_updated: now,
            },
        );
    }

    /// Add `delta` (possibly negative) to a gauge, starting from zero
    pub fn add_gauge(&self, name: &str, delta: f64, labels: Labels) {
        let key = metric_key(name, &labels);
        let now = Utc::now();
        lock(&self.gauges)
            .entry(key)
            .and_modify(|g| {
                g.value += delta;
                g.last_updated = now;
            })
            .or_insert_with(|| Gauge {
                name: name.to_string(),
                value: delta,
                labels,
                last_updated: now,
            });
    }

    pub fn observe_histogram(&self, name: &str, value: f64, labels: Labels) {
        let key = metric_key(name, &labels);
        lock(&self.histograms)
            .entry(key)
            .or_insert_with(|| Histogram::new(name, labels))
            .observe(value);
    }

    pub fn counter(&self, name: &str, labels: &Labels) -> Option<u64> {
        lock(&self.counters)
            .get(&metric_key(name, labels))
            .map(|c| c.value)
    }

    pub fn gauge(&self, name: &str, labels: &Labels) -> Option<f64> {
        lock(&self.gauges).get(&metric_key(name, labels)).map(|g| g.value)
    }

    pub fn histogram(&self, name: &str, labels: &Labels) -> Option<Histogram> {
        lock(&self.histograms).get(&metric_key(name, labels)).cloned()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: lock(&self.counters).values().cloned().collect(),
            gauges: lock(&self.gauges).values().cloned().collect(),
            histograms: lock(&self.histograms).values().cloned().collect(),
        }
    }
}

fn metric_key(name: &str, labels: &Labels) -> String {
    if labels.is_empty() {
        return name.to_string();
    }

    let label_str = labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");

    format!("{}:{}", name, label_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_split_by_labels() {
        let metrics = MetricsCollector::new();
        let completed = labels(&[("status", "completed"), ("workflow_id", "wf-1")]);
        let errored = labels(&[("workflow_id", "wf-1"), ("status", "errored")]);

        metrics.increment_counter(EXECUTIONS_FINISHED, completed.clone());
        metrics.increment_counter(EXECUTIONS_FINISHED, completed.clone());
        metrics.increment_counter_by(EXECUTIONS_FINISHED, 3, errored.clone());

        assert_eq!(metrics.counter(EXECUTIONS_FINISHED, &completed), Some(2));
        assert_eq!(metrics.counter(EXECUTIONS_FINISHED, &errored), Some(3));
        assert_eq!(metrics.counter(EXECUTIONS_FINISHED, &Labels::new()), None);
    }

    #[test]
    fn test_gauge_moves_both_ways() {
        let metrics = MetricsCollector::new();
        let l = labels(&[("workflow_id", "wf-1")]);

        metrics.add_gauge(EXECUTIONS_IN_FLIGHT, 1.0, l.clone());
        metrics.add_gauge(EXECUTIONS_IN_FLIGHT, 1.0, l.clone());
        metrics.add_gauge(EXECUTIONS_IN_FLIGHT, -1.0, l.clone());
        assert_eq!(metrics.gauge(EXECUTIONS_IN_FLIGHT, &l), Some(1.0));

        metrics.set_gauge(EXECUTIONS_IN_FLIGHT, 7.0, l.clone());
        assert_eq!(metrics.gauge(EXECUTIONS_IN_FLIGHT, &l), Some(7.0));
    }

    #[test]
    fn test_histogram_stats() {
        let metrics = MetricsCollector::new();
        for value in [0.25, 0.25, 0.5, 2.0] {
            metrics.observe_histogram(EXECUTION_DURATION, value, Labels::new());
        }

        let h = metrics.histogram(EXECUTION_DURATION, &Labels::new()).unwrap();
        assert_eq!(h.count, 4);
        assert_eq!(h.average(), Some(0.75));
        assert_eq!(h.percentile(50.0), Some(0.5));
        assert_eq!(h.percentile(100.0), Some(5.0));
        assert_eq!(h.percentile(101.0), None);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = MetricsCollector::new();
        metrics.increment_counter(CAPABILITY_INVOCATIONS, Labels::new());
        metrics.add_gauge(EXECUTIONS_IN_FLIGHT, 1.0, Labels::new());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counters.len(), 1);
        assert_eq!(snapshot.gauges.len(), 1);
        assert!(snapshot.histograms.is_empty());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["counters"][0]["name"], CAPABILITY_INVOCATIONS);
    }
}
