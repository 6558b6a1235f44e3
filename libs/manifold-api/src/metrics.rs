//! Metrics provider contract.
//!
//! The core publishes named counters and gauges through this interface and
//! never talks to an exporter directly. [`AtomicMetrics`] is the in-process
//! default (snapshotable, used by tests and the status dump);
//! [`FacadeMetrics`] forwards to whatever recorder the `metrics` facade
//! crate has installed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// One named metric. Counters use `inc`/`add`, gauges additionally `dec`
/// and `set`.
pub trait Metric: Send + Sync {
    fn inc(&self);
    fn dec(&self);
    fn add(&self, delta: i64);
    fn set(&self, value: i64);
}

/// Pluggable provider: resolves a name to a metric handle. Resolving the
/// same name twice yields handles over the same underlying value.
pub trait MetricsProvider: Send + Sync {
    fn metric(&self, name: &str) -> Arc<dyn Metric>;
}

// ---------------------------------------------------------------------------
// Atomic in-process provider
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AtomicMetric {
    value: AtomicI64,
}

impl Metric for AtomicMetric {
    fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }
}

/// Default provider backed by process-local atomics.
#[derive(Default)]
pub struct AtomicMetrics {
    metrics: std::sync::RwLock<HashMap<String, Arc<AtomicMetric>>>,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a metric, `0` if it was never touched.
    pub fn value(&self, name: &str) -> i64 {
        let guard = match self.metrics.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .get(name)
            .map(|m| m.value.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sorted snapshot of every metric, for the status dump and tests.
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        let guard = match self.metrics.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out: Vec<_> = guard
            .iter()
            .map(|(name, m)| (name.clone(), m.value.load(Ordering::Relaxed)))
            .collect();
        out.sort();
        out
    }
}

impl MetricsProvider for AtomicMetrics {
    fn metric(&self, name: &str) -> Arc<dyn Metric> {
        {
            let guard = match self.metrics.read() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(existing) = guard.get(name) {
                return existing.clone();
            }
        }
        let mut guard = match self.metrics.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicMetric::default()))
            .clone()
    }
}

// ---------------------------------------------------------------------------
// `metrics` facade bridge
// ---------------------------------------------------------------------------

struct FacadeMetric {
    gauge: metrics::Gauge,
}

impl Metric for FacadeMetric {
    fn inc(&self) {
        self.gauge.increment(1.0);
    }

    fn dec(&self) {
        self.gauge.decrement(1.0);
    }

    fn add(&self, delta: i64) {
        self.gauge.increment(delta as f64);
    }

    fn set(&self, value: i64) {
        self.gauge.set(value as f64);
    }
}

/// Provider publishing through the `metrics` facade crate, so any installed
/// recorder (Prometheus exporter, logging recorder, ...) picks the values
/// up.
#[derive(Default)]
pub struct FacadeMetrics;

impl MetricsProvider for FacadeMetrics {
    fn metric(&self, name: &str) -> Arc<dyn Metric> {
        Arc::new(FacadeMetric {
            gauge: metrics::gauge!(name.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_resolves_to_same_value() {
        let provider = AtomicMetrics::new();
        let a = provider.metric("routed");
        let b = provider.metric("routed");
        a.inc();
        b.add(4);
        assert_eq!(provider.value("routed"), 5);
    }

    #[test]
    fn set_and_dec() {
        let provider = AtomicMetrics::new();
        let m = provider.metric("active");
        m.set(10);
        m.dec();
        assert_eq!(provider.value("active"), 9);
        assert_eq!(provider.value("untouched"), 0);
    }

    #[test]
    fn snapshot_is_sorted() {
        let provider = AtomicMetrics::new();
        provider.metric("b").inc();
        provider.metric("a").inc();
        let names: Vec<_> = provider.snapshot().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
