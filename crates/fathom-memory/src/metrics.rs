//! Per-operation, per-bank latency and outcome counters.

use dashmap::DashMap;
use std::time::Duration;

/// Operation names reported by the memory graph.
pub mod op {
    /// A retain call.
    pub const RETAIN: &str = "retain";
    /// A search call.
    pub const SEARCH: &str = "search";
    /// A single entity resolution.
    pub const RESOLVE: &str = "resolve";
    /// A link construction run (build or causal).
    pub const LINK: &str = "link";
    /// A classification job.
    pub const CLASSIFY: &str = "classify";
    /// Committing one classifier opinion.
    pub const OPINION: &str = "opinion";
}

/// Receives one record per finished operation.
pub trait MetricsCollector: Send + Sync {
    /// Record an operation outcome. `budget` is the search budget label, if any.
    fn record_operation(
        &self,
        operation: &str,
        bank_id: &str,
        budget: Option<&str>,
        elapsed: Duration,
        success: bool,
    );
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {
    fn record_operation(&self, _: &str, _: &str, _: Option<&str>, _: Duration, _: bool) {}
}

/// Aggregated figures for one (operation, bank) pair.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OperationStats {
    /// Completed operations.
    pub count: u64,
    /// Operations that returned an error.
    pub errors: u64,
    /// Sum of latencies.
    pub total: Duration,
    /// Slowest operation.
    pub max: Duration,
}

impl OperationStats {
    /// Mean latency, zero when nothing was recorded.
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

/// Keeps aggregates in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    ops: DashMap<(String, String), OperationStats>,
}

impl InMemoryMetrics {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Figures for one operation in one bank.
    pub fn get(&self, operation: &str, bank_id: &str) -> Option<OperationStats> {
        self.ops
            .get(&(operation.to_string(), bank_id.to_string()))
            .map(|s| *s)
    }

    /// Every (operation, bank) pair with its figures, sorted.
    pub fn snapshot(&self) -> Vec<(String, String, OperationStats)> {
        let mut out: Vec<_> = self
            .ops
            .iter()
            .map(|e| (e.key().0.clone(), e.key().1.clone(), *e.value()))
            .collect();
        out.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        out
    }
}

impl MetricsCollector for InMemoryMetrics {
    fn record_operation(
        &self,
        operation: &str,
        bank_id: &str,
        _budget: Option<&str>,
        elapsed: Duration,
        success: bool,
    ) {
        let mut stats = self
            .ops
            .entry((operation.to_string(), bank_id.to_string()))
            .or_default();
        stats.count += 1;
        if !success {
            stats.errors += 1;
        }
        stats.total += elapsed;
        stats.max = stats.max.max(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregates_per_bank() {
        let m = InMemoryMetrics::new();
        m.record_operation(op::SEARCH, "a", Some("mid"), Duration::from_millis(10), true);
        m.record_operation(op::SEARCH, "a", Some("mid"), Duration::from_millis(30), false);
        m.record_operation(op::SEARCH, "b", None, Duration::from_millis(5), true);

        let a = m.get(op::SEARCH, "a").unwrap();
        assert_eq!(a.count, 2);
        assert_eq!(a.errors, 1);
        assert_eq!(a.max, Duration::from_millis(30));
        assert_eq!(a.mean(), Duration::from_millis(20));
        assert_eq!(m.get(op::SEARCH, "b").unwrap().count, 1);
        assert!(m.get(op::RETAIN, "a").is_none());
        assert_eq!(m.snapshot().len(), 2);
    }
}
