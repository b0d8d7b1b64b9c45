//! Per-component performance counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lock-free counters for one component type.
#[derive(Debug, Default)]
pub(crate) struct ComponentCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    rejections: AtomicU64,
    read_nanos: AtomicU64,
    write_nanos: AtomicU64,
}

impl ComponentCounters {
    pub(crate) fn record_read(&self, elapsed: Duration) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.read_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, elapsed: Duration) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.write_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, component: &str, entity_count: usize) -> ComponentStats {
        let read_count = self.reads.load(Ordering::Relaxed);
        let write_count = self.writes.load(Ordering::Relaxed);
        let total_read_time = Duration::from_nanos(self.read_nanos.load(Ordering::Relaxed));
        let total_write_time = Duration::from_nanos(self.write_nanos.load(Ordering::Relaxed));
        ComponentStats {
            component: component.to_string(),
            entity_count,
            read_count,
            write_count,
            validation_failures: self.rejections.load(Ordering::Relaxed),
            total_read_time,
            total_write_time,
            avg_read_time: average(total_read_time, read_count),
            avg_write_time: average(total_write_time, write_count),
        }
    }
}

fn average(total: Duration, count: u64) -> Duration {
    if count == 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos((total.as_nanos() / u128::from(count)) as u64)
    }
}

/// Counters for one component type at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStats {
    pub component: String,
    pub entity_count: usize,
    pub read_count: u64,
    /// Every write attempt, including rejected ones.
    pub write_count: u64,
    pub validation_failures: u64,
    pub total_read_time: Duration,
    pub total_write_time: Duration,
    pub avg_read_time: Duration,
    pub avg_write_time: Duration,
}

/// Counters for every component type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub components: Vec<ComponentStats>,
}

impl PerformanceReport {
    #[must_use]
    pub fn total_reads(&self) -> u64 {
        self.components.iter().map(|c| c.read_count).sum()
    }

    #[must_use]
    pub fn total_writes(&self) -> u64 {
        self.components.iter().map(|c| c.write_count).sum()
    }

    #[must_use]
    pub fn component(&self, name: &str) -> Option<&ComponentStats> {
        self.components.iter().find(|c| c.component == name)
    }
}

/// Outcome of [`ComponentStore::optimize`](crate::ComponentStore::optimize).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizeReport {
    pub component: String,
    /// Index entries that pointed at missing rows or stale values.
    pub removed_entries: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_averages() {
        let counters = ComponentCounters::default();
        counters.record_read(Duration::from_micros(10));
        counters.record_read(Duration::from_micros(30));
        counters.record_write(Duration::from_micros(5));
        counters.record_rejection();

        let stats = counters.snapshot("health", 3);
        assert_eq!(stats.read_count, 2);
        assert_eq!(stats.write_count, 1);
        assert_eq!(stats.validation_failures, 1);
        assert_eq!(stats.avg_read_time, Duration::from_micros(20));
        assert_eq!(stats.entity_count, 3);
    }

    #[test]
    fn test_empty_averages_are_zero() {
        let stats = ComponentCounters::default().snapshot("health", 0);
        assert_eq!(stats.avg_read_time, Duration::ZERO);
        assert_eq!(stats.avg_write_time, Duration::ZERO);
    }
}
