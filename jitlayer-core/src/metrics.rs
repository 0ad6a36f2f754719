//! Layer metrics
//!
//! Lightweight counters for compile-layer operations.
//!
//! # Design Goals:
//! - Lock-free atomic counters
//! - Zero-allocation in hot paths
//! - Shared by the layer and every resolver context it creates

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counters for one compile layer
#[derive(Default)]
pub struct LayerMetrics {
    // Registry
    pub module_sets_added: AtomicU64,
    pub module_sets_removed: AtomicU64,
    pub registration_time_ns: AtomicU64,

    // Lookup
    pub lookups: AtomicU64,
    pub lookup_hits: AtomicU64,
    pub lookup_time_ns: AtomicU64,
    pub mangles: AtomicU64,

    // Resolver callbacks
    pub resolver_invocations: AtomicU64,
    pub resolver_panics: AtomicU64,
}

impl LayerMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a successful module set registration
    pub fn record_registration(&self, duration: Duration) {
        self.module_sets_added.fetch_add(1, Ordering::Relaxed);
        self.registration_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_removal(&self) {
        self.module_sets_removed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a lookup and whether it found anything
    pub fn record_lookup(&self, duration: Duration, hit: bool) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.lookup_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.lookup_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_mangle(&self) {
        self.mangles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolver_invocation(&self) {
        self.resolver_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resolver_panic(&self) {
        self.resolver_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let added = self.module_sets_added.load(Ordering::Relaxed);
        let removed = self.module_sets_removed.load(Ordering::Relaxed);
        MetricsSnapshot {
            module_sets_added: added,
            module_sets_removed: removed,
            resident_module_sets: added.saturating_sub(removed),
            avg_registration_ms: avg_duration_ms(
                &self.module_sets_added,
                &self.registration_time_ns,
            ),
            lookups: self.lookups.load(Ordering::Relaxed),
            lookup_hits: self.lookup_hits.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
            avg_lookup_us: avg_duration_ms(&self.lookups, &self.lookup_time_ns) * 1_000.0,
            mangles: self.mangles.load(Ordering::Relaxed),
            resolver_invocations: self.resolver_invocations.load(Ordering::Relaxed),
            resolver_panics: self.resolver_panics.load(Ordering::Relaxed),
        }
    }

    /// Lookup hit rate as a percentage
    fn hit_rate(&self) -> f64 {
        let lookups = self.lookups.load(Ordering::Relaxed);
        if lookups == 0 {
            return 0.0;
        }
        (self.lookup_hits.load(Ordering::Relaxed) as f64) / (lookups as f64) * 100.0
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        for counter in [
            &self.module_sets_added,
            &self.module_sets_removed,
            &self.registration_time_ns,
            &self.lookups,
            &self.lookup_hits,
            &self.lookup_time_ns,
            &self.mangles,
            &self.resolver_invocations,
            &self.resolver_panics,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn avg_duration_ms(count: &AtomicU64, total_ns: &AtomicU64) -> f64 {
    let c = count.load(Ordering::Relaxed);
    if c == 0 {
        return 0.0;
    }
    (total_ns.load(Ordering::Relaxed) as f64) / (c as f64) / 1_000_000.0
}

/// A point-in-time snapshot of layer metrics
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub module_sets_added: u64,
    pub module_sets_removed: u64,
    pub resident_module_sets: u64,
    pub avg_registration_ms: f64,
    pub lookups: u64,
    pub lookup_hits: u64,
    pub hit_rate: f64,
    pub avg_lookup_us: f64,
    pub mangles: u64,
    pub resolver_invocations: u64,
    pub resolver_panics: u64,
}

impl MetricsSnapshot {
    /// Print a human-readable report
    pub fn print_report(&self) {
        println!("╔═══════════════════════════════════════════════════════════╗");
        println!("║         Compile Layer Metrics Report                      ║");
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Module Sets                                               ║");
        println!("║   Added:       {:>8} (avg: {:>8.3} ms)              ║",
                 self.module_sets_added, self.avg_registration_ms);
        println!("║   Removed:     {:>8}                                   ║",
                 self.module_sets_removed);
        println!("║   Resident:    {:>8}                                   ║",
                 self.resident_module_sets);
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Symbol Lookup                                             ║");
        println!("║   Lookups:     {:>8} (avg: {:>8.3} us)              ║",
                 self.lookups, self.avg_lookup_us);
        println!("║   Hits:        {:>8} (rate: {:>6.2}%)               ║",
                 self.lookup_hits, self.hit_rate);
        println!("║   Mangles:     {:>8}                                   ║",
                 self.mangles);
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Resolver Callbacks                                        ║");
        println!("║   Invocations: {:>8}                                   ║",
                 self.resolver_invocations);
        println!("║   Panics:      {:>8}                                   ║",
                 self.resolver_panics);
        println!("╚═══════════════════════════════════════════════════════════╝");
    }
}

/// A scoped timer that automatically records duration on drop
pub struct ScopedTimer<'a> {
    start: Instant,
    metrics: &'a LayerMetrics,
    metric_type: TimerType,
    succeeded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerType {
    Registration,
    Lookup,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(metrics: &'a LayerMetrics, metric_type: TimerType) -> Self {
        Self {
            start: Instant::now(),
            metrics,
            metric_type,
            succeeded: false,
        }
    }

    /// Mark the operation as successful: the registration completed, or the
    /// lookup found its symbol. Failed registrations are not recorded.
    pub fn succeed(&mut self) {
        self.succeeded = true;
    }
}

impl<'a> Drop for ScopedTimer<'a> {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        match self.metric_type {
            TimerType::Registration if self.succeeded => {
                self.metrics.record_registration(duration)
            }
            TimerType::Registration => {}
            TimerType::Lookup => self.metrics.record_lookup(duration, self.succeeded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = LayerMetrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.module_sets_added, 0);
        assert_eq!(snapshot.lookups, 0);
        assert_eq!(snapshot.hit_rate, 0.0);
    }

    #[test]
    fn test_record_operations() {
        let metrics = LayerMetrics::new();

        metrics.record_registration(Duration::from_millis(100));
        metrics.record_registration(Duration::from_millis(200));
        metrics.record_removal();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.module_sets_added, 2);
        assert_eq!(snapshot.resident_module_sets, 1);
        assert_eq!(snapshot.avg_registration_ms, 150.0);
    }

    #[test]
    fn test_hit_rate() {
        let metrics = LayerMetrics::new();

        metrics.record_lookup(Duration::from_micros(1), true);
        metrics.record_lookup(Duration::from_micros(1), false);
        metrics.record_lookup(Duration::from_micros(1), false);
        metrics.record_lookup(Duration::from_micros(1), true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.lookups, 4);
        assert_eq!(snapshot.lookup_hits, 2);
        assert_eq!(snapshot.hit_rate, 50.0);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = LayerMetrics::new();
        metrics.record_mangle();
        metrics.record_resolver_invocation();
        metrics.record_resolver_panic();
        assert_eq!(metrics.snapshot().resolver_panics, 1);

        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.mangles, 0);
        assert_eq!(snapshot.resolver_invocations, 0);
        assert_eq!(snapshot.resolver_panics, 0);
    }

    #[tokio::test]
    async fn test_scoped_timer() {
        let metrics = LayerMetrics::new();

        {
            let mut timer = ScopedTimer::new(&metrics, TimerType::Lookup);
            tokio::time::sleep(Duration::from_millis(10)).await;
            timer.succeed();
        }
        {
            let _failed = ScopedTimer::new(&metrics, TimerType::Registration);
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.lookups, 1);
        assert_eq!(snapshot.lookup_hits, 1);
        assert!(snapshot.avg_lookup_us >= 10_000.0);
        assert_eq!(snapshot.module_sets_added, 0);
    }
}
