//! Prometheus metrics for pool operations.
//!
//! The registry is owned here and exposed to the host; serving a
//! `/metrics` endpoint is the host's business.

use std::sync::Arc;

use prometheus::{core::Collector, CounterVec, GaugeVec, Opts, Registry};

/// Metrics handle for pool operations. Cloneable; all instruments are
/// labeled by pool name.
#[derive(Clone)]
pub struct PoolMetrics {
    registry: Arc<Registry>,

    objects_queued: CounterVec,
    objects_claimed: CounterVec,
    objects_released: CounterVec,
    objects_requeued: CounterVec,
    objects_reclaimed: CounterVec,
    objects_promoted: CounterVec,

    claims_outstanding: GaugeVec,
}

/// Helper to register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

impl PoolMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let objects_queued = register(
            &registry,
            CounterVec::new(
                Opts::new("corral_objects_queued_total", "Objects newly queued"),
                &["pool"],
            )?,
        );
        let objects_claimed = register(
            &registry,
            CounterVec::new(
                Opts::new("corral_objects_claimed_total", "Objects claimed"),
                &["pool"],
            )?,
        );
        let objects_released = register(
            &registry,
            CounterVec::new(
                Opts::new(
                    "corral_objects_released_total",
                    "Objects permanently released",
                ),
                &["pool"],
            )?,
        );
        let objects_requeued = register(
            &registry,
            CounterVec::new(
                Opts::new(
                    "corral_objects_requeued_total",
                    "Objects returned to the queue by consumers",
                ),
                &["pool"],
            )?,
        );
        let objects_reclaimed = register(
            &registry,
            CounterVec::new(
                Opts::new(
                    "corral_objects_reclaimed_total",
                    "Objects requeued by the janitor after lease expiry",
                ),
                &["pool"],
            )?,
        );
        let objects_promoted = register(
            &registry,
            CounterVec::new(
                Opts::new(
                    "corral_objects_promoted_total",
                    "Objects promoted from the delayed queue",
                ),
                &["pool"],
            )?,
        );
        let claims_outstanding = register(
            &registry,
            GaugeVec::new(
                Opts::new(
                    "corral_claims_outstanding",
                    "Claims emitted by a dispatcher and not yet terminal",
                ),
                &["pool"],
            )?,
        );

        Ok(Self {
            registry: Arc::new(registry),
            objects_queued,
            objects_claimed,
            objects_released,
            objects_requeued,
            objects_reclaimed,
            objects_promoted,
            claims_outstanding,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_queued(&self, pool: &str, count: u64) {
        self.objects_queued
            .with_label_values(&[pool])
            .inc_by(count as f64);
    }

    pub fn record_claimed(&self, pool: &str, count: u64) {
        self.objects_claimed
            .with_label_values(&[pool])
            .inc_by(count as f64);
    }

    pub fn record_released(&self, pool: &str, count: u64) {
        self.objects_released
            .with_label_values(&[pool])
            .inc_by(count as f64);
    }

    pub fn record_requeued(&self, pool: &str, count: u64) {
        self.objects_requeued
            .with_label_values(&[pool])
            .inc_by(count as f64);
    }

    pub fn record_cleaned(&self, pool: &str, reclaimed: u64, promoted: u64) {
        self.objects_reclaimed
            .with_label_values(&[pool])
            .inc_by(reclaimed as f64);
        self.objects_promoted
            .with_label_values(&[pool])
            .inc_by(promoted as f64);
    }

    pub fn incr_outstanding(&self, pool: &str) {
        self.claims_outstanding.with_label_values(&[pool]).inc();
    }

    pub fn decr_outstanding(&self, pool: &str) {
        self.claims_outstanding.with_label_values(&[pool]).dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = PoolMetrics::new().unwrap();
        m.record_queued("p", 3);
        m.record_queued("p", 2);
        assert_eq!(
            m.objects_queued.with_label_values(&["p"]).get() as u64,
            5
        );
        m.incr_outstanding("p");
        m.incr_outstanding("p");
        m.decr_outstanding("p");
        assert_eq!(
            m.claims_outstanding.with_label_values(&["p"]).get() as i64,
            1
        );
    }
}
