// Prometheus metrics for rate limit admission checks
//
// Counters only; the host process decides how to expose them:
// - Admission outcomes (allowed, denied, bypassed, unlimited, error)
// - Policy snapshot publications
// - Compare-and-swap retries on contended buckets

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Registry, TextEncoder};
use std::sync::{Arc, Once};

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    pub static ref RATE_LIMIT_CHECKS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("rate_limit_checks_total", "Admission checks by outcome"),
        &["outcome"]
    ).expect("Failed to create rate limit checks metric");

    pub static ref POLICY_RELOADS_TOTAL: IntCounter = IntCounter::new(
        "rate_limit_policy_reloads_total",
        "Number of rate limit policy snapshots published"
    ).expect("Failed to create policy reloads metric");

    pub static ref CAS_RETRIES_TOTAL: IntCounter = IntCounter::new(
        "rate_limit_cas_retries_total",
        "Compare-and-swap attempts lost to a concurrent writer"
    ).expect("Failed to create CAS retries metric");
}

static INIT: Once = Once::new();

/// Admission outcome label values
pub mod outcome {
    pub const ALLOWED: &str = "allowed";
    pub const DENIED: &str = "denied";
    pub const BYPASSED: &str = "bypassed";
    pub const UNLIMITED: &str = "unlimited";
    pub const ERROR: &str = "error";
}

/// Register all metrics with the crate registry; later calls are no-ops
pub fn init() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(RATE_LIMIT_CHECKS_TOTAL.clone()),
            Box::new(POLICY_RELOADS_TOTAL.clone()),
            Box::new(CAS_RETRIES_TOTAL.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!("Failed to register rate limit metric: {}", e);
            }
        }
    });
}

/// Count one admission check
pub fn record_check(outcome: &str) {
    RATE_LIMIT_CHECKS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    init();
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
