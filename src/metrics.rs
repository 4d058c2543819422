//! Orchestrator Metrics
//!
//! Prometheus counters kept in a registry owned by the orchestrator rather
//! than the process-wide default registry, so that several orchestrators
//! (tests, embedded use) never collide.

use crate::domain::ports::DriverCategory;
use crate::error::Result;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Metric name prefix
pub const NAMESPACE: &str = "volume_orchestrator";

/// Outcome label values
pub mod outcome {
    pub const OK: &str = "ok";
    pub const FAILED: &str = "failed";
    pub const TIMEOUT: &str = "timeout";
    pub const PANICKED: &str = "panicked";
}

/// Counters exported at `/metrics`
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    driver_inits: IntCounterVec,
    fanout_requests: IntCounterVec,
    module_starts: IntCounterVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Build the registry and register every counter
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None)?;

        let driver_inits = IntCounterVec::new(
            Opts::new(
                "driver_inits_total",
                "Driver initialisations grouped by category, driver and outcome",
            ),
            &["category", "driver", "outcome"],
        )?;
        let fanout_requests = IntCounterVec::new(
            Opts::new(
                "fanout_requests_total",
                "Instance discovery fan-outs grouped by outcome",
            ),
            &["outcome"],
        )?;
        let module_starts = IntCounterVec::new(
            Opts::new(
                "module_starts_total",
                "Module starts grouped by module type and outcome",
            ),
            &["module", "outcome"],
        )?;

        registry.register(Box::new(driver_inits.clone()))?;
        registry.register(Box::new(fanout_requests.clone()))?;
        registry.register(Box::new(module_starts.clone()))?;

        Ok(Self {
            registry,
            driver_inits,
            fanout_requests,
            module_starts,
        })
    }

    pub fn record_driver_init(&self, category: DriverCategory, driver: &str, outcome: &str) {
        self.driver_inits
            .with_label_values(&[&category.to_string(), driver, outcome])
            .inc();
    }

    pub fn record_fanout(&self, outcome: &str) {
        self.fanout_requests.with_label_values(&[outcome]).inc();
    }

    pub fn record_module_start(&self, module: &str, outcome: &str) {
        self.module_starts.with_label_values(&[module, outcome]).inc();
    }

    /// Render every metric in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::error::Error::Internal(format!("metrics are not UTF-8: {}", e)))
    }
}
