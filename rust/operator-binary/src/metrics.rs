use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use stackable_operator::logging::controller::ReconcilerError;
use tokio::time::Instant;

use crate::{
    controller::{self, SyncAction},
    event::Origin,
};

const METRIC_PREFIX: &str = "svc_lb_sync";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RunLabels {
    pub origin: String,
    pub action: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    pub origin: String,
    pub error: String,
}

/// Reconcile counters, exported in the Prometheus text format.
pub struct Metrics {
    registry: Registry,
    runs: Family<RunLabels, Counter>,
    failures: Family<FailureLabels, Counter>,
    duration: Histogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix(METRIC_PREFIX);
        let runs = Family::<RunLabels, Counter>::default();
        let failures = Family::<FailureLabels, Counter>::default();
        let duration = Histogram::new([0.01, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0, 60.0].into_iter());

        registry.register(
            "reconcile_runs",
            "Number of completed reconciliations",
            runs.clone(),
        );
        registry.register(
            "reconcile_failures",
            "Number of reconciliation errors",
            failures.clone(),
        );
        registry.register_with_unit(
            "reconcile_duration",
            "Reconcile duration",
            Unit::Seconds,
            duration.clone(),
        );
        Self {
            registry,
            runs,
            failures,
            duration,
        }
    }

    pub fn count_run(&self, origin: Origin, action: &SyncAction) {
        let action: &'static str = action.into();
        self.runs
            .get_or_create(&RunLabels {
                origin: origin.to_string(),
                action: action.to_string(),
            })
            .inc();
    }

    pub fn count_failure(&self, origin: Origin, error: &controller::Error) {
        self.failures
            .get_or_create(&FailureLabels {
                origin: origin.to_string(),
                error: error.category().to_string(),
            })
            .inc();
    }

    /// Starts timing a reconcile; the duration is recorded when the returned guard is dropped.
    pub fn measure(&self) -> ReconcileMeasurer {
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.duration.clone(),
        }
    }

    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

pub struct ReconcileMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        self.metric.observe(self.start.elapsed().as_secs_f64());
    }
}
