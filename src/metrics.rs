use crate::reconcile::{Action, Phase, ReconcileOutcome};
use crate::resource::ResourceIdentity;

use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
};

use std::fmt::{self, Debug};
use std::time::Duration;

const NAMESPACE_AND_NAME: &[&str] = &["namespace", "name"];

pub struct Metrics {
    registry: Registry,
    reconcile_count_by_resource: IntCounterVec,
    reconcile_errors_by_resource: IntCounterVec,
    outcomes_by_phase: IntCounterVec,
    reconcile_times: Histogram,
    chart_operation_times: HistogramVec,
}

impl Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Metrics")
    }
}

fn identity_labels(identity: &ResourceIdentity) -> [&str; 2] {
    [identity.namespace.as_str(), identity.name.as_str()]
}

impl Metrics {
    pub fn new() -> Metrics {
        let registry = Registry::new();

        let reconcile_count_opts = Opts::new(
            "reconciliations",
            "the number of times each resource has been reconciled",
        )
        .variable_label("namespace")
        .variable_label("name");
        let reconcile_count_by_resource =
            IntCounterVec::new(reconcile_count_opts, NAMESPACE_AND_NAME).unwrap();
        registry
            .register(Box::new(reconcile_count_by_resource.clone()))
            .unwrap();

        let reconcile_error_opts = Opts::new(
            "reconcile_errors",
            "the number of failed reconciliations by resource",
        )
        .variable_label("namespace")
        .variable_label("name");
        let reconcile_errors_by_resource =
            IntCounterVec::new(reconcile_error_opts, NAMESPACE_AND_NAME).unwrap();
        registry
            .register(Box::new(reconcile_errors_by_resource.clone()))
            .unwrap();

        let outcome_opts = Opts::new(
            "reconcile_outcomes",
            "the number of reconciliations by outcome phase",
        )
        .variable_label("phase");
        let outcomes_by_phase = IntCounterVec::new(outcome_opts, &["phase"]).unwrap();
        registry
            .register(Box::new(outcomes_by_phase.clone()))
            .unwrap();

        let reconcile_time_opts = HistogramOpts::new(
            "reconcile_time",
            "total time spent processing a single reconcile request",
        )
        .buckets(exponential_buckets(0.005, 2.0, 12).unwrap());
        let reconcile_times = Histogram::with_opts(reconcile_time_opts).unwrap();
        registry.register(Box::new(reconcile_times.clone())).unwrap();

        let chart_operation_opts = HistogramOpts::new(
            "chart_operation_time",
            "time spent in a single chart engine install, upgrade, or uninstall",
        )
        .buckets(exponential_buckets(0.05, 2.0, 12).unwrap());
        let chart_operation_times =
            HistogramVec::new(chart_operation_opts, &["operation"]).unwrap();
        registry
            .register(Box::new(chart_operation_times.clone()))
            .unwrap();

        Metrics {
            registry,
            reconcile_count_by_resource,
            reconcile_errors_by_resource,
            outcomes_by_phase,
            reconcile_times,
            chart_operation_times,
        }
    }

    pub fn reconcile_started(&self, identity: &ResourceIdentity) {
        self.reconcile_count_by_resource
            .with_label_values(&identity_labels(identity))
            .inc();
    }

    pub fn reconcile_finished(
        &self,
        identity: &ResourceIdentity,
        outcome: &ReconcileOutcome,
        elapsed: Duration,
    ) {
        let phase = outcome.phase.to_string();
        self.outcomes_by_phase
            .with_label_values(&[phase.as_str()])
            .inc();
        if outcome.phase == Phase::Failed {
            self.reconcile_errors_by_resource
                .with_label_values(&identity_labels(identity))
                .inc();
        }
        self.reconcile_times.observe(elapsed.as_secs_f64());
    }

    pub fn observe_chart_operation(&self, action: Action, elapsed: Duration) {
        let operation = action.to_string();
        self.chart_operation_times
            .with_label_values(&[operation.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    /// Drops the per-resource series once the resource's release is gone, so
    /// the label space does not grow without bound.
    pub fn resource_removed(&self, identity: &ResourceIdentity) {
        let labels = identity_labels(identity);
        let _ = self
            .reconcile_count_by_resource
            .remove_label_values(&labels);
        let _ = self
            .reconcile_errors_by_resource
            .remove_label_values(&labels);
    }

    pub fn encode_as_text(&self) -> Result<Vec<u8>, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::with_capacity(4096);
        encoder.encode(self.registry.gather().as_slice(), &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for Metrics {
    fn default() -> Metrics {
        Metrics::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn metrics_are_created_successfully() {
        let _metrics = Metrics::new();
    }

    #[test]
    fn finished_reconciliations_are_counted_by_phase() {
        let metrics = Metrics::new();
        let identity =
            ResourceIdentity::new("demo.example.com", "v1alpha1", "Nginx", "default", "web");
        let outcome = ReconcileOutcome::success(Phase::Installed, Some(1), "InstallSucceeded", "ok");
        metrics.reconcile_started(&identity);
        metrics.reconcile_finished(&identity, &outcome, Duration::from_millis(10));
        metrics.resource_removed(&identity);

        let text = metrics.encode_as_text().unwrap();
        let text = String::from_utf8(text).unwrap();
        assert!(text.contains("reconcile_outcomes"));
    }
}
