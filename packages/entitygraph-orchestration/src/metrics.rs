//! Prometheus metrics for the pipeline (feature `metrics`)

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry, IntCounter,
    IntCounterVec, Opts, Registry,
};

use crate::phase::{BatchReport, Phase};

#[derive(Clone)]
pub struct PipelineMetrics {
    pub processed: IntCounterVec,
    pub failed: IntCounterVec,
    pub skipped: IntCounterVec,
    pub propagation_rounds: IntCounter,
}

impl PipelineMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            processed: register_int_counter_vec_with_registry!(
                Opts::new("entitygraph_items_processed_total", "Items processed per phase"),
                &["phase"],
                registry
            )?,
            failed: register_int_counter_vec_with_registry!(
                Opts::new("entitygraph_items_failed_total", "Items failed per phase"),
                &["phase"],
                registry
            )?,
            skipped: register_int_counter_vec_with_registry!(
                Opts::new("entitygraph_items_skipped_total", "Items skipped per phase"),
                &["phase"],
                registry
            )?,
            propagation_rounds: register_int_counter_with_registry!(
                Opts::new(
                    "entitygraph_propagation_rounds_total",
                    "Chain-link propagation rounds"
                ),
                registry
            )?,
        })
    }

    pub fn observe_batch(&self, phase: Phase, report: &BatchReport) {
        let label = [phase.as_str()];
        self.processed.with_label_values(&label).inc_by(report.processed);
        self.failed.with_label_values(&label).inc_by(report.failed);
        self.skipped.with_label_values(&label).inc_by(report.skipped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_batch() {
        let registry = Registry::new();
        let metrics = PipelineMetrics::new(&registry).unwrap();
        metrics.observe_batch(
            Phase::Extraction,
            &BatchReport {
                processed: 4,
                failed: 1,
                ..Default::default()
            },
        );
        assert_eq!(
            metrics.processed.with_label_values(&["extraction"]).get(),
            4
        );
        assert_eq!(metrics.failed.with_label_values(&["extraction"]).get(), 1);
        assert!(PipelineMetrics::new(&registry).is_err());
    }
}
