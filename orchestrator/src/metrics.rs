//! Prometheus metrics for the orchestrator.
//!
//! Counters cover the lifecycle both ways a job can move: the webhook path
//! and the reconciler path. The duplicate-callback counter is the health
//! signal for the idempotency layer.

use metrics::{counter, histogram};
use std::time::Instant;

/// Helper struct for tracking operation latency.
pub struct LatencyTracker {
    start: Instant,
    operation: &'static str,
}

impl LatencyTracker {
    pub fn new(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed().as_secs_f64();
        histogram!("orchestrator_operation_duration_seconds", "operation" => self.operation)
            .record(duration);
    }
}

pub fn job_submitted(category: &str, scale: u32) {
    counter!(
        "orchestrator_jobs_submitted_total",
        "category" => category.to_string(),
        "scale" => scale.to_string()
    )
    .increment(1);
}

pub fn job_rejected(reason: &'static str) {
    counter!("orchestrator_jobs_rejected_total", "reason" => reason).increment(1);
}

pub fn prediction_launched(model: &str, stage: u32) {
    counter!(
        "orchestrator_predictions_launched_total",
        "model" => model.to_string(),
        "stage" => stage.to_string()
    )
    .increment(1);
}

pub fn callback_applied() {
    counter!("orchestrator_callbacks_total", "outcome" => "applied").increment(1);
}

pub fn callback_duplicate() {
    counter!("orchestrator_callbacks_total", "outcome" => "duplicate").increment(1);
}

pub fn callback_orphaned() {
    counter!("orchestrator_callbacks_total", "outcome" => "orphaned").increment(1);
}

pub fn tile_failed() {
    counter!("orchestrator_tiles_failed_total").increment(1);
}

pub fn job_finished(status: &'static str) {
    counter!("orchestrator_jobs_finished_total", "status" => status).increment(1);
}

pub fn reconciler_repair(kind: &'static str) {
    counter!("orchestrator_reconciler_repairs_total", "kind" => kind).increment(1);
}

pub fn stitch_finished(outcome: &'static str) {
    counter!("orchestrator_stitches_total", "outcome" => outcome).increment(1);
}

pub fn stitch_tiles_skipped(count: u64) {
    counter!("orchestrator_stitch_tiles_skipped_total").increment(count);
}
