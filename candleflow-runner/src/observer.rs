//! Run progress callbacks.

use crate::report::{RunReport, StageRecord, StageStatus};
use crate::stage::StageKind;

/// Receives progress as the orchestrator walks the stage graph.
pub trait PipelineObserver: Send + Sync {
    /// Called before a stage starts.
    fn on_stage_start(&self, stage: StageKind, index: usize, total: usize);

    /// Called after a stage finishes, and for every stage that did not run.
    fn on_stage_complete(&self, record: &StageRecord);

    /// Called once the run reaches a final state.
    fn on_run_complete(&self, report: &RunReport);
}

/// Reports progress through the `log` facade.
pub struct LogObserver;

impl PipelineObserver for LogObserver {
    fn on_stage_start(&self, stage: StageKind, index: usize, total: usize) {
        log::info!("[{}/{}] {stage} started", index + 1, total);
    }

    fn on_stage_complete(&self, record: &StageRecord) {
        match record.status {
            StageStatus::Succeeded => log::info!(
                "{} succeeded in {}ms: {}",
                record.stage,
                record.duration_ms,
                record.detail
            ),
            StageStatus::Failed => log::error!("{} failed: {}", record.stage, record.detail),
            StageStatus::Skipped | StageStatus::Cancelled => {
                log::warn!("{} not run: {}", record.stage, record.detail)
            }
        }
    }

    fn on_run_complete(&self, report: &RunReport) {
        if report.succeeded() {
            log::info!("run {} completed", report.run_id);
        } else {
            log::error!("run {} finished as {}", report.run_id, report.final_state);
        }
    }
}

/// Observer that ignores everything.
pub struct NullObserver;

impl PipelineObserver for NullObserver {
    fn on_stage_start(&self, _stage: StageKind, _index: usize, _total: usize) {}
    fn on_stage_complete(&self, _record: &StageRecord) {}
    fn on_run_complete(&self, _report: &RunReport) {}
}
