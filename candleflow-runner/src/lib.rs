//! candleflow runner: stage graph, orchestration, transforms, charts and run reports.
//!
//! Builds on `candleflow-core`:
//! - `dag`: named stage graph with topological ordering
//! - `pipeline`: sequential executor with halt-on-failure and cooperative cancel
//! - `stages`: extract, load, transform, test and visualize as `Stage`s
//! - `transform`: external-command and built-in SQL transform runners
//! - `visualize`: SVG candlestick chart and candle CSV
//! - `report`: per-run JSON reports and the JSONL run history
//! - `lock`: per-entity run lock

pub mod dag;
pub mod lock;
pub mod observer;
pub mod pipeline;
pub mod report;
pub mod stage;
pub mod stages;
pub mod transform;
pub mod visualize;

pub use dag::{GraphError, StageGraph};
pub use lock::{EntityLock, LockError};
pub use observer::{LogObserver, NullObserver, PipelineObserver};
pub use pipeline::{cancel_flag, standard_graph, Pipeline, PIPELINE_NAME};
pub use report::{read_history, RunReport, StageRecord, StageStatus};
pub use stage::{RunState, Stage, StageError, StageKind};
pub use stages::{ExtractStage, LoadStage, TestStage, TransformStage, VisualizeStage};
pub use transform::{
    runner_for, CommandTransform, SqlTransform, TransformError, TransformRunner, TransformStatus,
};
pub use visualize::{render, RenderError, RenderOutcome};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: pipelines and their parts can move to a worker thread.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<Pipeline>();
        require_sync::<Pipeline>();
        require_send::<RunReport>();
        require_sync::<RunReport>();
        require_send::<StageGraph>();
        require_sync::<StageGraph>();
        require_send::<SqlTransform>();
        require_sync::<SqlTransform>();
        require_send::<CommandTransform>();
        require_sync::<CommandTransform>();
        require_send::<EntityLock>();
        require_send::<StageError>();
    }
}
