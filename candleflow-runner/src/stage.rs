//! Stage contract shared by the orchestrator and the concrete stages.

use crate::transform::TransformError;
use crate::visualize::RenderError;
use candleflow_core::{ExtractError, LoadError, PipelineConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The five steps of the ELT pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Extract,
    Load,
    Transform,
    Test,
    Visualize,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Extract,
        StageKind::Load,
        StageKind::Transform,
        StageKind::Test,
        StageKind::Visualize,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Extract => "extract",
            StageKind::Load => "load",
            StageKind::Transform => "transform",
            StageKind::Test => "test",
            StageKind::Visualize => "visualize",
        }
    }

    /// The run state while this stage executes.
    pub fn running_state(&self) -> RunState {
        match self {
            StageKind::Extract => RunState::Extracting,
            StageKind::Load => RunState::Loading,
            StageKind::Transform => RunState::Transforming,
            StageKind::Test => RunState::Testing,
            StageKind::Visualize => RunState::Visualizing,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pipeline run state machine. `Completed`, `Failed` and `Cancelled` are final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Extracting,
    Loading,
    Transforming,
    Testing,
    Visualizing,
    Completed,
    Failed(StageKind),
    /// Cancelled before the named stage started.
    Cancelled(StageKind),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed(_) | RunState::Cancelled(_)
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunState::Completed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Pending => f.write_str("pending"),
            RunState::Extracting => f.write_str("extracting"),
            RunState::Loading => f.write_str("loading"),
            RunState::Transforming => f.write_str("transforming"),
            RunState::Testing => f.write_str("testing"),
            RunState::Visualizing => f.write_str("visualizing"),
            RunState::Completed => f.write_str("completed"),
            RunState::Failed(stage) => write!(f, "failed({stage})"),
            RunState::Cancelled(stage) => write!(f, "cancelled({stage})"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

/// One step of the pipeline.
///
/// A stage either succeeds with a one-line summary for the run report or
/// fails. The orchestrator only sees pass/fail; it never retries.
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    fn run(&self, config: &PipelineConfig) -> Result<String, StageError>;
}
