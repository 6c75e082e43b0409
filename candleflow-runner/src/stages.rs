//! The five concrete stages of the ELT pipeline.

use crate::stage::{Stage, StageError, StageKind};
use crate::transform::TransformRunner;
use crate::visualize::{self, RenderOutcome};
use candleflow_core::data::PriceSource;
use candleflow_core::extract::extract_at;
use candleflow_core::{load, ExtractOutcome, LoadOutcome, PipelineConfig, StagingArtifact};
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub struct ExtractStage {
    source: Arc<dyn PriceSource>,
    /// Window end; `None` means "now" at the time the stage runs.
    end: Option<DateTime<Utc>>,
}

impl ExtractStage {
    pub fn new(source: Arc<dyn PriceSource>) -> Self {
        Self { source, end: None }
    }

    pub fn ending_at(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }
}

impl Stage for ExtractStage {
    fn kind(&self) -> StageKind {
        StageKind::Extract
    }

    fn run(&self, config: &PipelineConfig) -> Result<String, StageError> {
        let artifact = StagingArtifact::new(config.staging_path());
        let end = self.end.unwrap_or_else(Utc::now);
        let report = extract_at(
            self.source.as_ref(),
            &config.entity_id,
            config.window_days,
            &artifact,
            end,
        )?;

        Ok(match report.outcome {
            ExtractOutcome::Fetched { points, dropped: 0 } => {
                format!("staged {points} points from {}", report.source)
            }
            ExtractOutcome::Fetched { points, dropped } => format!(
                "staged {points} points from {} ({dropped} dropped)",
                report.source
            ),
            ExtractOutcome::Degraded { reason } => {
                format!("degraded to empty artifact: {reason}")
            }
        })
    }
}

pub struct LoadStage;

impl Stage for LoadStage {
    fn kind(&self) -> StageKind {
        StageKind::Load
    }

    fn run(&self, config: &PipelineConfig) -> Result<String, StageError> {
        let artifact = StagingArtifact::new(config.staging_path());
        let result = load(&artifact, &config.entity_id, &config.database_path())?;

        Ok(match result.outcome {
            LoadOutcome::Replaced => format!(
                "wrote {} rows (replaced {})",
                result.records_written, result.deleted
            ),
            LoadOutcome::NothingToLoad => "nothing to load".to_string(),
            LoadOutcome::SkippedDegraded { reason } => {
                format!("skipped degraded extract: {reason}")
            }
        })
    }
}

pub struct TransformStage {
    runner: Arc<dyn TransformRunner>,
}

impl TransformStage {
    pub fn new(runner: Arc<dyn TransformRunner>) -> Self {
        Self { runner }
    }
}

impl Stage for TransformStage {
    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    fn run(&self, config: &PipelineConfig) -> Result<String, StageError> {
        let status = self.runner.run_transform(config)?;
        Ok(status.into_result("transform")?)
    }
}

pub struct TestStage {
    runner: Arc<dyn TransformRunner>,
}

impl TestStage {
    pub fn new(runner: Arc<dyn TransformRunner>) -> Self {
        Self { runner }
    }
}

impl Stage for TestStage {
    fn kind(&self) -> StageKind {
        StageKind::Test
    }

    fn run(&self, config: &PipelineConfig) -> Result<String, StageError> {
        let status = self.runner.run_tests(config)?;
        Ok(status.into_result("test")?)
    }
}

pub struct VisualizeStage;

impl Stage for VisualizeStage {
    fn kind(&self) -> StageKind {
        StageKind::Visualize
    }

    fn run(&self, config: &PipelineConfig) -> Result<String, StageError> {
        let outcome = visualize::render(
            &config.entity_id,
            &config.database_path(),
            &config.charts_dir(),
        )?;

        Ok(match outcome {
            RenderOutcome::Chart { path, candles, .. } => {
                format!("{candles} candles drawn to {}", path.display())
            }
            RenderOutcome::NoDataSkipped => "no data to draw".to_string(),
        })
    }
}
