//! Pipeline orchestrator.
//!
//! Walks the stage graph in topological order, one stage at a time.
//! The first failure is final: the run becomes `Failed(stage)` and every stage
//! that has not run yet is recorded as skipped, with stages downstream of the
//! failure told apart from unrelated ones. There are no retries.
//!
//! The cancel flag is checked before each stage. A stage that already started
//! always runs to completion.

use crate::dag::{GraphError, StageGraph};
use crate::observer::PipelineObserver;
use crate::report::{run_id, RunReport, StageRecord, StageStatus};
use crate::stage::{RunState, Stage, StageKind};
use crate::stages::{ExtractStage, LoadStage, TestStage, TransformStage, VisualizeStage};
use crate::transform::TransformRunner;
use candleflow_core::data::PriceSource;
use candleflow_core::PipelineConfig;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Name of the standard pipeline.
pub const PIPELINE_NAME: &str = "candleflow_elt";

pub struct Pipeline {
    name: String,
    graph: StageGraph,
    /// Stages in execution order.
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// Bind stages to graph nodes. Every node needs exactly one stage and
    /// every stage a node.
    pub fn new(
        name: &str,
        graph: StageGraph,
        stages: Vec<Box<dyn Stage>>,
    ) -> Result<Self, GraphError> {
        let order = graph.topological_order()?;

        for stage in &stages {
            if !graph.contains(stage.kind().name()) {
                return Err(GraphError::NotInGraph(stage.kind().name().to_string()));
            }
        }

        let mut slots: Vec<Option<Box<dyn Stage>>> = stages.into_iter().map(Some).collect();
        let mut ordered = Vec::with_capacity(order.len());
        for node in &order {
            let slot = slots
                .iter_mut()
                .find(|s| s.as_ref().is_some_and(|s| s.kind().name() == node))
                .and_then(Option::take)
                .ok_or_else(|| GraphError::Unbound(node.clone()))?;
            ordered.push(slot);
        }
        if let Some(extra) = slots.into_iter().flatten().next() {
            return Err(GraphError::DuplicateNode(extra.kind().name().to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            graph,
            stages: ordered,
        })
    }

    /// `extract -> load -> transform -> test -> visualize`.
    pub fn standard(
        source: Arc<dyn PriceSource>,
        transform: Arc<dyn TransformRunner>,
    ) -> Result<Self, GraphError> {
        Self::with_extract(ExtractStage::new(source), transform)
    }

    /// The standard pipeline with a preconfigured extract stage.
    pub fn with_extract(
        extract: ExtractStage,
        transform: Arc<dyn TransformRunner>,
    ) -> Result<Self, GraphError> {
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(extract),
            Box::new(LoadStage),
            Box::new(TransformStage::new(transform.clone())),
            Box::new(TestStage::new(transform)),
            Box::new(VisualizeStage),
        ];
        Self::new(PIPELINE_NAME, standard_graph()?, stages)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind()).collect()
    }

    /// Run every stage once, in order.
    pub fn run(
        &self,
        config: &PipelineConfig,
        observer: &dyn PipelineObserver,
        cancel: &AtomicBool,
    ) -> RunReport {
        let started_at = Utc::now();
        let total = self.stages.len();
        let mut state = RunState::Pending;
        let mut records = Vec::with_capacity(total);
        let mut blocked = BTreeSet::new();

        log::info!(
            "pipeline {} starting for {} ({} stages)",
            self.name,
            config.entity_id,
            total
        );

        for (index, stage) in self.stages.iter().enumerate() {
            let kind = stage.kind();

            if state.is_terminal() {
                let (status, detail) = match &state {
                    RunState::Cancelled(_) => (StageStatus::Cancelled, "run cancelled".to_string()),
                    RunState::Failed(failed) if blocked.contains(kind.name()) => {
                        (StageStatus::Skipped, format!("upstream {failed} failed"))
                    }
                    other => (StageStatus::Skipped, format!("run halted: {other}")),
                };
                self.finish_stage(observer, &mut records, kind, status, detail, 0);
                continue;
            }

            if cancel.load(Ordering::Relaxed) {
                log::warn!("cancellation requested before {kind}");
                state = RunState::Cancelled(kind);
                self.finish_stage(
                    observer,
                    &mut records,
                    kind,
                    StageStatus::Cancelled,
                    "run cancelled".to_string(),
                    0,
                );
                continue;
            }

            state = kind.running_state();
            observer.on_stage_start(kind, index, total);
            let timer = Instant::now();
            let result = stage.run(config);
            let elapsed = timer.elapsed().as_millis() as u64;

            match result {
                Ok(detail) => {
                    self.finish_stage(
                        observer,
                        &mut records,
                        kind,
                        StageStatus::Succeeded,
                        detail,
                        elapsed,
                    );
                }
                Err(e) => {
                    state = RunState::Failed(kind);
                    blocked = self.graph.downstream_of(kind.name());
                    self.finish_stage(
                        observer,
                        &mut records,
                        kind,
                        StageStatus::Failed,
                        e.to_string(),
                        elapsed,
                    );
                }
            }
        }

        if !state.is_terminal() {
            state = RunState::Completed;
        }

        let report = RunReport {
            run_id: run_id(&self.name, &config.entity_id, started_at),
            pipeline: self.name.clone(),
            entity_id: config.entity_id.clone(),
            started_at,
            finished_at: Utc::now(),
            final_state: state,
            stages: records,
        };
        observer.on_run_complete(&report);
        report
    }

    fn finish_stage(
        &self,
        observer: &dyn PipelineObserver,
        records: &mut Vec<StageRecord>,
        stage: StageKind,
        status: StageStatus,
        detail: String,
        duration_ms: u64,
    ) {
        let record = StageRecord {
            stage,
            status,
            detail,
            duration_ms,
        };
        observer.on_stage_complete(&record);
        records.push(record);
    }
}

/// The standard five-stage chain.
pub fn standard_graph() -> Result<StageGraph, GraphError> {
    let names: Vec<&str> = StageKind::ALL.iter().map(|k| k.name()).collect();
    StageGraph::chain(&names)
}

/// Fresh, unset cancel flag.
pub fn cancel_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}
