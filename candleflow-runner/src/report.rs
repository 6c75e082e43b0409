//! Run reports.
//!
//! Every run writes `runs/{run_id}.json` and appends the same report as one
//! line to `runs/history.jsonl`. The history is append-only; each line is an
//! independent JSON object so a torn last line only loses that run.

use crate::stage::{RunState, StageKind};
use anyhow::{Context, Result};
use candleflow_core::atomic::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const HISTORY_FILE: &str = "history.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    /// Not run because an upstream stage failed.
    Skipped,
    /// Not run because the run was cancelled.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageKind,
    pub status: StageStatus,
    pub detail: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub pipeline: String,
    pub entity_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub final_state: RunState,
    pub stages: Vec<StageRecord>,
}

/// 16 hex chars of BLAKE3 over pipeline, entity and start instant.
pub fn run_id(pipeline: &str, entity_id: &str, started_at: DateTime<Utc>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(pipeline.as_bytes());
    hasher.update(b"\0");
    hasher.update(entity_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(
        started_at
            .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
            .as_bytes(),
    );
    hasher.finalize().to_hex().as_str()[..16].to_string()
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.final_state.is_success()
    }

    pub fn record(&self, stage: StageKind) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    pub fn status_of(&self, stage: StageKind) -> Option<StageStatus> {
        self.record(stage).map(|r| r.status)
    }

    /// Write `{runs_dir}/{run_id}.json` and append to the history.
    pub fn persist(&self, runs_dir: &Path) -> Result<PathBuf> {
        let path = runs_dir.join(format!("{}.json", self.run_id));
        let json = serde_json::to_string_pretty(self).context("failed to serialize run report")?;
        write_atomic(&path, json.as_bytes())
            .with_context(|| format!("failed to write run report {}", path.display()))?;

        append_history(runs_dir, self)?;
        Ok(path)
    }

    /// One line per stage, for terminal output.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "run {} ({} / {}): {}",
            self.run_id, self.pipeline, self.entity_id, self.final_state
        )];
        for r in &self.stages {
            lines.push(format!(
                "  {:<10} {:<10} {:>7}ms  {}",
                r.stage.name(),
                format!("{:?}", r.status).to_lowercase(),
                r.duration_ms,
                r.detail
            ));
        }
        lines
    }
}

fn append_history(runs_dir: &Path, report: &RunReport) -> Result<()> {
    let path = runs_dir.join(HISTORY_FILE);
    let line = serde_json::to_string(report).context("failed to serialize history entry")?;

    fs::create_dir_all(runs_dir)
        .with_context(|| format!("failed to create {}", runs_dir.display()))?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))?;
    file.flush()?;
    Ok(())
}

/// Every report in the history, oldest first. Malformed lines are skipped.
pub fn read_history(runs_dir: &Path) -> Result<Vec<RunReport>> {
    let path = runs_dir.join(HISTORY_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = fs::File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reports = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RunReport>(&line) {
            Ok(report) => reports.push(report),
            Err(e) => log::warn!("skipping malformed history line {}: {e}", lineno + 1),
        }
    }
    Ok(reports)
}

/// Most recent report for `entity_id`, if any.
pub fn last_run_for(runs_dir: &Path, entity_id: &str) -> Result<Option<RunReport>> {
    Ok(read_history(runs_dir)?
        .into_iter()
        .rev()
        .find(|r| r.entity_id == entity_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn report(entity: &str, state: RunState) -> RunReport {
        let started_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        RunReport {
            run_id: run_id("candleflow_elt", entity, started_at),
            pipeline: "candleflow_elt".into(),
            entity_id: entity.into(),
            started_at,
            finished_at: started_at + chrono::Duration::seconds(3),
            final_state: state,
            stages: vec![StageRecord {
                stage: StageKind::Extract,
                status: StageStatus::Succeeded,
                detail: "fetched 720 points".into(),
                duration_ms: 812,
            }],
        }
    }

    #[test]
    fn run_id_is_stable_and_short() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(run_id("p", "bitcoin", t), run_id("p", "bitcoin", t));
        assert_ne!(run_id("p", "bitcoin", t), run_id("p", "ethereum", t));
        assert_eq!(run_id("p", "bitcoin", t).len(), 16);
    }

    #[test]
    fn persist_writes_report_and_appends_history() {
        let dir = tempfile::tempdir().unwrap();
        let runs = dir.path().join("runs");

        let first = report("bitcoin", RunState::Completed);
        let path = first.persist(&runs).unwrap();
        let second = report("ethereum", RunState::Failed(StageKind::Load));
        second.persist(&runs).unwrap();

        let on_disk: RunReport =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(on_disk, first);

        let history = read_history(&runs).unwrap();
        assert_eq!(history, vec![first.clone(), second]);
        assert_eq!(last_run_for(&runs, "bitcoin").unwrap(), Some(first));
    }

    #[test]
    fn malformed_history_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = report("bitcoin", RunState::Completed);
        good.persist(dir.path()).unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(HISTORY_FILE))
            .unwrap();
        writeln!(file, "{{\"run_id\": \"torn").unwrap();

        assert_eq!(read_history(dir.path()).unwrap(), vec![good]);
    }

    #[test]
    fn missing_history_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_history(dir.path()).unwrap().is_empty());
    }
}
