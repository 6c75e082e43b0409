//! Extract stage: fetch a trailing window of prices and stage them.
//!
//! A source failure never fails the stage. The extractor logs it, writes an
//! empty artifact and marks the sidecar degraded so the loader can tell
//! "nothing happened" apart from "the source was down". Only a failure to
//! write the artifact itself is an error.

use crate::data::{FetchResult, FetchWindow, PriceSource, SourceError};
use crate::domain::PricePoint;
use crate::staging::{StagingArtifact, StagingError, StagingMeta};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to write staging artifact: {0}")]
    Staging(#[from] StagingError),
}

/// What the extract stage produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractOutcome {
    /// Source answered. `dropped` counts invalid or duplicate points removed.
    Fetched { points: usize, dropped: usize },
    /// Source failed; an empty artifact was written instead.
    Degraded { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractReport {
    pub entity_id: String,
    pub window_days: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub source: String,
    pub artifact_path: PathBuf,
    pub outcome: ExtractOutcome,
}

impl ExtractReport {
    pub fn is_degraded(&self) -> bool {
        matches!(self.outcome, ExtractOutcome::Degraded { .. })
    }

    pub fn points_staged(&self) -> usize {
        match self.outcome {
            ExtractOutcome::Fetched { points, .. } => points,
            ExtractOutcome::Degraded { .. } => 0,
        }
    }
}

/// Extract the window ending now.
pub fn extract(
    source: &dyn PriceSource,
    entity_id: &str,
    window_days: u32,
    artifact: &StagingArtifact,
) -> Result<ExtractReport, ExtractError> {
    extract_at(source, entity_id, window_days, artifact, Utc::now())
}

/// Extract the `window_days` window ending at `end`.
pub fn extract_at(
    source: &dyn PriceSource,
    entity_id: &str,
    window_days: u32,
    artifact: &StagingArtifact,
    end: DateTime<Utc>,
) -> Result<ExtractReport, ExtractError> {
    log::info!(
        "extracting {entity_id} from {} ({window_days} days ending {})",
        source.name(),
        end.format("%Y-%m-%d %H:%M")
    );

    let window = FetchWindow::trailing(window_days, end);
    let window_start = window.as_ref().map_or(end, |w| w.start);

    let (points, staged_from, outcome) = match window.and_then(|w| fetch(source, entity_id, w)) {
        Ok(result) => {
            let received = result.points.len();
            let points = canonicalize(entity_id, result.points);
            let dropped = received - points.len();
            if dropped > 0 {
                log::warn!("dropped {dropped} invalid or duplicate points for {entity_id}");
            }
            let outcome = ExtractOutcome::Fetched {
                points: points.len(),
                dropped,
            };
            (points, result.source.as_str(), outcome)
        }
        Err(e) => {
            log::warn!("extract for {entity_id} degraded to an empty artifact: {e}");
            let outcome = ExtractOutcome::Degraded {
                reason: e.to_string(),
            };
            (Vec::new(), source.name(), outcome)
        }
    };

    let degraded = match &outcome {
        ExtractOutcome::Degraded { reason } => Some(reason.clone()),
        ExtractOutcome::Fetched { .. } => None,
    };
    let meta = artifact.write(
        &points,
        StagingMeta::new(entity_id, window_days, staged_from, degraded),
    )?;

    log::info!(
        "staged {} points for {entity_id} at {}",
        meta.point_count,
        artifact.path().display()
    );

    Ok(ExtractReport {
        entity_id: entity_id.to_string(),
        window_days,
        window_start,
        window_end: end,
        source: source.name().to_string(),
        artifact_path: artifact.path().to_path_buf(),
        outcome,
    })
}

/// Skips sources that report themselves unavailable and rejects answers for
/// another entity.
fn fetch(
    source: &dyn PriceSource,
    entity_id: &str,
    window: FetchWindow,
) -> Result<FetchResult, SourceError> {
    if !source.is_available() {
        return Err(SourceError::Other(format!(
            "{} is not accepting requests",
            source.name()
        )));
    }
    let result = source.fetch(entity_id, window)?;
    if result.entity_id != entity_id {
        return Err(SourceError::ResponseFormatChanged(format!(
            "asked for {entity_id}, got {}",
            result.entity_id
        )));
    }
    Ok(result)
}

/// Ascending by timestamp, one point per instant, valid prices only, tagged
/// with `entity_id`. The first point seen for a timestamp wins.
fn canonicalize(entity_id: &str, mut points: Vec<PricePoint>) -> Vec<PricePoint> {
    points.retain(PricePoint::is_valid);
    points.sort_by_key(|p| p.timestamp);
    points.dedup_by_key(|p| p.timestamp);
    for point in &mut points {
        if point.entity_id != entity_id {
            point.entity_id = entity_id.to_string();
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FixedSource, SourceKind};
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FailingSource;

    impl PriceSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        fn fetch(&self, _entity_id: &str, _window: FetchWindow) -> Result<FetchResult, SourceError> {
            Err(SourceError::NetworkUnreachable("connection refused".into()))
        }
    }

    /// Reports itself unavailable and records whether it was asked anyway.
    #[derive(Default)]
    struct BlockedSource {
        asked: AtomicBool,
    }

    impl PriceSource for BlockedSource {
        fn name(&self) -> &str {
            "blocked"
        }

        fn fetch(&self, entity_id: &str, _window: FetchWindow) -> Result<FetchResult, SourceError> {
            self.asked.store(true, Ordering::SeqCst);
            Ok(FetchResult {
                entity_id: entity_id.to_string(),
                points: vec![PricePoint::new(at(1, 0), 100.0, entity_id)],
                source: SourceKind::Fixed,
            })
        }

        fn is_available(&self) -> bool {
            false
        }
    }

    /// Answers every request with points for another coin.
    struct WrongEntitySource;

    impl PriceSource for WrongEntitySource {
        fn name(&self) -> &str {
            "wrong-entity"
        }

        fn fetch(&self, _entity_id: &str, _window: FetchWindow) -> Result<FetchResult, SourceError> {
            Ok(FetchResult {
                entity_id: "ethereum".to_string(),
                points: vec![PricePoint::new(at(1, 0), 2000.0, "ethereum")],
                source: SourceKind::Fixed,
            })
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn canonicalize_sorts_dedups_and_drops_invalid() {
        let points = vec![
            PricePoint::new(at(2, 0), 110.0, "bitcoin"),
            PricePoint::new(at(1, 0), 100.0, "bitcoin"),
            PricePoint::new(at(1, 0), 101.0, "bitcoin"),
            PricePoint::new(at(1, 12), f64::NAN, "bitcoin"),
            PricePoint::new(at(1, 18), -5.0, "bitcoin"),
        ];

        let out = canonicalize("bitcoin", points);
        let prices: Vec<f64> = out.iter().map(|p| p.price).collect();
        assert_eq!(prices, vec![100.0, 110.0]);
    }

    #[test]
    fn fetched_points_are_staged_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = StagingArtifact::new(dir.path().join("extracted_bitcoin.json"));
        let source = FixedSource::new(vec![
            PricePoint::new(at(2, 0), 110.0, "bitcoin"),
            PricePoint::new(at(1, 0), 100.0, "bitcoin"),
        ]);

        let report = extract_at(&source, "bitcoin", 30, &artifact, at(3, 0)).unwrap();

        assert_eq!(
            report.outcome,
            ExtractOutcome::Fetched {
                points: 2,
                dropped: 0
            }
        );
        assert_eq!(report.window_start, at(3, 0) - Duration::days(30));
        let batch = artifact.read_batch().unwrap();
        assert_eq!(batch.points[0].timestamp, at(1, 0));
        let meta = batch.meta.unwrap();
        assert_eq!(meta.source, SourceKind::Fixed.as_str());
        assert!(!meta.is_degraded());
    }

    #[test]
    fn source_failure_degrades_to_empty_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = StagingArtifact::new(dir.path().join("extracted_bitcoin.json"));

        let report = extract_at(&FailingSource, "bitcoin", 30, &artifact, at(3, 0)).unwrap();

        assert!(report.is_degraded());
        assert_eq!(report.points_staged(), 0);
        let batch = artifact.read_batch().unwrap();
        assert!(batch.points.is_empty());
        let reason = batch.meta.unwrap().degraded.unwrap();
        assert!(reason.contains("connection refused"));
    }

    #[test]
    fn unwritable_artifact_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the artifact file should go.
        let path = dir.path().join("extracted_bitcoin.json");
        std::fs::create_dir(&path).unwrap();
        let artifact = StagingArtifact::new(path);

        let result = extract_at(&FailingSource, "bitcoin", 30, &artifact, at(3, 0));
        assert!(matches!(result, Err(ExtractError::Staging(_))));
    }

    #[test]
    fn out_of_range_window_degrades_instead_of_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = StagingArtifact::new(dir.path().join("extracted_bitcoin.json"));
        let source = FixedSource::new(vec![PricePoint::new(at(1, 0), 100.0, "bitcoin")]);

        let report = extract_at(&source, "bitcoin", 200_000_000, &artifact, at(3, 0)).unwrap();

        let ExtractOutcome::Degraded { reason } = &report.outcome else {
            panic!("expected a degraded extract, got {:?}", report.outcome);
        };
        assert!(reason.contains("invalid fetch window"), "{reason}");
        assert_eq!(report.window_start, at(3, 0));
        let batch = artifact.read_batch().unwrap();
        assert!(batch.points.is_empty());
        assert!(batch.meta.unwrap().is_degraded());
    }

    #[test]
    fn unavailable_source_is_not_asked() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = StagingArtifact::new(dir.path().join("extracted_bitcoin.json"));
        let source = BlockedSource::default();

        let report = extract_at(&source, "bitcoin", 30, &artifact, at(3, 0)).unwrap();

        assert!(report.is_degraded());
        assert!(!source.asked.load(Ordering::SeqCst));
        assert!(artifact.read_batch().unwrap().points.is_empty());
    }

    #[test]
    fn answer_for_another_entity_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = StagingArtifact::new(dir.path().join("extracted_bitcoin.json"));

        let report = extract_at(&WrongEntitySource, "bitcoin", 30, &artifact, at(3, 0)).unwrap();

        let ExtractOutcome::Degraded { reason } = &report.outcome else {
            panic!("expected a degraded extract, got {:?}", report.outcome);
        };
        assert!(reason.contains("got ethereum"), "{reason}");
        assert!(artifact.read_batch().unwrap().points.is_empty());
    }

    #[test]
    fn fixed_points_outside_the_window_are_not_staged() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = StagingArtifact::new(dir.path().join("extracted_bitcoin.json"));
        let source = FixedSource::new(vec![
            PricePoint::new(at(1, 0), 100.0, "bitcoin"),
            PricePoint::new(at(2, 12), 110.0, "bitcoin"),
        ]);

        let report = extract_at(&source, "bitcoin", 1, &artifact, at(3, 0)).unwrap();

        assert_eq!(report.points_staged(), 1);
        assert_eq!(artifact.read_batch().unwrap().points[0].price, 110.0);
    }
}
