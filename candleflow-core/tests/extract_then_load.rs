//! Extract and load wired together the way a run chains them.

use candleflow_core::data::{FetchResult, FetchWindow, PriceSource, SourceError, SyntheticSource};
use candleflow_core::extract::extract_at;
use candleflow_core::{load, LoadOutcome, PriceStore, StagingArtifact};
use chrono::{TimeZone, Utc};

struct DownSource;

impl PriceSource for DownSource {
    fn name(&self) -> &str {
        "down"
    }

    fn fetch(&self, _entity_id: &str, _window: FetchWindow) -> Result<FetchResult, SourceError> {
        Err(SourceError::RateLimited {
            retry_after_secs: 60,
        })
    }
}

#[test]
fn synthetic_extract_loads_every_point() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = StagingArtifact::new(dir.path().join("staging/extracted_bitcoin.json"));
    let db = dir.path().join("data/crypto.sqlite");
    let end = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();

    let report = extract_at(&SyntheticSource::default(), "bitcoin", 2, &artifact, end).unwrap();
    let result = load(&artifact, "bitcoin", &db).unwrap();

    assert_eq!(result.records_written, report.points_staged());
    let store = PriceStore::open(&db).unwrap();
    let records = store.records_for("bitcoin").unwrap();
    assert_eq!(records.len(), 49);
    assert!(records.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}

#[test]
fn outage_produces_wellformed_empty_artifact_and_no_load() {
    // GIVEN yesterday's successful run
    let dir = tempfile::tempdir().unwrap();
    let artifact = StagingArtifact::new(dir.path().join("extracted_bitcoin.json"));
    let db = dir.path().join("crypto.sqlite");
    let end = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
    extract_at(&SyntheticSource::default(), "bitcoin", 1, &artifact, end).unwrap();
    load(&artifact, "bitcoin", &db).unwrap();

    // WHEN today's extract hits a rate limit
    let report = extract_at(&DownSource, "bitcoin", 1, &artifact, end).unwrap();

    // THEN the stage still succeeds with an empty, parseable artifact
    assert!(report.is_degraded());
    assert_eq!(std::fs::read_to_string(artifact.path()).unwrap().trim(), "[]");

    // AND the loader keeps yesterday's rows
    let result = load(&artifact, "bitcoin", &db).unwrap();
    assert!(matches!(result.outcome, LoadOutcome::SkippedDegraded { .. }));
    assert_eq!(PriceStore::open(&db).unwrap().count_for("bitcoin").unwrap(), 25);
}
