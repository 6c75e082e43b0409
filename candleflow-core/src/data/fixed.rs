//! Source that serves a fixed set of points, e.g. a replayed fixture.

use super::provider::{FetchResult, FetchWindow, PriceSource, SourceError, SourceKind};
use crate::domain::PricePoint;

pub struct FixedSource {
    points: Vec<PricePoint>,
}

impl FixedSource {
    pub fn new(points: Vec<PricePoint>) -> Self {
        Self { points }
    }
}

impl PriceSource for FixedSource {
    fn name(&self) -> &str {
        "fixed"
    }

    /// Returns the stored points for `entity_id` that fall inside the window.
    fn fetch(&self, entity_id: &str, window: FetchWindow) -> Result<FetchResult, SourceError> {
        Ok(FetchResult {
            entity_id: entity_id.to_string(),
            points: self
                .points
                .iter()
                .filter(|p| p.entity_id == entity_id && window.contains(p.timestamp))
                .cloned()
                .collect(),
            source: SourceKind::Fixed,
        })
    }
}
