//! Price source trait and structured error types.
//!
//! The PriceSource trait abstracts over market-data backends (CoinGecko,
//! synthetic random walks, fixed fixtures) so the extractor can swap them and
//! tests can inject failures.

use crate::domain::PricePoint;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a fetch failed. Every variant is absorbed by the extractor.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by source (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("entity not found: {entity_id}")]
    EntityNotFound { entity_id: String },

    #[error("invalid fetch window: {0}")]
    InvalidWindow(String),

    #[error("hard stop: source has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("source error: {0}")]
    Other(String),
}

/// Trailing time range a fetch covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub days: u32,
}

impl FetchWindow {
    /// The `days`-day window ending at `end`. Fails if the start falls
    /// outside the representable date range.
    pub fn trailing(days: u32, end: DateTime<Utc>) -> Result<Self, SourceError> {
        let start = end
            .checked_sub_signed(Duration::days(i64::from(days)))
            .ok_or_else(|| {
                SourceError::InvalidWindow(format!("{days} days before {end} is out of range"))
            })?;
        Ok(Self { start, end, days })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// Points returned by a successful fetch.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub entity_id: String,
    pub points: Vec<PricePoint>,
    pub source: SourceKind,
}

/// Where the points came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    CoinGecko,
    Synthetic,
    Fixed,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::CoinGecko => "coingecko",
            SourceKind::Synthetic => "synthetic",
            SourceKind::Fixed => "fixed",
        }
    }
}

/// A market-data backend.
///
/// Implementations only fetch and normalize; they know nothing about the
/// staging artifact or the store.
pub trait PriceSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Fetch ordered price points for an entity over a window.
    fn fetch(&self, entity_id: &str, window: FetchWindow) -> Result<FetchResult, SourceError>;

    /// Whether the source is currently usable (not rate-limited, not blocked).
    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn trailing_window_spans_requested_days() {
        let end = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let window = FetchWindow::trailing(30, end).unwrap();

        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
        assert!(window.contains(end));
        assert!(window.contains(window.start));
        assert!(!window.contains(window.start - Duration::seconds(1)));
    }

    #[test]
    fn window_before_the_calendar_start_is_rejected() {
        let end = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            FetchWindow::trailing(u32::MAX, end),
            Err(SourceError::InvalidWindow(_))
        ));
    }

    #[test]
    fn source_kind_names_are_stable() {
        assert_eq!(SourceKind::CoinGecko.as_str(), "coingecko");
        assert_eq!(
            serde_json::to_string(&SourceKind::Synthetic).unwrap(),
            "\"synthetic\""
        );
    }
}
