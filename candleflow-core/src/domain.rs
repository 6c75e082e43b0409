//! Record shapes that flow between stages.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One observed price, as written to the staging artifact.
///
/// `timestamp` is the observation instant in UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub entity_id: String,
}

impl PricePoint {
    pub fn new(timestamp: DateTime<Utc>, price: f64, entity_id: impl Into<String>) -> Self {
        Self {
            timestamp,
            price,
            entity_id: entity_id.into(),
        }
    }

    /// Prices must be finite and non-negative.
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price >= 0.0
    }
}

/// A row of the durable raw table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPriceRecord {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub entity_id: String,
    pub loaded_at: DateTime<Utc>,
}

/// A row of the derived daily candlestick table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub trade_date: NaiveDate,
    pub entity_id: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl DailyAggregate {
    pub fn is_up(&self) -> bool {
        self.close >= self.open
    }
}
