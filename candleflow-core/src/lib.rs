//! candleflow core: configuration, price sources, staging artifact, store, extract and load.
//!
//! This crate holds the data-moving half of the ELT pipeline:
//! - Explicit pipeline configuration (no ambient globals)
//! - Price sources behind the `PriceSource` trait (CoinGecko, synthetic, fixed)
//! - The staging artifact: atomic JSON hand-off between extract and load
//! - The SQLite price store and its canonical raw table
//! - The extractor (degrades to an empty artifact on source failure)
//! - The idempotent, entity-scoped delete-then-insert loader

pub mod atomic;
pub mod config;
pub mod data;
pub mod domain;
pub mod extract;
pub mod load;
pub mod staging;
pub mod store;

pub use config::{ConfigError, PipelineConfig, SourceConfig, TransformConfig};
pub use domain::{DailyAggregate, PricePoint, RawPriceRecord};
pub use extract::{extract, ExtractError, ExtractOutcome, ExtractReport};
pub use load::{load, LoadError, LoadOutcome, LoadResult};
pub use staging::{StagingArtifact, StagingError, StagingMeta};
pub use store::{PriceStore, StoreError};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: everything a stage hands across the pipeline is Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<PricePoint>();
        require_sync::<PricePoint>();
        require_send::<RawPriceRecord>();
        require_sync::<RawPriceRecord>();
        require_send::<DailyAggregate>();
        require_sync::<DailyAggregate>();
        require_send::<PipelineConfig>();
        require_sync::<PipelineConfig>();
        require_send::<StagingMeta>();
        require_sync::<StagingMeta>();
        require_send::<ExtractReport>();
        require_sync::<ExtractReport>();
        require_send::<LoadResult>();
        require_sync::<LoadResult>();
        require_send::<data::CircuitBreaker>();
        require_sync::<data::CircuitBreaker>();
        require_send::<data::CoinGeckoSource>();
        require_sync::<data::CoinGeckoSource>();
        require_send::<data::SyntheticSource>();
        require_sync::<data::SyntheticSource>();
    }

    /// Architecture contract: a price source only sees the entity and the window.
    ///
    /// Sources never touch the staging artifact or the store; the extractor owns
    /// that hand-off. If the trait grows a path or connection parameter this
    /// stops compiling.
    #[test]
    fn price_source_trait_sees_only_entity_and_window() {
        fn _check_trait_object_builds(
            source: &dyn data::PriceSource,
            window: data::FetchWindow,
        ) -> Result<data::FetchResult, data::SourceError> {
            source.fetch("bitcoin", window)
        }
    }
}
