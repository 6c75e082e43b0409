//! Price sources

pub mod circuit_breaker;
pub mod coingecko;
pub mod fixed;
pub mod provider;
pub mod synthetic;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use coingecko::CoinGeckoSource;
pub use fixed::FixedSource;
pub use provider::{FetchResult, FetchWindow, PriceSource, SourceError, SourceKind};
pub use synthetic::SyntheticSource;
