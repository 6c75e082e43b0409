//! CoinGecko market-chart source.
//!
//! Fetches `[[unix_ms, price], ...]` pairs from
//! `/coins/{id}/market_chart?vs_currency=..&days=..`. Handles rate limiting,
//! retries with exponential backoff and the circuit breaker. Granularity is
//! decided by CoinGecko (hourly for windows between 2 and 90 days).

use super::circuit_breaker::CircuitBreaker;
use super::provider::{FetchResult, FetchWindow, PriceSource, SourceError, SourceKind};
use crate::config::SourceConfig;
use crate::domain::PricePoint;
use chrono::DateTime;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Market chart response. Only `prices` is consumed.
#[derive(Debug, Deserialize)]
struct MarketChartResponse {
    prices: Option<Vec<(f64, f64)>>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

pub struct CoinGeckoSource {
    client: reqwest::blocking::Client,
    circuit_breaker: Arc<CircuitBreaker>,
    base_url: String,
    vs_currency: String,
    api_key: Option<String>,
    max_retries: u32,
    base_delay: Duration,
}

impl CoinGeckoSource {
    pub fn new(
        config: &SourceConfig,
        vs_currency: &str,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("candleflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            circuit_breaker,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            vs_currency: vs_currency.to_string(),
            api_key: config.resolved_api_key(),
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
        })
    }

    fn market_chart_url(&self, entity_id: &str, days: u32) -> String {
        format!(
            "{}/coins/{entity_id}/market_chart?vs_currency={}&days={days}",
            self.base_url, self.vs_currency
        )
    }

    /// Turn the raw `prices` pairs into ordered points for `entity_id`.
    fn parse_response(
        entity_id: &str,
        resp: MarketChartResponse,
    ) -> Result<Vec<PricePoint>, SourceError> {
        let prices = resp
            .prices
            .ok_or_else(|| SourceError::ResponseFormatChanged("no `prices` field".into()))?;

        let mut points = Vec::with_capacity(prices.len());
        for (ts_ms, price) in prices {
            if !ts_ms.is_finite() {
                return Err(SourceError::ResponseFormatChanged(format!(
                    "invalid timestamp: {ts_ms}"
                )));
            }
            let timestamp = DateTime::from_timestamp_millis(ts_ms as i64).ok_or_else(|| {
                SourceError::ResponseFormatChanged(format!("timestamp out of range: {ts_ms}"))
            })?;
            points.push(PricePoint::new(timestamp, price, entity_id));
        }

        Ok(points)
    }

    fn fetch_with_retry(
        &self,
        entity_id: &str,
        window: FetchWindow,
    ) -> Result<Vec<PricePoint>, SourceError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(SourceError::CircuitBreakerTripped);
        }

        let url = self.market_chart_url(entity_id, window.days);
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.base_delay * 2u32.pow(attempt - 1);
                log::debug!("retrying {entity_id} in {delay:?} (attempt {attempt})");
                std::thread::sleep(delay);
            }

            if !self.circuit_breaker.is_allowed() {
                return Err(SourceError::CircuitBreakerTripped);
            }

            let mut request = self.client.get(&url);
            if let Some(key) = &self.api_key {
                request = request.header("x-cg-demo-api-key", key);
            }

            let resp = match request.send() {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    log::warn!("request for {entity_id} failed: {e}");
                    last_error = Some(SourceError::NetworkUnreachable(e.to_string()));
                    continue;
                }
                Err(e) => return Err(SourceError::NetworkUnreachable(e.to_string())),
            };

            let status = resp.status();

            if status == reqwest::StatusCode::FORBIDDEN {
                self.circuit_breaker.trip();
                return Err(SourceError::CircuitBreakerTripped);
            }

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                self.circuit_breaker.record_failure();
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                log::warn!("rate limited fetching {entity_id} (retry after {retry_after}s)");
                last_error = Some(SourceError::RateLimited {
                    retry_after_secs: retry_after,
                });
                continue;
            }

            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(SourceError::AuthenticationRequired(format!(
                    "CoinGecko rejected the request (set {})",
                    crate::config::API_KEY_ENV
                )));
            }

            if status == reqwest::StatusCode::NOT_FOUND {
                let detail = resp
                    .json::<ErrorBody>()
                    .ok()
                    .and_then(|b| b.error)
                    .unwrap_or_default();
                log::debug!("404 for {entity_id}: {detail}");
                return Err(SourceError::EntityNotFound {
                    entity_id: entity_id.to_string(),
                });
            }

            if !status.is_success() {
                self.circuit_breaker.record_failure();
                last_error = Some(SourceError::Other(format!("HTTP {status} for {entity_id}")));
                continue;
            }

            let chart: MarketChartResponse = resp.json().map_err(|e| {
                SourceError::ResponseFormatChanged(format!(
                    "failed to parse response for {entity_id}: {e}"
                ))
            })?;

            let points = Self::parse_response(entity_id, chart)?;
            self.circuit_breaker.record_success();
            return Ok(points);
        }

        Err(last_error.unwrap_or_else(|| SourceError::Other("max retries exceeded".into())))
    }
}

impl PriceSource for CoinGeckoSource {
    fn name(&self) -> &str {
        "coingecko"
    }

    fn fetch(&self, entity_id: &str, window: FetchWindow) -> Result<FetchResult, SourceError> {
        let points = self.fetch_with_retry(entity_id, window)?;
        Ok(FetchResult {
            entity_id: entity_id.to_string(),
            points,
            source: SourceKind::CoinGecko,
        })
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}
