//! Visualize stage: daily candles to an SVG chart plus a CSV of what was drawn.
//!
//! Outputs for an entity, both replaced atomically on every render:
//! - `{charts_dir}/{entity}_candlestick.svg`
//! - `{charts_dir}/{entity}_candles.csv`
//!
//! No database or no rows for the entity is `NoDataSkipped`, not an error.

use candleflow_core::atomic::write_atomic;
use candleflow_core::{DailyAggregate, PriceStore, StoreError};
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const WIDTH: f64 = 960.0;
const HEIGHT: f64 = 540.0;
const MARGIN_LEFT: f64 = 80.0;
const MARGIN_RIGHT: f64 = 24.0;
const MARGIN_TOP: f64 = 48.0;
const MARGIN_BOTTOM: f64 = 64.0;
const Y_TICKS: usize = 5;

const UP_COLOR: &str = "#26a69a";
const DOWN_COLOR: &str = "#ef5350";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to build candle CSV: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderOutcome {
    Chart {
        path: PathBuf,
        csv_path: PathBuf,
        candles: usize,
    },
    NoDataSkipped,
}

pub fn chart_path(charts_dir: &Path, entity_id: &str) -> PathBuf {
    charts_dir.join(format!("{entity_id}_candlestick.svg"))
}

pub fn candles_csv_path(charts_dir: &Path, entity_id: &str) -> PathBuf {
    charts_dir.join(format!("{entity_id}_candles.csv"))
}

/// Render the daily candles for `entity_id` from the store at `database`.
pub fn render(
    entity_id: &str,
    database: &Path,
    charts_dir: &Path,
) -> Result<RenderOutcome, RenderError> {
    let Some(store) = PriceStore::open_read_only(database)? else {
        log::warn!(
            "database {} not found; nothing to draw for {entity_id}",
            database.display()
        );
        return Ok(RenderOutcome::NoDataSkipped);
    };

    let candles = store.daily_aggregates(entity_id)?;
    drop(store);

    if candles.is_empty() {
        log::warn!("no daily candles for {entity_id}; skipping chart");
        return Ok(RenderOutcome::NoDataSkipped);
    }

    let path = chart_path(charts_dir, entity_id);
    let svg = render_svg(entity_id, &candles);
    write_atomic(&path, svg.as_bytes()).map_err(|source| RenderError::Io {
        path: path.clone(),
        source,
    })?;

    let csv_path = candles_csv_path(charts_dir, entity_id);
    let csv = candles_csv(&candles)?;
    write_atomic(&csv_path, csv.as_bytes()).map_err(|source| RenderError::Io {
        path: csv_path.clone(),
        source,
    })?;

    log::info!(
        "chart for {entity_id} ({} candles) saved to {}",
        candles.len(),
        path.display()
    );

    Ok(RenderOutcome::Chart {
        path,
        csv_path,
        candles: candles.len(),
    })
}

/// Columns: trade_date, entity_id, open, high, low, close
pub fn candles_csv(candles: &[DailyAggregate]) -> Result<String, RenderError> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(["trade_date", "entity_id", "open", "high", "low", "close"])?;
    for c in candles {
        wtr.write_record([
            &c.trade_date.to_string(),
            &c.entity_id,
            &format!("{:.6}", c.open),
            &format!("{:.6}", c.high),
            &format!("{:.6}", c.low),
            &format!("{:.6}", c.close),
        ])?;
    }
    let bytes = wtr
        .into_inner()
        .map_err(|e| RenderError::Csv(e.into_error().into()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Price-axis bounds with a little headroom. A flat series gets a band
/// around its single value so the candles stay visible.
fn price_bounds(candles: &[DailyAggregate]) -> (f64, f64) {
    let lo = candles.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let hi = candles.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let span = hi - lo;
    if span.abs() < 1e-9 {
        let pad = (hi.abs() * 0.01).max(1.0);
        return (lo - pad, hi + pad);
    }
    (lo - span * 0.05, hi + span * 0.05)
}

/// Map a price to a y coordinate inside the plot area (smaller y is higher).
fn price_to_y(price: f64, y_min: f64, y_max: f64) -> f64 {
    let plot_height = HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;
    if (y_max - y_min).abs() < 1e-9 {
        return MARGIN_TOP + plot_height / 2.0;
    }
    let frac = ((price - y_min) / (y_max - y_min)).clamp(0.0, 1.0);
    MARGIN_TOP + plot_height * (1.0 - frac)
}

pub fn render_svg(entity_id: &str, candles: &[DailyAggregate]) -> String {
    let (y_min, y_max) = price_bounds(candles);
    let plot_width = WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
    let slot = plot_width / candles.len().max(1) as f64;
    let body_width = (slot * 0.6).max(1.0);

    let mut svg = String::new();
    // fmt::Write into a String cannot fail.
    let _ = writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" viewBox="0 0 {WIDTH} {HEIGHT}">"#
    );
    let _ = writeln!(svg, r##"<rect width="100%" height="100%" fill="#ffffff"/>"##);
    let _ = writeln!(
        svg,
        r#"<text x="{}" y="28" font-family="sans-serif" font-size="18" text-anchor="middle">{} daily candlestick</text>"#,
        WIDTH / 2.0,
        xml_escape(entity_id)
    );

    // Price grid and labels.
    for i in 0..=Y_TICKS {
        let price = y_min + (y_max - y_min) * i as f64 / Y_TICKS as f64;
        let y = price_to_y(price, y_min, y_max);
        let _ = writeln!(
            svg,
            r##"<line x1="{MARGIN_LEFT}" y1="{y:.2}" x2="{:.2}" y2="{y:.2}" stroke="#e0e0e0"/>"##,
            WIDTH - MARGIN_RIGHT
        );
        let _ = writeln!(
            svg,
            r#"<text x="{:.2}" y="{:.2}" font-family="sans-serif" font-size="11" text-anchor="end">{price:.2}</text>"#,
            MARGIN_LEFT - 6.0,
            y + 4.0
        );
    }

    let label_every = (candles.len() / 8).max(1);
    for (i, c) in candles.iter().enumerate() {
        let x = MARGIN_LEFT + slot * (i as f64 + 0.5);
        let color = if c.is_up() { UP_COLOR } else { DOWN_COLOR };

        let wick_top = price_to_y(c.high, y_min, y_max);
        let wick_bottom = price_to_y(c.low, y_min, y_max);
        let body_top = price_to_y(c.open.max(c.close), y_min, y_max);
        let body_bottom = price_to_y(c.open.min(c.close), y_min, y_max);
        let body_height = (body_bottom - body_top).max(1.0);

        let _ = writeln!(
            svg,
            r#"<line x1="{x:.2}" y1="{wick_top:.2}" x2="{x:.2}" y2="{wick_bottom:.2}" stroke="{color}"/>"#
        );
        let _ = writeln!(
            svg,
            r#"<rect x="{:.2}" y="{body_top:.2}" width="{body_width:.2}" height="{body_height:.2}" fill="{color}"><title>{} O {:.2} H {:.2} L {:.2} C {:.2}</title></rect>"#,
            x - body_width / 2.0,
            c.trade_date,
            c.open,
            c.high,
            c.low,
            c.close
        );

        if i % label_every == 0 {
            let _ = writeln!(
                svg,
                r#"<text x="{x:.2}" y="{:.2}" font-family="sans-serif" font-size="11" text-anchor="middle">{}</text>"#,
                HEIGHT - MARGIN_BOTTOM + 18.0,
                c.trade_date.format("%m-%d")
            );
        }
    }

    let _ = writeln!(svg, "</svg>");
    svg
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
