use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Immutable reference data for a tradeable instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: String,
    pub tick_size: Decimal,
    pub lot_size: Decimal,
}

impl Instrument {
    pub fn new(id: &str, tick_size: Decimal, lot_size: Decimal) -> Self {
        Self {
            id: id.to_string(),
            tick_size,
            lot_size,
        }
    }
}

/// A single market data event as delivered by the feed connector.
#[derive(Debug, Clone)]
pub struct MarketTick {
    pub instrument: String,
    pub ts: i64,
    pub price: Decimal,
    pub volume: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub ts: i64,
    pub price: f64,
}

#[derive(Debug, Error)]
#[error("stale tick for {instrument}: ts={ts} <= last accepted ts={last_ts}")]
pub struct StaleDataError {
    pub instrument: String,
    pub ts: i64,
    pub last_ts: i64,
}

#[derive(Debug, Default, Clone)]
struct PriceSeries {
    points: VecDeque<PricePoint>,
}

/// Rolling per-instrument price history, bounded to `capacity` points.
///
/// Timestamps are strictly increasing within a series; a tick at or before
/// the last accepted timestamp is rejected without mutating state. Eviction
/// of the oldest point is O(1).
#[derive(Debug, Clone)]
pub struct PriceSeriesStore {
    capacity: usize,
    series: HashMap<String, PriceSeries>,
}

impl PriceSeriesStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            series: HashMap::new(),
        }
    }

    pub fn ingest(&mut self, instrument: &str, ts: i64, price: f64) -> Result<(), StaleDataError> {
        let series = self.series.entry(instrument.to_string()).or_default();
        if let Some(last) = series.points.back() {
            if ts <= last.ts {
                return Err(StaleDataError {
                    instrument: instrument.to_string(),
                    ts,
                    last_ts: last.ts,
                });
            }
        }
        if series.points.len() >= self.capacity {
            series.points.pop_front();
        }
        series.points.push_back(PricePoint { ts, price });
        Ok(())
    }

    /// Last `n` points for an instrument, oldest first. Returns fewer than
    /// `n` (possibly none) when history is short; never an error.
    pub fn window(&self, instrument: &str, n: usize) -> Vec<PricePoint> {
        let Some(series) = self.series.get(instrument) else {
            return Vec::new();
        };
        let take = n.min(series.points.len());
        let mut v: Vec<PricePoint> = series.points.iter().rev().take(take).copied().collect();
        v.reverse();
        v
    }

    /// Last `n` prices only, oldest first.
    pub fn prices(&self, instrument: &str, n: usize) -> Vec<f64> {
        self.window(instrument, n).iter().map(|p| p.price).collect()
    }

    pub fn len(&self, instrument: &str) -> usize {
        self.series.get(instrument).map_or(0, |s| s.points.len())
    }

    pub fn is_empty(&self, instrument: &str) -> bool {
        self.len(instrument) == 0
    }

    pub fn last(&self, instrument: &str) -> Option<PricePoint> {
        self.series
            .get(instrument)
            .and_then(|s| s.points.back().copied())
    }
}
