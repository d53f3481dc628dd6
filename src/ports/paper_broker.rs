//! In-process paper broker for dry runs and integration tests.
//!
//! Orders fill immediately at the last marked price for the instrument,
//! with optional slippage in basis points. Fill events are pushed into the
//! channel handed over at construction, each stamped with a monotonically
//! increasing sequence number per order. Partial fills and rejects can be
//! scripted per instrument to exercise the reconciliation paths.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::execution::broker::{BrokerConnector, BrokerError, OrderAck};
use crate::market::MarketTick;
use crate::portfolio::{FillEvent, Side};

#[derive(Debug, Clone, Copy)]
enum FillScript {
    /// Fill the given fraction of the order, leave the rest resting.
    Partial(f64),
    /// Accept the order but never fill it.
    NoFill,
    Reject,
}

pub struct PaperBroker {
    fills: mpsc::Sender<FillEvent>,
    marks: Mutex<HashMap<String, Decimal>>,
    scripts: Mutex<HashMap<String, FillScript>>,
    slippage_bps: Decimal,
    seq: AtomicU64,
    clock_ts: AtomicI64,
}

impl PaperBroker {
    pub fn new(fills: mpsc::Sender<FillEvent>) -> Self {
        Self {
            fills,
            marks: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            slippage_bps: Decimal::ZERO,
            seq: AtomicU64::new(0),
            clock_ts: AtomicI64::new(0),
        }
    }

    pub fn with_slippage_bps(mut self, bps: u32) -> Self {
        self.slippage_bps = Decimal::from(bps) / Decimal::from(10_000);
        self
    }

    /// Update the reference price used for subsequent fills.
    pub fn mark(&self, instrument: &str, price: Decimal) {
        if let Ok(mut marks) = self.marks.lock() {
            marks.insert(instrument.to_string(), price);
        }
    }

    /// Advance the simulated clock; fills are stamped with this timestamp.
    pub fn set_clock(&self, ts: i64) {
        self.clock_ts.store(ts, Ordering::SeqCst);
    }

    pub fn script_partial(&self, instrument: &str, fraction: f64) {
        self.script(instrument, FillScript::Partial(fraction));
    }

    pub fn script_no_fill(&self, instrument: &str) {
        self.script(instrument, FillScript::NoFill);
    }

    pub fn script_reject(&self, instrument: &str) {
        self.script(instrument, FillScript::Reject);
    }

    pub fn clear_scripts(&self) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.clear();
        }
    }

    fn script(&self, instrument: &str, script: FillScript) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(instrument.to_string(), script);
        }
    }

    fn fill_price(&self, mark: Decimal, side: Side) -> Decimal {
        match side {
            Side::Buy => mark * (Decimal::ONE + self.slippage_bps),
            Side::Sell => mark * (Decimal::ONE - self.slippage_bps),
        }
    }
}

#[async_trait]
impl BrokerConnector for PaperBroker {
    async fn place_order(
        &self,
        order_id: &str,
        instrument: &str,
        side: Side,
        quantity: Decimal,
        limit_price: Option<Decimal>,
    ) -> Result<OrderAck, BrokerError> {
        let script = self
            .scripts
            .lock()
            .map(|s| s.get(instrument).copied())
            .unwrap_or(None);
        if matches!(script, Some(FillScript::Reject)) {
            return Err(BrokerError::Rejected(format!(
                "paper reject for {}",
                instrument
            )));
        }

        let mark = self
            .marks
            .lock()
            .ok()
            .and_then(|m| m.get(instrument).copied())
            .or(limit_price)
            .ok_or_else(|| {
                BrokerError::Rejected(format!("no reference price for {}", instrument))
            })?;

        let ts = self.clock_ts.load(Ordering::SeqCst);
        let ack = OrderAck { accepted_ts: ts };

        let fill_qty = match script {
            Some(FillScript::NoFill) => Decimal::ZERO,
            Some(FillScript::Partial(fraction)) => {
                let f = Decimal::from_f64(fraction).unwrap_or(Decimal::ONE);
                quantity * f
            }
            _ => quantity,
        };
        if fill_qty > Decimal::ZERO {
            let fill = FillEvent {
                order_id: order_id.to_string(),
                seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
                quantity: fill_qty,
                price: self.fill_price(mark, side),
                ts,
            };
            if self.fills.send(fill).await.is_err() {
                log::warn!("[PAPER] fill channel closed; fill dropped");
            }
        }
        Ok(ack)
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<(), BrokerError> {
        // resting quantity simply never fills; nothing to tear down
        Ok(())
    }
}

// One line per timestep in the replay dump.
#[derive(Debug, Clone, Deserialize)]
struct ReplayEntry {
    timestamp: i64,
    prices: HashMap<String, Decimal>,
}

/// Tick source replaying a JSONL price dump through the paper broker.
/// Each line is `{"timestamp": <secs>, "prices": {"SYM": "123.45", ...}}`.
pub struct ReplayFeed {
    entries: Vec<ReplayEntry>,
}

impl ReplayFeed {
    pub fn from_jsonl_path(path: &str) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open replay file {}", path))?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("failed to read replay file {}", path))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: ReplayEntry = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse replay entry '{}'", line))?;
            entries.push(entry);
        }
        if entries.is_empty() {
            anyhow::bail!("replay file {} is empty", path);
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drive the replay: mark the broker, then push each tick into the
    /// bounded channel. A full queue blocks the feed rather than dropping
    /// data. Returns when the dump is exhausted or the consumer is gone.
    pub async fn run(self, broker: Arc<PaperBroker>, ticks: mpsc::Sender<MarketTick>) {
        let total = self.entries.len();
        for entry in self.entries {
            broker.set_clock(entry.timestamp);
            let mut instruments: Vec<&String> = entry.prices.keys().collect();
            instruments.sort();
            for instrument in instruments {
                let price = entry.prices[instrument];
                broker.mark(instrument, price);
                let tick = MarketTick {
                    instrument: instrument.clone(),
                    ts: entry.timestamp,
                    price,
                    volume: None,
                };
                if ticks.send(tick).await.is_err() {
                    log::info!("[PAPER] tick consumer gone, replay stopped");
                    return;
                }
            }
        }
        log::info!("[PAPER] replay finished, {} timesteps", total);
    }
}
