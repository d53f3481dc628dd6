//! Authoritative record of positions, orders and PnL.
//!
//! All mutation happens through the execution engine on the single decision
//! task, so readers always observe a consistent state. Fill application is
//! idempotent: the broker stream is at-least-once and duplicates are keyed
//! out by fill sequence number.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    LongSpread,
    ShortSpread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub pair_key: String,
    pub instrument: String,
    pub side: Side,
    pub quantity: Decimal,
    pub filled: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
    pub created_ts: i64,
    /// Exit legs reduce an existing position; entry legs commit new
    /// capital and count toward exposure while unfilled.
    #[serde(default)]
    pub reduce_only: bool,
}

/// A two-leg spread position. Leg quantities are signed: positive is long.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub pair_key: String,
    pub direction: Direction,
    pub instrument_a: String,
    pub instrument_b: String,
    pub qty_a: Decimal,
    pub qty_b: Decimal,
    pub entry_price_a: Decimal,
    pub entry_price_b: Decimal,
    pub entry_ts: i64,
    pub status: PositionStatus,
}

impl Position {
    fn unrealized_pnl(&self, mark_a: Option<Decimal>, mark_b: Option<Decimal>) -> Decimal {
        let pnl_a = mark_a
            .map(|m| (m - self.entry_price_a) * self.qty_a)
            .unwrap_or(Decimal::ZERO);
        let pnl_b = mark_b
            .map(|m| (m - self.entry_price_b) * self.qty_b)
            .unwrap_or(Decimal::ZERO);
        pnl_a + pnl_b
    }

    fn exposure(&self, mark_a: Option<Decimal>, mark_b: Option<Decimal>) -> Decimal {
        let px_a = mark_a.unwrap_or(self.entry_price_a);
        let px_b = mark_b.unwrap_or(self.entry_price_b);
        self.qty_a.abs() * px_a + self.qty_b.abs() * px_b
    }
}

/// Inbound fill from the broker stream. `seq` is the broker-assigned fill
/// sequence number used for duplicate suppression.
#[derive(Debug, Clone)]
pub struct FillEvent {
    pub order_id: String,
    pub seq: u64,
    pub quantity: Decimal,
    pub price: Decimal,
    pub ts: i64,
}

/// Durable snapshot for crash recovery: reloading reproduces identical
/// Position/Order records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub positions: Vec<Position>,
    pub orders: Vec<Order>,
    pub realized_pnl: Decimal,
    pub peak_equity: f64,
}

#[derive(Debug)]
pub struct PortfolioState {
    base_equity: f64,
    positions: HashMap<String, Position>,
    orders: HashMap<String, Order>,
    marks: HashMap<String, Decimal>,
    realized_pnl: Decimal,
    peak_equity: f64,
    seen_fills: HashMap<String, HashSet<u64>>,
}

impl PortfolioState {
    pub fn new(base_equity: f64) -> Self {
        Self {
            base_equity,
            positions: HashMap::new(),
            orders: HashMap::new(),
            marks: HashMap::new(),
            realized_pnl: Decimal::ZERO,
            peak_equity: base_equity,
            seen_fills: HashMap::new(),
        }
    }

    pub fn register_order(&mut self, order: Order) {
        self.orders.insert(order.id.clone(), order);
    }

    pub fn order(&self, order_id: &str) -> Option<&Order> {
        self.orders.get(order_id)
    }

    pub fn position(&self, pair_key: &str) -> Option<&Position> {
        self.positions.get(pair_key)
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions
            .values()
            .filter(|p| p.status != PositionStatus::Closed)
    }

    pub fn open_position_count(&self) -> usize {
        self.open_positions().count()
    }

    pub fn open_pair_keys(&self) -> HashSet<String> {
        self.open_positions().map(|p| p.pair_key.clone()).collect()
    }

    pub fn mark_price(&mut self, instrument: &str, price: Decimal) {
        self.marks.insert(instrument.to_string(), price);
        let equity = self.equity();
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
    }

    /// Apply a fill to its order. Returns true when the fill advanced state,
    /// false when it was a duplicate (same sequence number) or unknown.
    pub fn apply(&mut self, fill: &FillEvent) -> bool {
        let Some(order) = self.orders.get_mut(&fill.order_id) else {
            log::warn!("[PORTFOLIO] fill for unknown order {}", fill.order_id);
            return false;
        };
        let seen = self.seen_fills.entry(fill.order_id.clone()).or_default();
        if !seen.insert(fill.seq) {
            log::debug!(
                "[PORTFOLIO] duplicate fill seq={} for order {}",
                fill.seq,
                fill.order_id
            );
            return false;
        }
        let prev_filled = order.filled;
        order.filled = (order.filled + fill.quantity).min(order.quantity);
        let applied = order.filled - prev_filled;
        if applied > Decimal::ZERO {
            let prev_notional = order.avg_fill_price.unwrap_or(Decimal::ZERO) * prev_filled;
            order.avg_fill_price = Some((prev_notional + fill.price * applied) / order.filled);
        }
        order.status = if order.filled >= order.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        if order.status.is_terminal() {
            self.seen_fills.remove(&fill.order_id);
        }
        true
    }

    pub fn mark_order_cancelled(&mut self, order_id: &str) {
        if let Some(order) = self.orders.get_mut(order_id) {
            if !order.status.is_terminal() {
                order.status = OrderStatus::Cancelled;
            }
        }
        self.seen_fills.remove(order_id);
    }

    pub fn mark_order_rejected(&mut self, order_id: &str) {
        if let Some(order) = self.orders.get_mut(order_id) {
            if !order.status.is_terminal() {
                order.status = OrderStatus::Rejected;
            }
        }
        self.seen_fills.remove(order_id);
    }

    pub fn open_position(&mut self, position: Position) {
        self.positions.insert(position.pair_key.clone(), position);
    }

    pub fn begin_close(&mut self, pair_key: &str) {
        if let Some(pos) = self.positions.get_mut(pair_key) {
            pos.status = PositionStatus::Closing;
        }
    }

    /// Reconcile a close against the quantities the exit orders actually
    /// filled. PnL is realized on the offset portion only; when either leg
    /// keeps a residual the position stays on the book, reduced, with its
    /// original entry prices and timestamp. Returns true when the position
    /// was fully closed and removed.
    pub fn apply_close(
        &mut self,
        pair_key: &str,
        offset_a: Decimal,
        exit_price_a: Decimal,
        offset_b: Decimal,
        exit_price_b: Decimal,
    ) -> bool {
        let Some(pos) = self.positions.get_mut(pair_key) else {
            return false;
        };
        let off_a = offset_a.min(pos.qty_a.abs());
        let off_b = offset_b.min(pos.qty_b.abs());
        let sign = |q: Decimal| {
            if q < Decimal::ZERO {
                -Decimal::ONE
            } else {
                Decimal::ONE
            }
        };
        let pnl = sign(pos.qty_a) * off_a * (exit_price_a - pos.entry_price_a)
            + sign(pos.qty_b) * off_b * (exit_price_b - pos.entry_price_b);
        self.realized_pnl += pnl;
        pos.qty_a -= sign(pos.qty_a) * off_a;
        pos.qty_b -= sign(pos.qty_b) * off_b;

        let flat = pos.qty_a == Decimal::ZERO && pos.qty_b == Decimal::ZERO;
        if flat {
            self.positions.remove(pair_key);
            log::info!(
                "[PORTFOLIO] {} closed pnl={} realized_total={}",
                pair_key,
                pnl,
                self.realized_pnl
            );
        } else {
            // un-offset legs still exist at the broker; the position goes
            // back to Open so risk and the time stop keep tracking it
            pos.status = PositionStatus::Open;
            log::warn!(
                "[PORTFOLIO] {} partially closed pnl={} residual qty_a={} qty_b={}",
                pair_key,
                pnl,
                pos.qty_a,
                pos.qty_b
            );
        }
        let equity = self.equity();
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        flat
    }

    /// Finalize a full close: realize PnL on the entire position against
    /// the exit prices and drop the record.
    pub fn close_position(&mut self, pair_key: &str, exit_price_a: Decimal, exit_price_b: Decimal) {
        let offsets = self
            .positions
            .get(pair_key)
            .map(|p| (p.qty_a.abs(), p.qty_b.abs()));
        if let Some((off_a, off_b)) = offsets {
            self.apply_close(pair_key, off_a, exit_price_a, off_b, exit_price_b);
        }
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.open_positions()
            .map(|p| {
                p.unrealized_pnl(
                    self.marks.get(&p.instrument_a).copied(),
                    self.marks.get(&p.instrument_b).copied(),
                )
            })
            .sum()
    }

    pub fn equity(&self) -> f64 {
        let pnl = self.realized_pnl + self.unrealized_pnl();
        self.base_equity + pnl.to_f64().unwrap_or(0.0)
    }

    /// Fraction of peak equity currently given back.
    pub fn drawdown(&self) -> f64 {
        if self.peak_equity <= 0.0 {
            return 0.0;
        }
        ((self.peak_equity - self.equity()) / self.peak_equity).max(0.0)
    }

    /// Unfilled notional of a live entry order. Committed capital that has
    /// not turned into a position yet; without it two entries approved back
    /// to back could jointly exceed the exposure limits.
    fn order_exposure(&self, order: &Order) -> f64 {
        if order.reduce_only || order.status.is_terminal() {
            return 0.0;
        }
        let price = self
            .marks
            .get(&order.instrument)
            .copied()
            .or(order.avg_fill_price)
            .unwrap_or(Decimal::ZERO);
        ((order.quantity - order.filled) * price)
            .to_f64()
            .unwrap_or(0.0)
    }

    pub fn aggregate_exposure(&self) -> f64 {
        let positions: f64 = self
            .open_positions()
            .map(|p| {
                p.exposure(
                    self.marks.get(&p.instrument_a).copied(),
                    self.marks.get(&p.instrument_b).copied(),
                )
                .to_f64()
                .unwrap_or(0.0)
            })
            .sum();
        let in_flight: f64 = self.orders.values().map(|o| self.order_exposure(o)).sum();
        positions + in_flight
    }

    pub fn capital_in_use(&self, pair_key: &str) -> f64 {
        let position = self
            .positions
            .get(pair_key)
            .filter(|p| p.status != PositionStatus::Closed)
            .map(|p| {
                p.exposure(
                    self.marks.get(&p.instrument_a).copied(),
                    self.marks.get(&p.instrument_b).copied(),
                )
                .to_f64()
                .unwrap_or(0.0)
            })
            .unwrap_or(0.0);
        let in_flight: f64 = self
            .orders
            .values()
            .filter(|o| o.pair_key == pair_key)
            .map(|o| self.order_exposure(o))
            .sum();
        position + in_flight
    }

    pub fn snapshot(&self) -> PortfolioSnapshot {
        let mut positions: Vec<Position> = self.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.pair_key.cmp(&b.pair_key));
        let mut orders: Vec<Order> = self
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.id.cmp(&b.id));
        PortfolioSnapshot {
            positions,
            orders,
            realized_pnl: self.realized_pnl,
            peak_equity: self.peak_equity,
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let snapshot = self.snapshot();
        let json = serde_json::to_string_pretty(&snapshot)
            .context("failed to serialize portfolio snapshot")?;
        fs::write(path.as_ref(), json).with_context(|| {
            format!(
                "failed to write portfolio snapshot {}",
                path.as_ref().display()
            )
        })?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!(
                "failed to read portfolio snapshot {}",
                path.as_ref().display()
            )
        })?;
        let snapshot: PortfolioSnapshot =
            serde_json::from_str(&content).context("failed to parse portfolio snapshot")?;
        self.restore(snapshot);
        Ok(())
    }

    pub fn restore(&mut self, snapshot: PortfolioSnapshot) {
        self.positions = snapshot
            .positions
            .into_iter()
            .map(|p| (p.pair_key.clone(), p))
            .collect();
        self.orders = snapshot
            .orders
            .into_iter()
            .map(|o| (o.id.clone(), o))
            .collect();
        self.realized_pnl = snapshot.realized_pnl;
        self.peak_equity = snapshot.peak_equity;
        self.seen_fills.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(id: &str, qty: Decimal) -> Order {
        Order {
            id: id.to_string(),
            pair_key: "AAA/BBB".to_string(),
            instrument: "AAA".to_string(),
            side: Side::Buy,
            quantity: qty,
            filled: Decimal::ZERO,
            avg_fill_price: None,
            status: OrderStatus::Pending,
            created_ts: 0,
            reduce_only: false,
        }
    }

    fn long_position() -> Position {
        Position {
            pair_key: "AAA/BBB".to_string(),
            direction: Direction::LongSpread,
            instrument_a: "AAA".to_string(),
            instrument_b: "BBB".to_string(),
            qty_a: dec!(10),
            qty_b: dec!(-20),
            entry_price_a: dec!(100),
            entry_price_b: dec!(50),
            entry_ts: 0,
            status: PositionStatus::Open,
        }
    }

    #[test]
    fn duplicate_fill_sequence_applies_once() {
        let mut state = PortfolioState::new(10_000.0);
        state.register_order(order("o1", dec!(10)));
        let fill = FillEvent {
            order_id: "o1".to_string(),
            seq: 1,
            quantity: dec!(4),
            price: dec!(100),
            ts: 1,
        };
        assert!(state.apply(&fill));
        assert!(!state.apply(&fill));
        let o = state.order("o1").unwrap();
        assert_eq!(o.filled, dec!(4));
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
    }

    #[test]
    fn fills_advance_order_to_filled_with_weighted_avg_price() {
        let mut state = PortfolioState::new(10_000.0);
        state.register_order(order("o1", dec!(10)));
        state.apply(&FillEvent {
            order_id: "o1".to_string(),
            seq: 1,
            quantity: dec!(6),
            price: dec!(100),
            ts: 1,
        });
        state.apply(&FillEvent {
            order_id: "o1".to_string(),
            seq: 2,
            quantity: dec!(4),
            price: dec!(110),
            ts: 2,
        });
        let o = state.order("o1").unwrap();
        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(o.filled, dec!(10));
        assert_eq!(o.avg_fill_price, Some(dec!(104)));
    }

    #[test]
    fn realized_pnl_on_close_matches_leg_arithmetic() {
        let mut state = PortfolioState::new(10_000.0);
        state.open_position(long_position());
        // long A 10 @100 exits at 103, short B 20 @50 exits at 49
        state.close_position("AAA/BBB", dec!(103), dec!(49));
        // 10*3 + (-20)*(-1) = 50
        assert_eq!(state.realized_pnl(), dec!(50));
        assert!(state.position("AAA/BBB").is_none());
    }

    #[test]
    fn partial_close_keeps_the_residual_on_the_book() {
        let mut state = PortfolioState::new(10_000.0);
        state.open_position(long_position());
        state.begin_close("AAA/BBB");

        // exit filled 5 of 10 on leg A at 103 and none of leg B
        let flat = state.apply_close("AAA/BBB", dec!(5), dec!(103), dec!(0), dec!(49));
        assert!(!flat);
        let pos = state.position("AAA/BBB").unwrap();
        assert_eq!(pos.qty_a, dec!(5));
        assert_eq!(pos.qty_b, dec!(-20));
        assert_eq!(pos.status, PositionStatus::Open);
        // only the offset 5 realized: 5*(103-100)
        assert_eq!(state.realized_pnl(), dec!(15));

        // the rest offsets later
        let flat = state.apply_close("AAA/BBB", dec!(5), dec!(103), dec!(20), dec!(49));
        assert!(flat);
        assert!(state.position("AAA/BBB").is_none());
        // full close totals the same 50 as a one-shot exit
        assert_eq!(state.realized_pnl(), dec!(50));
    }

    #[test]
    fn unfilled_entry_orders_count_toward_exposure() {
        let mut state = PortfolioState::new(10_000.0);
        state.mark_price("AAA", dec!(100));
        state.register_order(order("o1", dec!(10)));
        assert!((state.aggregate_exposure() - 1000.0).abs() < 1e-9);
        assert!((state.capital_in_use("AAA/BBB") - 1000.0).abs() < 1e-9);

        // partial fill shrinks the committed remainder
        state.apply(&FillEvent {
            order_id: "o1".to_string(),
            seq: 1,
            quantity: dec!(4),
            price: dec!(100),
            ts: 1,
        });
        assert!((state.aggregate_exposure() - 600.0).abs() < 1e-9);

        // exit legs reduce risk and never count
        let mut exit = order("o2", dec!(10));
        exit.reduce_only = true;
        state.register_order(exit);
        assert!((state.aggregate_exposure() - 600.0).abs() < 1e-9);

        state.mark_order_cancelled("o1");
        assert_eq!(state.aggregate_exposure(), 0.0);
    }

    #[test]
    fn exposure_and_drawdown_track_marks() {
        let mut state = PortfolioState::new(10_000.0);
        state.open_position(long_position());
        state.mark_price("AAA", dec!(100));
        state.mark_price("BBB", dec!(50));
        // 10*100 + 20*50 = 2000
        assert!((state.aggregate_exposure() - 2000.0).abs() < 1e-9);
        assert!(state.drawdown() < 1e-12);

        // adverse move on the long leg
        state.mark_price("AAA", dec!(90));
        assert!(state.equity() < 10_000.0);
        assert!(state.drawdown() > 0.0);
    }

    #[test]
    fn snapshot_round_trips_exactly() {
        let mut state = PortfolioState::new(10_000.0);
        state.open_position(long_position());
        let mut o = order("o1", dec!(5));
        o.filled = dec!(2);
        o.status = OrderStatus::PartiallyFilled;
        o.avg_fill_price = Some(dec!(101));
        state.register_order(o);
        state.register_order(Order {
            status: OrderStatus::Filled,
            ..order("o2", dec!(1))
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portfolio.json");
        state.save(&path).unwrap();

        let mut restored = PortfolioState::new(10_000.0);
        restored.load(&path).unwrap();
        // terminal orders are not part of the durable record
        assert!(restored.order("o2").is_none());
        assert_eq!(restored.snapshot(), state.snapshot());
        assert_eq!(
            restored.position("AAA/BBB").unwrap(),
            state.position("AAA/BBB").unwrap()
        );
    }
}
