//! Pre-trade risk checks and volatility-scaled sizing.
//!
//! `evaluate` runs the limit checks in a fixed order, short-circuiting on
//! the first failure, and sizes approved entries from the risk-per-trade
//! capital fraction scaled by spread volatility. Exits are risk reduction
//! and are never blocked.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::config::{RiskLimits, SizingMode};
use crate::market::Instrument;
use crate::portfolio::{Direction, PortfolioState, Position, Side};
use crate::signal::{Signal, SignalKind};
use crate::spread::SpreadStats;
use crate::universe::Pair;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VetoReason {
    #[error("max open positions reached ({open}/{max})")]
    MaxPositionsReached { open: usize, max: usize },
    #[error("pair capital {proposed:.2} would exceed per-pair limit {max:.2}")]
    PairCapitalExceeded { proposed: f64, max: f64 },
    #[error("aggregate exposure {proposed:.2} would exceed limit {max:.2}")]
    AggregateExposureExceeded { proposed: f64, max: f64 },
    #[error("drawdown {drawdown:.4} breaches halt threshold {max:.4}; entries disabled")]
    DrawdownHalt { drawdown: f64, max: f64 },
    #[error("sized quantity rounds to zero at lot size {lot}")]
    SizeTooSmall { lot: Decimal },
    #[error("spread volatility unavailable for sizing")]
    NoSpreadVolatility,
    #[error("pair is stale; no new entries")]
    PairStale,
    #[error("no open position to exit")]
    NothingToExit,
}

/// A sized, risk-approved signal ready for execution. The idempotency key
/// is derived from (pair, direction, decision timestamp) so a replayed
/// approval cannot double-open a position.
#[derive(Debug, Clone)]
pub struct ApprovedSignal {
    pub pair_key: String,
    pub instrument_a: String,
    pub instrument_b: String,
    pub direction: Direction,
    pub side_a: Side,
    pub side_b: Side,
    pub qty_a: Decimal,
    pub qty_b: Decimal,
    pub ref_price_a: Decimal,
    pub ref_price_b: Decimal,
    pub is_exit: bool,
    pub z_score: f64,
    pub decision_ts: i64,
    pub idempotency_key: String,
}

#[derive(Debug)]
pub enum RiskDecision {
    Approved(ApprovedSignal),
    Vetoed(VetoReason),
}

/// Truncate a quantity down to a multiple of the instrument lot size.
/// Unlike an exchange min-order bump there is no rounding up: a size that
/// truncates to zero stays zero and the caller must veto.
pub fn quantize_to_lot(qty: Decimal, lot: Decimal) -> Decimal {
    if lot <= Decimal::ZERO {
        return qty;
    }
    (qty / lot).trunc() * lot
}

pub struct RiskManager {
    limits: RiskLimits,
    risk_per_trade: f64,
    sizing_mode: SizingMode,
}

impl RiskManager {
    pub fn new(limits: RiskLimits, risk_per_trade: f64, sizing_mode: SizingMode) -> Self {
        Self {
            limits,
            risk_per_trade,
            sizing_mode,
        }
    }

    /// Evaluate a signal against the live portfolio. Must be called with
    /// exclusive access to `portfolio` so check-then-approve is a single
    /// critical section.
    pub fn evaluate(
        &self,
        signal: &Signal,
        pair: &Pair,
        spread: &SpreadStats,
        instrument_a: &Instrument,
        instrument_b: &Instrument,
        price_a: Decimal,
        price_b: Decimal,
        portfolio: &PortfolioState,
    ) -> RiskDecision {
        match signal.kind {
            SignalKind::Exit(_) => self.approve_exit(signal, portfolio),
            SignalKind::EnterLongSpread | SignalKind::EnterShortSpread => self.evaluate_entry(
                signal,
                pair,
                spread,
                instrument_a,
                instrument_b,
                price_a,
                price_b,
                portfolio,
            ),
            SignalKind::None => RiskDecision::Vetoed(VetoReason::NothingToExit),
        }
    }

    /// Exits offset existing legs exactly and skip every limit check:
    /// risk reduction is never blocked, drawdown halt included.
    fn approve_exit(&self, signal: &Signal, portfolio: &PortfolioState) -> RiskDecision {
        let Some(pos) = portfolio.position(&signal.pair_key) else {
            return RiskDecision::Vetoed(VetoReason::NothingToExit);
        };
        let mut approved = exit_for_position(pos, signal.ts);
        approved.z_score = signal.z_score;
        RiskDecision::Approved(approved)
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_entry(
        &self,
        signal: &Signal,
        pair: &Pair,
        spread: &SpreadStats,
        instrument_a: &Instrument,
        instrument_b: &Instrument,
        price_a: Decimal,
        price_b: Decimal,
        portfolio: &PortfolioState,
    ) -> RiskDecision {
        if pair.stale {
            return RiskDecision::Vetoed(VetoReason::PairStale);
        }

        let (qty_a, qty_b) = match self.size_entry(
            pair,
            spread,
            instrument_a,
            instrument_b,
            price_a,
            price_b,
            portfolio.equity(),
        ) {
            Ok(sizes) => sizes,
            Err(reason) => return RiskDecision::Vetoed(reason),
        };
        let proposed = (qty_a * price_a + qty_b * price_b).to_f64().unwrap_or(0.0);

        // ordered checks, first failure wins
        let open = portfolio.open_position_count();
        if open >= self.limits.max_open_positions {
            return RiskDecision::Vetoed(VetoReason::MaxPositionsReached {
                open,
                max: self.limits.max_open_positions,
            });
        }
        let pair_capital = portfolio.capital_in_use(&signal.pair_key) + proposed;
        if pair_capital > self.limits.max_capital_per_pair {
            return RiskDecision::Vetoed(VetoReason::PairCapitalExceeded {
                proposed: pair_capital,
                max: self.limits.max_capital_per_pair,
            });
        }
        let aggregate = portfolio.aggregate_exposure() + proposed;
        if aggregate > self.limits.max_aggregate_exposure {
            return RiskDecision::Vetoed(VetoReason::AggregateExposureExceeded {
                proposed: aggregate,
                max: self.limits.max_aggregate_exposure,
            });
        }
        let drawdown = portfolio.drawdown();
        if drawdown >= self.limits.max_drawdown {
            return RiskDecision::Vetoed(VetoReason::DrawdownHalt {
                drawdown,
                max: self.limits.max_drawdown,
            });
        }

        let (direction, side_a, side_b, tag) = match signal.kind {
            SignalKind::EnterLongSpread => (Direction::LongSpread, Side::Buy, Side::Sell, "LONG"),
            _ => (Direction::ShortSpread, Side::Sell, Side::Buy, "SHORT"),
        };
        log::info!(
            "[RISK] {} approved {} qty_a={} qty_b={} notional={:.2} z={:.2}",
            signal.pair_key,
            tag,
            qty_a,
            qty_b,
            proposed,
            signal.z_score
        );
        RiskDecision::Approved(ApprovedSignal {
            pair_key: signal.pair_key.clone(),
            instrument_a: instrument_a.id.clone(),
            instrument_b: instrument_b.id.clone(),
            direction,
            side_a,
            side_b,
            qty_a,
            qty_b,
            ref_price_a: price_a,
            ref_price_b: price_b,
            is_exit: false,
            z_score: signal.z_score,
            decision_ts: signal.ts,
            idempotency_key: idempotency_key(&signal.pair_key, tag, signal.ts),
        })
    }

    /// Volatility-scaled sizing: leg-A quantity is the risk budget divided
    /// by the spread's rolling standard deviation; leg B hedges it either
    /// beta-neutral or dollar-neutral.
    fn size_entry(
        &self,
        pair: &Pair,
        spread: &SpreadStats,
        instrument_a: &Instrument,
        instrument_b: &Instrument,
        price_a: Decimal,
        price_b: Decimal,
        equity: f64,
    ) -> Result<(Decimal, Decimal), VetoReason> {
        if spread.std <= f64::EPSILON {
            return Err(VetoReason::NoSpreadVolatility);
        }
        let budget = equity * self.risk_per_trade;
        let raw_a = budget / spread.std;
        let Some(raw_a) = Decimal::from_f64(raw_a) else {
            return Err(VetoReason::NoSpreadVolatility);
        };
        let qty_a = quantize_to_lot(raw_a, instrument_a.lot_size);
        if qty_a <= Decimal::ZERO {
            return Err(VetoReason::SizeTooSmall {
                lot: instrument_a.lot_size,
            });
        }
        let raw_b = match self.sizing_mode {
            SizingMode::BetaNeutral => {
                let beta = Decimal::from_f64(pair.beta.abs()).unwrap_or(Decimal::ONE);
                qty_a * beta
            }
            SizingMode::DollarNeutral => {
                if price_b <= Decimal::ZERO {
                    return Err(VetoReason::NoSpreadVolatility);
                }
                qty_a * price_a / price_b
            }
        };
        let qty_b = quantize_to_lot(raw_b, instrument_b.lot_size);
        if qty_b <= Decimal::ZERO {
            return Err(VetoReason::SizeTooSmall {
                lot: instrument_b.lot_size,
            });
        }
        Ok((qty_a, qty_b))
    }
}

/// Build the offsetting order pair for an open position. Leg sides and
/// quantities come from the position's actual signed holdings, never from
/// the sizes originally requested.
pub fn exit_for_position(pos: &Position, ts: i64) -> ApprovedSignal {
    let side_a = if pos.qty_a >= Decimal::ZERO {
        Side::Sell
    } else {
        Side::Buy
    };
    let side_b = if pos.qty_b >= Decimal::ZERO {
        Side::Sell
    } else {
        Side::Buy
    };
    ApprovedSignal {
        pair_key: pos.pair_key.clone(),
        instrument_a: pos.instrument_a.clone(),
        instrument_b: pos.instrument_b.clone(),
        direction: pos.direction,
        side_a,
        side_b,
        qty_a: pos.qty_a.abs(),
        qty_b: pos.qty_b.abs(),
        ref_price_a: pos.entry_price_a,
        ref_price_b: pos.entry_price_b,
        is_exit: true,
        z_score: 0.0,
        decision_ts: ts,
        idempotency_key: idempotency_key(&pos.pair_key, "EXIT", ts),
    }
}

fn idempotency_key(pair_key: &str, tag: &str, ts: i64) -> String {
    format!("{}:{}:{}", pair_key, tag, ts)
}
