//! Order execution for two-leg spread positions.
//!
//! Every approved signal becomes a linked pair of orders. The engine owns
//! the pending-order lifecycle: placement, fill tracking (through the
//! portfolio's order records), reconciliation on timeout, and reject
//! handling. Approved signals are deduplicated by idempotency key so a
//! crash-recovery replay cannot double-open a position.
//!
//! Broker round trips never run on the caller: `submit` writes the orders
//! to the book, hands each leg to a dispatch task and returns. Placement
//! outcomes come back as `ExecReport`s on the channel given at
//! construction, cancellations are dispatched the same way.

use rand::Rng;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::alert;
use crate::execution::broker::{BrokerConnector, BrokerError};
use crate::portfolio::{
    FillEvent, Order, OrderStatus, PortfolioState, Position, PositionStatus, Side,
};
use crate::risk::ApprovedSignal;

#[derive(Debug, Clone)]
struct PendingLeg {
    instrument: String,
    order_id: String,
    side: Side,
    target: Decimal,
    /// Broker acknowledged the placement.
    placed: bool,
}

#[derive(Debug)]
struct PendingOrders {
    pair_key: String,
    approved: ApprovedSignal,
    legs: Vec<PendingLeg>,
    placed_ts: i64,
}

/// State change worth reporting back to the decision loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    PositionOpened(String),
    PositionClosed(String),
    /// Entry did not result in a position (no fills, rejected, or timed
    /// out empty); the signal phase for the pair should be reset.
    EntryAborted(String),
    /// An exit left residual legs on the book; the reduced position stays
    /// open and will be exited again.
    ExitIncomplete(String),
}

/// Placement outcome from a dispatch task, routed back to the decision
/// loop through the report channel.
#[derive(Debug, Clone)]
pub enum ExecReport {
    LegPlaced {
        pair_key: String,
        order_id: String,
    },
    LegFailed {
        pair_key: String,
        order_id: String,
        detail: String,
    },
}

pub struct ExecutionEngine {
    broker: Arc<dyn BrokerConnector>,
    reports: mpsc::Sender<ExecReport>,
    reconcile_timeout_secs: i64,
    reject_max_retries: u32,
    idempotency_retention_secs: i64,
    pending: HashMap<String, PendingOrders>,
    recent_keys: HashMap<String, i64>,
}

impl ExecutionEngine {
    pub fn new(
        broker: Arc<dyn BrokerConnector>,
        reports: mpsc::Sender<ExecReport>,
        reconcile_timeout_secs: i64,
        reject_max_retries: u32,
        idempotency_retention_secs: i64,
    ) -> Self {
        Self {
            broker,
            reports,
            reconcile_timeout_secs,
            reject_max_retries,
            idempotency_retention_secs,
            pending: HashMap::new(),
            recent_keys: HashMap::new(),
        }
    }

    pub fn has_pending(&self, pair_key: &str) -> bool {
        self.pending.contains_key(pair_key)
    }

    /// Submit an approved signal as a linked order pair. The orders are on
    /// the book when this returns; the broker round trips happen on
    /// dispatch tasks and report back through the channel. Returns false
    /// when the submission was suppressed (duplicate key or pair already
    /// in flight).
    pub fn submit(
        &mut self,
        approved: ApprovedSignal,
        portfolio: &mut PortfolioState,
        now_ts: i64,
    ) -> bool {
        self.prune_keys(now_ts);
        if self.recent_keys.contains_key(&approved.idempotency_key) {
            log::info!(
                "[ORDER] duplicate signal suppressed key={}",
                approved.idempotency_key
            );
            return false;
        }
        if self.pending.contains_key(&approved.pair_key) {
            log::warn!(
                "[ORDER] {} already has in-flight orders; signal dropped",
                approved.pair_key
            );
            return false;
        }

        let leg_specs = [
            (
                approved.instrument_a.clone(),
                approved.side_a,
                approved.qty_a,
                approved.ref_price_a,
            ),
            (
                approved.instrument_b.clone(),
                approved.side_b,
                approved.qty_b,
                approved.ref_price_b,
            ),
        ];
        let mut legs: Vec<PendingLeg> = Vec::with_capacity(2);
        for (instrument, side, qty, ref_price) in leg_specs {
            if qty == Decimal::ZERO {
                continue;
            }
            let order_id = next_order_id();
            portfolio.register_order(Order {
                id: order_id.clone(),
                pair_key: approved.pair_key.clone(),
                instrument: instrument.clone(),
                side,
                quantity: qty,
                filled: Decimal::ZERO,
                avg_fill_price: None,
                status: OrderStatus::Pending,
                created_ts: now_ts,
                reduce_only: approved.is_exit,
            });
            self.dispatch_leg(
                approved.pair_key.clone(),
                order_id.clone(),
                instrument.clone(),
                side,
                qty,
                ref_price,
            );
            legs.push(PendingLeg {
                instrument,
                order_id,
                side,
                target: qty,
                placed: false,
            });
        }
        if legs.is_empty() {
            return false;
        }
        self.recent_keys
            .insert(approved.idempotency_key.clone(), now_ts);
        if approved.is_exit {
            portfolio.begin_close(&approved.pair_key);
        }
        log::info!(
            "[ORDER] {} submitted {} legs key={}",
            approved.pair_key,
            legs.len(),
            approved.idempotency_key
        );
        self.pending.insert(
            approved.pair_key.clone(),
            PendingOrders {
                pair_key: approved.pair_key.clone(),
                approved,
                legs,
                placed_ts: now_ts,
            },
        );
        true
    }

    /// Hand one leg to a dispatch task: place with retries, report back.
    fn dispatch_leg(
        &self,
        pair_key: String,
        order_id: String,
        instrument: String,
        side: Side,
        qty: Decimal,
        ref_price: Decimal,
    ) {
        let broker = Arc::clone(&self.broker);
        let reports = self.reports.clone();
        let max_retries = self.reject_max_retries;
        tokio::spawn(async move {
            let mut attempts = 0u32;
            let outcome = loop {
                match broker
                    .place_order(&order_id, &instrument, side, qty, Some(ref_price))
                    .await
                {
                    Ok(_ack) => {
                        break ExecReport::LegPlaced {
                            pair_key,
                            order_id: order_id.clone(),
                        };
                    }
                    Err(BrokerError::Rejected(reason)) if attempts < max_retries => {
                        attempts += 1;
                        log::warn!(
                            "[ORDER] {} {} rejected ({}); resubmit {}/{}",
                            instrument,
                            qty,
                            reason,
                            attempts,
                            max_retries
                        );
                    }
                    Err(err) => {
                        break ExecReport::LegFailed {
                            pair_key,
                            order_id: order_id.clone(),
                            detail: err.to_string(),
                        };
                    }
                }
            };
            if reports.send(outcome).await.is_err() {
                log::warn!("[ORDER] report channel closed; outcome for {} lost", order_id);
            }
        });
    }

    fn spawn_cancel(&self, order_id: String) {
        let broker = Arc::clone(&self.broker);
        tokio::spawn(async move {
            if let Err(err) = broker.cancel_order(&order_id).await {
                log::error!("[ORDER] cancel {} failed: {}", order_id, err);
            }
        });
    }

    /// Apply a placement outcome from a dispatch task.
    pub fn on_report(
        &mut self,
        report: ExecReport,
        portfolio: &mut PortfolioState,
    ) -> Option<ExecEvent> {
        match report {
            ExecReport::LegPlaced { pair_key, order_id } => {
                // locally dead orders (cancelled while the placement was in
                // flight) must be torn down at the broker too
                let dead = portfolio
                    .order(&order_id)
                    .map(|o| o.status.is_terminal())
                    .unwrap_or(true);
                if dead {
                    self.spawn_cancel(order_id);
                    return None;
                }
                if let Some(pending) = self.pending.get_mut(&pair_key) {
                    if let Some(leg) = pending.legs.iter_mut().find(|l| l.order_id == order_id) {
                        leg.placed = true;
                    }
                }
                None
            }
            ExecReport::LegFailed {
                pair_key,
                order_id,
                detail,
            } => {
                log::error!("[ORDER] {} leg {} placement failed: {}", pair_key, order_id, detail);
                alert::notify_execution(&pair_key, &format!("leg rejected: {}", detail));
                portfolio.mark_order_rejected(&order_id);
                let pending = self.pending.get(&pair_key)?;
                if !pending.approved.is_exit {
                    // a one-legged entry is not a spread; pull the sibling
                    let siblings: Vec<(String, bool)> = pending
                        .legs
                        .iter()
                        .filter(|l| l.order_id != order_id)
                        .map(|l| (l.order_id.clone(), l.placed))
                        .collect();
                    for (sibling_id, placed) in siblings {
                        let open = portfolio
                            .order(&sibling_id)
                            .map(|o| !o.status.is_terminal())
                            .unwrap_or(false);
                        if open {
                            portfolio.mark_order_cancelled(&sibling_id);
                            if placed {
                                self.spawn_cancel(sibling_id);
                            }
                        }
                    }
                }
                // exits keep whatever legs were accepted working
                self.try_complete(&pair_key, portfolio)
            }
        }
    }

    /// Route a broker fill through the portfolio and complete any pending
    /// order pair it finishes.
    pub fn on_fill(&mut self, fill: &FillEvent, portfolio: &mut PortfolioState) -> Option<ExecEvent> {
        if !portfolio.apply(fill) {
            return None;
        }
        let pair_key = portfolio.order(&fill.order_id)?.pair_key.clone();
        self.try_complete(&pair_key, portfolio)
    }

    /// Finalize the pending pair once every leg has reached a terminal
    /// order status.
    fn try_complete(
        &mut self,
        pair_key: &str,
        portfolio: &mut PortfolioState,
    ) -> Option<ExecEvent> {
        let complete = {
            let pending = self.pending.get(pair_key)?;
            pending.legs.iter().all(|leg| {
                portfolio
                    .order(&leg.order_id)
                    .map(|o| o.status.is_terminal())
                    .unwrap_or(true)
            })
        };
        if !complete {
            return None;
        }
        let pending = self.pending.remove(pair_key)?;
        Some(self.finalize(pending, portfolio))
    }

    fn finalize(&mut self, pending: PendingOrders, portfolio: &mut PortfolioState) -> ExecEvent {
        let filled: Vec<(PendingLeg, Decimal, Decimal)> = pending
            .legs
            .iter()
            .map(|leg| {
                let order = portfolio.order(&leg.order_id);
                let qty = order.map(|o| o.filled).unwrap_or(Decimal::ZERO);
                let px = order
                    .and_then(|o| o.avg_fill_price)
                    .unwrap_or(Decimal::ZERO);
                (leg.clone(), qty, px)
            })
            .collect();

        if pending.approved.is_exit {
            for (leg, qty, _) in &filled {
                if *qty < leg.target {
                    log::warn!(
                        "[ORDER] {} exit leg {} filled {}/{}; offsetting the fills only",
                        pending.pair_key,
                        leg.instrument,
                        qty,
                        leg.target
                    );
                }
            }
            let leg_fill = |instrument: &str, fallback: Decimal| {
                filled
                    .iter()
                    .find(|(l, _, _)| l.instrument == instrument)
                    .map(|(_, qty, px)| {
                        let px = if *qty > Decimal::ZERO { *px } else { fallback };
                        (*qty, px)
                    })
                    .unwrap_or((Decimal::ZERO, fallback))
            };
            let (off_a, px_a) =
                leg_fill(&pending.approved.instrument_a, pending.approved.ref_price_a);
            let (off_b, px_b) =
                leg_fill(&pending.approved.instrument_b, pending.approved.ref_price_b);
            if portfolio.apply_close(&pending.pair_key, off_a, px_a, off_b, px_b) {
                ExecEvent::PositionClosed(pending.pair_key)
            } else {
                alert::notify_execution(&pending.pair_key, "exit left residual legs");
                ExecEvent::ExitIncomplete(pending.pair_key)
            }
        } else {
            let mut qty_a = Decimal::ZERO;
            let mut qty_b = Decimal::ZERO;
            let mut px_a = pending.approved.ref_price_a;
            let mut px_b = pending.approved.ref_price_b;
            for (leg, qty, px) in &filled {
                let signed = match leg.side {
                    Side::Buy => *qty,
                    Side::Sell => -*qty,
                };
                if leg.instrument == pending.approved.instrument_a {
                    qty_a = signed;
                    if *qty > Decimal::ZERO {
                        px_a = *px;
                    }
                } else {
                    qty_b = signed;
                    if *qty > Decimal::ZERO {
                        px_b = *px;
                    }
                }
            }
            if qty_a == Decimal::ZERO && qty_b == Decimal::ZERO {
                log::warn!("[ORDER] {} entry yielded no fills", pending.pair_key);
                // free the key so the entry can be retried
                self.recent_keys.remove(&pending.approved.idempotency_key);
                return ExecEvent::EntryAborted(pending.pair_key);
            }
            portfolio.open_position(Position {
                pair_key: pending.pair_key.clone(),
                direction: pending.approved.direction,
                instrument_a: pending.approved.instrument_a.clone(),
                instrument_b: pending.approved.instrument_b.clone(),
                qty_a,
                qty_b,
                entry_price_a: px_a,
                entry_price_b: px_b,
                entry_ts: pending.placed_ts,
                status: PositionStatus::Open,
            });
            log::info!(
                "[ORDER] {} position opened qty_a={} qty_b={}",
                pending.pair_key,
                qty_a,
                qty_b
            );
            ExecEvent::PositionOpened(pending.pair_key)
        }
    }

    /// Periodic pass over in-flight order pairs. A pair whose legs are not
    /// fully filled within the reconciliation timeout has its remainders
    /// cancelled; the position is reconciled to the actually-filled
    /// quantities rather than the requested ones.
    pub fn reconcile(&mut self, now_ts: i64, portfolio: &mut PortfolioState) -> Vec<ExecEvent> {
        let expired: Vec<String> = self
            .pending
            .values()
            .filter(|p| now_ts.saturating_sub(p.placed_ts) >= self.reconcile_timeout_secs)
            .map(|p| p.pair_key.clone())
            .collect();
        let mut events = Vec::new();
        for pair_key in expired {
            let Some(pending) = self.pending.remove(&pair_key) else {
                continue;
            };
            log::warn!(
                "[ORDER] {} reconciliation timeout after {}s; cancelling remainders",
                pair_key,
                now_ts.saturating_sub(pending.placed_ts)
            );
            alert::notify_execution(&pair_key, "reconciliation timeout");
            for leg in &pending.legs {
                let open = portfolio
                    .order(&leg.order_id)
                    .map(|o| !o.status.is_terminal())
                    .unwrap_or(false);
                if open {
                    portfolio.mark_order_cancelled(&leg.order_id);
                    if leg.placed {
                        self.spawn_cancel(leg.order_id.clone());
                    }
                }
            }
            let event = self.finalize(pending, portfolio);
            // a partially opened entry is an unhedged stub: flatten it
            // immediately rather than carry a one-legged "spread"
            if let ExecEvent::PositionOpened(ref key) = event {
                let stub = portfolio
                    .position(key)
                    .map(|pos| pos.qty_a == Decimal::ZERO || pos.qty_b == Decimal::ZERO)
                    .unwrap_or(false);
                if stub {
                    log::warn!("[ORDER] {} entry left an unhedged leg; flattening", key);
                    let exit = portfolio
                        .position(key)
                        .map(|pos| crate::risk::exit_for_position(pos, now_ts));
                    if let Some(exit) = exit {
                        if !self.submit(exit, portfolio, now_ts) {
                            log::error!("[ORDER] flatten of {} was suppressed", key);
                        }
                    }
                }
            }
            events.push(event);
        }
        events
    }

    fn prune_keys(&mut self, now_ts: i64) {
        let retention = self.idempotency_retention_secs;
        self.recent_keys
            .retain(|_, seen| now_ts.saturating_sub(*seen) < retention);
    }
}

fn next_order_id() -> String {
    format!("ord-{:08x}", rand::thread_rng().gen::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::broker::OrderAck;
    use crate::portfolio::Direction;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct DummyBroker {
        placed: Mutex<Vec<(String, String, Side, Decimal)>>,
        cancelled: Mutex<Vec<String>>,
        reject_all: AtomicBool,
    }

    #[async_trait]
    impl BrokerConnector for DummyBroker {
        async fn place_order(
            &self,
            order_id: &str,
            instrument: &str,
            side: Side,
            quantity: Decimal,
            _limit_price: Option<Decimal>,
        ) -> Result<OrderAck, BrokerError> {
            if self.reject_all.load(Ordering::SeqCst) {
                return Err(BrokerError::Rejected("margin".to_string()));
            }
            self.placed.lock().unwrap().push((
                order_id.to_string(),
                instrument.to_string(),
                side,
                quantity,
            ));
            Ok(OrderAck { accepted_ts: 0 })
        }

        async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
            self.cancelled.lock().unwrap().push(order_id.to_string());
            Ok(())
        }
    }

    /// Broker whose placement round trip takes real (virtual) time.
    #[derive(Default)]
    struct SlowBroker {
        placed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BrokerConnector for SlowBroker {
        async fn place_order(
            &self,
            order_id: &str,
            _instrument: &str,
            _side: Side,
            _quantity: Decimal,
            _limit_price: Option<Decimal>,
        ) -> Result<OrderAck, BrokerError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.placed.lock().unwrap().push(order_id.to_string());
            Ok(OrderAck { accepted_ts: 0 })
        }

        async fn cancel_order(&self, _order_id: &str) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn approved_entry(ts: i64) -> ApprovedSignal {
        ApprovedSignal {
            pair_key: "AAA/BBB".to_string(),
            instrument_a: "AAA".to_string(),
            instrument_b: "BBB".to_string(),
            direction: Direction::LongSpread,
            side_a: Side::Buy,
            side_b: Side::Sell,
            qty_a: dec!(10),
            qty_b: dec!(20),
            ref_price_a: dec!(100),
            ref_price_b: dec!(50),
            is_exit: false,
            z_score: -2.5,
            decision_ts: ts,
            idempotency_key: format!("AAA/BBB:LONG:{}", ts),
        }
    }

    fn engine(broker: Arc<dyn BrokerConnector>) -> (ExecutionEngine, mpsc::Receiver<ExecReport>) {
        let (tx, rx) = mpsc::channel(64);
        (ExecutionEngine::new(broker, tx, 120, 1, 3600), rx)
    }

    /// Let the dispatch tasks run, then route their reports back in.
    async fn settle(
        exec: &mut ExecutionEngine,
        reports: &mut mpsc::Receiver<ExecReport>,
        pf: &mut PortfolioState,
    ) -> Vec<ExecEvent> {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        let mut events = Vec::new();
        while let Ok(report) = reports.try_recv() {
            if let Some(event) = exec.on_report(report, pf) {
                events.push(event);
            }
        }
        events
    }

    fn leg_id(broker: &DummyBroker, instrument: &str) -> String {
        broker
            .placed
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, inst, _, _)| inst == instrument)
            .map(|(id, _, _, _)| id.clone())
            .expect("no order placed for instrument")
    }

    fn fill(order_id: &str, seq: u64, qty: Decimal, price: Decimal) -> FillEvent {
        FillEvent {
            order_id: order_id.to_string(),
            seq,
            quantity: qty,
            price,
            ts: 1,
        }
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_opens_exactly_one_position() {
        let broker = Arc::new(DummyBroker::default());
        let (mut exec, mut reports) = engine(broker.clone());
        let mut pf = PortfolioState::new(10_000.0);

        assert!(exec.submit(approved_entry(1_000), &mut pf, 1_000));
        settle(&mut exec, &mut reports, &mut pf).await;
        // both legs fill
        let id_a = leg_id(&broker, "AAA");
        let id_b = leg_id(&broker, "BBB");
        assert!(exec.on_fill(&fill(&id_a, 1, dec!(10), dec!(100)), &mut pf).is_none());
        let event = exec.on_fill(&fill(&id_b, 2, dec!(20), dec!(50)), &mut pf);
        assert_eq!(event, Some(ExecEvent::PositionOpened("AAA/BBB".to_string())));
        assert_eq!(pf.open_position_count(), 1);

        // crash-recovery replay of the same approval
        assert!(!exec.submit(approved_entry(1_000), &mut pf, 1_005));
        settle(&mut exec, &mut reports, &mut pf).await;
        assert_eq!(broker.placed.lock().unwrap().len(), 2);
        assert_eq!(pf.open_position_count(), 1);
    }

    #[tokio::test]
    async fn entry_fills_produce_signed_position_with_fill_prices() {
        let broker = Arc::new(DummyBroker::default());
        let (mut exec, mut reports) = engine(broker.clone());
        let mut pf = PortfolioState::new(10_000.0);
        exec.submit(approved_entry(1_000), &mut pf, 1_000);
        settle(&mut exec, &mut reports, &mut pf).await;

        exec.on_fill(&fill(&leg_id(&broker, "AAA"), 1, dec!(10), dec!(101)), &mut pf);
        exec.on_fill(&fill(&leg_id(&broker, "BBB"), 2, dec!(20), dec!(49)), &mut pf);

        let pos = pf.position("AAA/BBB").unwrap();
        assert_eq!(pos.qty_a, dec!(10));
        assert_eq!(pos.qty_b, dec!(-20));
        assert_eq!(pos.entry_price_a, dec!(101));
        assert_eq!(pos.entry_price_b, dec!(49));
        assert_eq!(pos.status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn submission_does_not_wait_for_broker_latency() {
        tokio::time::pause();
        let broker = Arc::new(SlowBroker::default());
        let (mut exec, _reports) = engine(broker.clone());
        let mut pf = PortfolioState::new(10_000.0);

        assert!(exec.submit(approved_entry(1_000), &mut pf, 1_000));
        // the book already carries both orders while no broker round trip
        // has completed
        assert_eq!(pf.snapshot().orders.len(), 2);
        assert!(broker.placed.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(broker.placed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn timeout_with_no_fills_cancels_and_aborts_entry() {
        let broker = Arc::new(DummyBroker::default());
        let (mut exec, mut reports) = engine(broker.clone());
        let mut pf = PortfolioState::new(10_000.0);
        exec.submit(approved_entry(1_000), &mut pf, 1_000);
        settle(&mut exec, &mut reports, &mut pf).await;

        let events = exec.reconcile(1_000 + 120, &mut pf);
        assert_eq!(events, vec![ExecEvent::EntryAborted("AAA/BBB".to_string())]);
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(broker.cancelled.lock().unwrap().len(), 2);
        assert_eq!(pf.open_position_count(), 0);
        assert!(!exec.has_pending("AAA/BBB"));
        // the aborted key is free for a retry
        assert!(exec.submit(approved_entry(1_000), &mut pf, 1_130));
    }

    #[tokio::test]
    async fn timeout_with_one_filled_leg_flattens_the_stub() {
        let broker = Arc::new(DummyBroker::default());
        let (mut exec, mut reports) = engine(broker.clone());
        let mut pf = PortfolioState::new(10_000.0);
        exec.submit(approved_entry(1_000), &mut pf, 1_000);
        settle(&mut exec, &mut reports, &mut pf).await;

        // only leg A fills before the timeout
        exec.on_fill(&fill(&leg_id(&broker, "AAA"), 1, dec!(10), dec!(100)), &mut pf);
        let events = exec.reconcile(1_000 + 120, &mut pf);
        assert_eq!(events, vec![ExecEvent::PositionOpened("AAA/BBB".to_string())]);
        settle(&mut exec, &mut reports, &mut pf).await;

        // the stub position got an immediate offsetting exit
        assert!(exec.has_pending("AAA/BBB"));
        let placed = broker.placed.lock().unwrap();
        let last = placed.last().unwrap();
        assert_eq!(last.1, "AAA");
        assert_eq!(last.2, Side::Sell);
        assert_eq!(last.3, dec!(10));
    }

    #[tokio::test]
    async fn exit_offsets_actual_leg_quantities() {
        let broker = Arc::new(DummyBroker::default());
        let (mut exec, mut reports) = engine(broker.clone());
        let mut pf = PortfolioState::new(10_000.0);
        exec.submit(approved_entry(1_000), &mut pf, 1_000);
        settle(&mut exec, &mut reports, &mut pf).await;
        exec.on_fill(&fill(&leg_id(&broker, "AAA"), 1, dec!(10), dec!(100)), &mut pf);
        exec.on_fill(&fill(&leg_id(&broker, "BBB"), 2, dec!(20), dec!(50)), &mut pf);

        let pos = pf.position("AAA/BBB").unwrap().clone();
        let exit = crate::risk::exit_for_position(&pos, 2_000);
        assert!(exec.submit(exit, &mut pf, 2_000));
        settle(&mut exec, &mut reports, &mut pf).await;
        assert_eq!(
            pf.position("AAA/BBB").unwrap().status,
            PositionStatus::Closing
        );

        exec.on_fill(&fill(&leg_id(&broker, "AAA"), 3, dec!(10), dec!(103)), &mut pf);
        let event = exec.on_fill(&fill(&leg_id(&broker, "BBB"), 4, dec!(20), dec!(49)), &mut pf);
        assert_eq!(event, Some(ExecEvent::PositionClosed("AAA/BBB".to_string())));
        assert!(pf.position("AAA/BBB").is_none());
        // 10*(103-100) + (-20)*(49-50) = 50
        assert_eq!(pf.realized_pnl(), dec!(50));
    }

    #[tokio::test]
    async fn timed_out_exit_keeps_unfilled_residual_on_the_book() {
        let broker = Arc::new(DummyBroker::default());
        let (mut exec, mut reports) = engine(broker.clone());
        let mut pf = PortfolioState::new(10_000.0);
        exec.submit(approved_entry(1_000), &mut pf, 1_000);
        settle(&mut exec, &mut reports, &mut pf).await;
        exec.on_fill(&fill(&leg_id(&broker, "AAA"), 1, dec!(10), dec!(100)), &mut pf);
        exec.on_fill(&fill(&leg_id(&broker, "BBB"), 2, dec!(20), dec!(50)), &mut pf);

        let pos = pf.position("AAA/BBB").unwrap().clone();
        let exit = crate::risk::exit_for_position(&pos, 2_000);
        assert!(exec.submit(exit, &mut pf, 2_000));
        settle(&mut exec, &mut reports, &mut pf).await;

        // exit leg A fills 5 of 10, leg B never fills; the timeout must not
        // wipe the 5 AAA + 20 BBB still held at the broker off the book
        exec.on_fill(&fill(&leg_id(&broker, "AAA"), 3, dec!(5), dec!(103)), &mut pf);
        let events = exec.reconcile(2_000 + 120, &mut pf);
        assert_eq!(
            events,
            vec![ExecEvent::ExitIncomplete("AAA/BBB".to_string())]
        );
        let pos = pf.position("AAA/BBB").unwrap();
        assert_eq!(pos.qty_a, dec!(5));
        assert_eq!(pos.qty_b, dec!(-20));
        assert_eq!(pos.status, PositionStatus::Open);
        assert_eq!(pf.open_position_count(), 1);
        // only the offset 5 realized: 5*(103-100)
        assert_eq!(pf.realized_pnl(), dec!(15));
    }

    #[tokio::test]
    async fn rejected_entry_leaves_no_position_and_no_key_burn() {
        let broker = Arc::new(DummyBroker::default());
        broker.reject_all.store(true, Ordering::SeqCst);
        let (mut exec, mut reports) = engine(broker.clone());
        let mut pf = PortfolioState::new(10_000.0);

        assert!(exec.submit(approved_entry(1_000), &mut pf, 1_000));
        let events = settle(&mut exec, &mut reports, &mut pf).await;
        assert_eq!(events, vec![ExecEvent::EntryAborted("AAA/BBB".to_string())]);
        assert_eq!(pf.open_position_count(), 0);
        assert!(!exec.has_pending("AAA/BBB"));

        // the same approval goes through once the broker recovers
        broker.reject_all.store(false, Ordering::SeqCst);
        assert!(exec.submit(approved_entry(1_000), &mut pf, 1_001));
        settle(&mut exec, &mut reports, &mut pf).await;
        assert_eq!(broker.placed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_fill_events_do_not_double_apply() {
        let broker = Arc::new(DummyBroker::default());
        let (mut exec, mut reports) = engine(broker.clone());
        let mut pf = PortfolioState::new(10_000.0);
        exec.submit(approved_entry(1_000), &mut pf, 1_000);
        settle(&mut exec, &mut reports, &mut pf).await;

        let id_a = leg_id(&broker, "AAA");
        exec.on_fill(&fill(&id_a, 1, dec!(10), dec!(100)), &mut pf);
        // at-least-once delivery: the same fill arrives again
        assert!(exec.on_fill(&fill(&id_a, 1, dec!(10), dec!(100)), &mut pf).is_none());
        assert_eq!(pf.order(&id_a).unwrap().filled, dec!(10));
    }
}
