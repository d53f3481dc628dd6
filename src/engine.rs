//! Decision loop tying the stat-arb stages together.
//!
//! A single task owns every mutable stage: the price store, the per-pair
//! spread models, the signal state machines, the portfolio and the
//! execution engine. Ticks, fills, placement reports and timers are
//! multiplexed into that task through channels, so an approve-then-submit
//! sequence is one critical section and two pairs can never race each
//! other into the same capital. Nothing here awaits a broker or a
//! cointegration scan: placements run on dispatch tasks and universe
//! refreshes on the blocking pool, both reporting back through channels.

use anyhow::{anyhow, Result};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::alert;
use crate::config::StatArbConfig;
use crate::execution::broker::BrokerConnector;
use crate::execution::engine::{ExecEvent, ExecReport, ExecutionEngine};
use crate::market::{Instrument, MarketTick, PriceSeriesStore};
use crate::portfolio::{FillEvent, PortfolioState, PositionStatus};
use crate::risk::{self, RiskDecision, RiskManager};
use crate::signal::SignalGenerator;
use crate::spread::SpreadModel;
use crate::universe::{PairUniverseBuilder, UniverseHandle};

pub struct StatArbEngine {
    cfg: StatArbConfig,
    instruments: HashMap<String, Instrument>,
    store: PriceSeriesStore,
    spreads: HashMap<String, SpreadModel>,
    signals: SignalGenerator,
    risk: RiskManager,
    exec: ExecutionEngine,
    /// Placement outcomes from the dispatch tasks; `run` takes this out.
    exec_reports: Option<mpsc::Receiver<ExecReport>>,
    portfolio: PortfolioState,
    universe: UniverseHandle,
    builder: PairUniverseBuilder,
    /// Highest tick timestamp seen. Periodic jobs run on this data clock so
    /// replayed history and live feeds age orders the same way.
    clock_ts: i64,
}

impl StatArbEngine {
    pub fn new(cfg: StatArbConfig, broker: Arc<dyn BrokerConnector>) -> Self {
        let mut portfolio = PortfolioState::new(cfg.equity_usd);
        if let Some(path) = &cfg.snapshot_file {
            match portfolio.load(path) {
                Ok(()) => log::info!("[ENGINE] portfolio restored from {}", path),
                Err(err) => log::warn!(
                    "[ENGINE] no portfolio snapshot restored from {}: {}",
                    path,
                    err
                ),
            }
        }
        let instruments = cfg
            .instruments
            .iter()
            .map(|i| (i.id.clone(), i.clone()))
            .collect();
        let (report_tx, report_rx) = mpsc::channel(256);
        Self {
            store: PriceSeriesStore::new(cfg.lookback_window),
            spreads: HashMap::new(),
            signals: SignalGenerator::new(cfg.thresholds(), cfg.cooldown_secs),
            risk: RiskManager::new(cfg.limits, cfg.risk_per_trade, cfg.sizing_mode),
            exec: ExecutionEngine::new(
                broker,
                report_tx,
                cfg.reconcile_timeout_secs,
                cfg.reject_max_retries,
                cfg.idempotency_retention_secs,
            ),
            exec_reports: Some(report_rx),
            portfolio,
            universe: UniverseHandle::new(),
            builder: PairUniverseBuilder::from_config(&cfg),
            instruments,
            clock_ts: 0,
            cfg,
        }
    }

    fn now_ts(&self) -> i64 {
        if self.clock_ts > 0 {
            self.clock_ts
        } else {
            Utc::now().timestamp()
        }
    }

    pub fn universe_handle(&self) -> UniverseHandle {
        self.universe.clone()
    }

    pub fn portfolio(&self) -> &PortfolioState {
        &self.portfolio
    }

    /// Ingest one tick and run the decision pipeline for every tradeable
    /// pair the instrument is a leg of. Purely synchronous: submissions
    /// only write the book and spawn dispatch tasks.
    pub fn on_tick(&mut self, tick: MarketTick) {
        let Some(price) = tick.price.to_f64() else {
            log::warn!("[ENGINE] {} unrepresentable price dropped", tick.instrument);
            return;
        };
        if let Err(err) = self.store.ingest(&tick.instrument, tick.ts, price) {
            log::warn!("[ENGINE] {}", err);
            alert::notify_drop(&tick.instrument, &err.to_string());
            return;
        }
        self.portfolio.mark_price(&tick.instrument, tick.price);
        self.clock_ts = self.clock_ts.max(tick.ts);

        let universe = self.universe.current();
        for pair in universe.pairs() {
            if pair.base != tick.instrument && pair.quote != tick.instrument {
                continue;
            }
            let key = pair.key();
            let (Some(last_a), Some(last_b)) =
                (self.store.last(&pair.base), self.store.last(&pair.quote))
            else {
                continue;
            };

            if self.force_close_due(&key, tick.ts) {
                self.force_close(&key, tick.ts);
                continue;
            }

            let model = self
                .spreads
                .entry(key.clone())
                .or_insert_with(|| SpreadModel::new(self.cfg.spread_window, self.cfg.min_window));
            let Some(z) = model.update(pair.beta, last_a.price, last_b.price) else {
                continue;
            };
            let stats = model.stats();

            let signal = self.signals.on_z_score(&key, z, tick.ts);
            if matches!(signal.kind, crate::signal::SignalKind::None) {
                continue;
            }
            if signal.kind.is_entry()
                && (self.portfolio.position(&key).is_some() || self.exec.has_pending(&key))
            {
                // phase machine re-aligning with an already-open or
                // in-flight position, nothing to submit
                log::debug!("[ENGINE] {} entry suppressed, position in flight", key);
                continue;
            }

            let (Some(inst_a), Some(inst_b)) = (
                self.instruments.get(&pair.base),
                self.instruments.get(&pair.quote),
            ) else {
                continue;
            };
            let price_a = rust_decimal::Decimal::from_f64_retain(last_a.price)
                .unwrap_or(rust_decimal::Decimal::ZERO);
            let price_b = rust_decimal::Decimal::from_f64_retain(last_b.price)
                .unwrap_or(rust_decimal::Decimal::ZERO);
            let decision = self.risk.evaluate(
                &signal,
                pair,
                &stats,
                inst_a,
                inst_b,
                price_a,
                price_b,
                &self.portfolio,
            );
            match decision {
                RiskDecision::Approved(approved) => {
                    let was_entry = !approved.is_exit;
                    if !self.exec.submit(approved, &mut self.portfolio, tick.ts) && was_entry {
                        // suppressed entry, do not leave the phase machine
                        // waiting on a position that will never exist
                        self.signals.reset(&key);
                    }
                }
                RiskDecision::Vetoed(reason) => {
                    log::info!("[RISK] {} vetoed: {}", key, reason);
                    alert::notify_veto(&key, &reason.to_string());
                    // an unfunded entry must not leave the phase machine
                    // believing a position exists
                    self.signals.reset(&key);
                }
            }
        }
    }

    pub fn on_fill_event(&mut self, fill: FillEvent) {
        if let Some(event) = self.exec.on_fill(&fill, &mut self.portfolio) {
            self.handle_exec_event(event);
        }
    }

    pub fn on_exec_report(&mut self, report: ExecReport) {
        if let Some(event) = self.exec.on_report(report, &mut self.portfolio) {
            self.handle_exec_event(event);
        }
    }

    fn handle_exec_event(&mut self, event: ExecEvent) {
        match event {
            ExecEvent::PositionOpened(key) => {
                log::info!("[ENGINE] {} open, equity={:.2}", key, self.portfolio.equity());
            }
            ExecEvent::PositionClosed(key) => {
                log::info!(
                    "[ENGINE] {} closed, realized_pnl={}",
                    key,
                    self.portfolio.realized_pnl()
                );
            }
            ExecEvent::EntryAborted(key) => {
                self.signals.reset(&key);
            }
            ExecEvent::ExitIncomplete(key) => {
                // the residual position is back on the book as Open; the
                // signal path or the time stop will exit it again
                log::warn!("[ENGINE] {} exit incomplete, residual legs remain", key);
                self.signals.reset(&key);
            }
        }
    }

    fn force_close_due(&self, key: &str, now_ts: i64) -> bool {
        if self.cfg.force_close_secs <= 0 || self.exec.has_pending(key) {
            return false;
        }
        self.portfolio
            .position(key)
            .map(|pos| {
                pos.status == PositionStatus::Open
                    && now_ts.saturating_sub(pos.entry_ts) >= self.cfg.force_close_secs
            })
            .unwrap_or(false)
    }

    fn force_close(&mut self, key: &str, now_ts: i64) {
        let Some(pos) = self.portfolio.position(key) else {
            return;
        };
        log::warn!(
            "[ENGINE] {} held {}s, force-closing",
            key,
            now_ts.saturating_sub(pos.entry_ts)
        );
        let exit = risk::exit_for_position(pos, now_ts);
        self.signals.reset(key);
        if !self.exec.submit(exit, &mut self.portfolio, now_ts) {
            log::error!("[ENGINE] {} force-close was suppressed", key);
        }
    }

    /// Re-test every candidate pair inline and publish the result. Used at
    /// startup and in tests; the run loop goes through
    /// `spawn_universe_refresh` instead so the quadratic scan never sits on
    /// the decision task.
    pub fn refresh_universe(&mut self, now_ts: i64) {
        let previous = self.universe.current();
        let open = self.portfolio.open_pair_keys();
        let next = self.builder.refresh(
            &self.cfg.instruments,
            &self.store,
            &previous,
            &open,
            now_ts,
        );
        self.universe.publish(next);
        self.prune_departed_pairs();
    }

    /// Run the pair scan on the blocking pool against cloned series data
    /// and atomically publish when done. Readers, including this engine,
    /// keep the previous universe until the swap.
    fn spawn_universe_refresh(&self, now_ts: i64) {
        let builder = self.builder.clone();
        let instruments = self.cfg.instruments.clone();
        let store = self.store.clone();
        let previous = self.universe.current();
        let open = self.portfolio.open_pair_keys();
        let handle = self.universe.clone();
        tokio::spawn(async move {
            let scanned = tokio::task::spawn_blocking(move || {
                builder.refresh(&instruments, &store, &previous, &open, now_ts)
            })
            .await;
            match scanned {
                Ok(next) => handle.publish(next),
                Err(err) => log::error!("[ENGINE] universe refresh task failed: {}", err),
            }
        });
    }

    /// Drop per-pair state for pairs no longer in the published universe.
    fn prune_departed_pairs(&mut self) {
        let universe = self.universe.current();
        let keys: Vec<String> = self.spreads.keys().cloned().collect();
        for key in keys {
            if universe.get(&key).is_none() {
                self.spreads.remove(&key);
                self.signals.untrack(&key);
            }
        }
    }

    pub fn reconcile(&mut self, now_ts: i64) {
        let events = self.exec.reconcile(now_ts, &mut self.portfolio);
        for event in events {
            self.handle_exec_event(event);
        }
    }

    /// Apply any placement reports already sitting in the channel.
    fn drain_exec_reports(&mut self) {
        let Some(rx) = self.exec_reports.as_mut() else {
            return;
        };
        let mut reports = Vec::new();
        while let Ok(report) = rx.try_recv() {
            reports.push(report);
        }
        for report in reports {
            self.on_exec_report(report);
        }
    }

    /// Cancel anything still in flight and persist the portfolio.
    pub fn shutdown_flush(&mut self) {
        self.drain_exec_reports();
        let now = self.now_ts();
        self.reconcile(now + self.cfg.reconcile_timeout_secs);
        if let Some(path) = self.cfg.snapshot_file.clone() {
            if let Err(err) = self.portfolio.save(&path) {
                log::error!("[ENGINE] snapshot save to {} failed: {}", path, err);
            } else {
                log::info!("[ENGINE] portfolio snapshot saved to {}", path);
            }
        }
        log::info!(
            "[ENGINE] shutdown: realized_pnl={} equity={:.2}",
            self.portfolio.realized_pnl(),
            self.portfolio.equity()
        );
    }

    /// Main loop: multiplex ticks, fills, placement reports and the
    /// periodic jobs until the tick channel closes.
    pub async fn run(
        mut self,
        mut ticks: mpsc::Receiver<MarketTick>,
        mut fills: mpsc::Receiver<FillEvent>,
    ) -> Result<()> {
        let mut reports = self
            .exec_reports
            .take()
            .ok_or_else(|| anyhow!("engine is already running"))?;
        let mut refresh = tokio::time::interval(Duration::from_secs(self.cfg.refresh_interval_secs));
        let reconcile_every = (self.cfg.reconcile_timeout_secs as u64 / 4).max(1);
        let mut reconcile = tokio::time::interval(Duration::from_secs(reconcile_every));
        // the first interval fire is immediate; an empty store has nothing
        // to test so skip it
        refresh.tick().await;
        reconcile.tick().await;

        log::info!(
            "[ENGINE] started: {} instruments, refresh every {}s",
            self.cfg.instruments.len(),
            self.cfg.refresh_interval_secs
        );
        loop {
            tokio::select! {
                tick = ticks.recv() => {
                    match tick {
                        Some(tick) => self.on_tick(tick),
                        None => break,
                    }
                }
                Some(fill) = fills.recv() => {
                    self.on_fill_event(fill);
                }
                Some(report) = reports.recv() => {
                    self.on_exec_report(report);
                }
                _ = refresh.tick() => {
                    // fold in the last published scan, then kick off the
                    // next one off-task
                    self.prune_departed_pairs();
                    self.spawn_universe_refresh(self.now_ts());
                }
                _ = reconcile.tick() => {
                    let now = self.now_ts();
                    self.reconcile(now);
                }
            }
        }
        log::info!("[ENGINE] tick stream ended, flushing");
        while let Ok(report) = reports.try_recv() {
            self.on_exec_report(report);
        }
        self.shutdown_flush();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatArbConfig;
    use crate::ports::paper_broker::PaperBroker;
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;

    fn test_config() -> StatArbConfig {
        let mut cfg = StatArbConfig::default_config();
        cfg.instruments = vec![
            Instrument::new("AAA", Decimal::new(1, 2), Decimal::new(1, 3)),
            Instrument::new("BBB", Decimal::new(1, 2), Decimal::new(1, 3)),
        ];
        cfg.lookback_window = 400;
        cfg.coint_min_samples = 60;
        cfg.spread_window = 120;
        cfg.min_window = 20;
        // the synthetic spread is a sine: its z-score tops out near 1.4
        cfg.entry_z = 1.2;
        cfg.exit_z = 0.3;
        cfg.stop_loss_z = 3.0;
        cfg.cooldown_secs = 0;
        cfg.limits.max_open_positions = 1;
        cfg.limits.max_capital_per_pair = f64::MAX;
        cfg.limits.max_aggregate_exposure = f64::MAX;
        cfg
    }

    // cointegrated pair: B drifts slowly, A tracks 2*B plus a fast
    // mean-reverting oscillation that the spread model should trade
    fn price_b(t: i64) -> f64 {
        50.0 + 2.5 * (t as f64 / 40.0).sin()
    }

    fn price_a(t: i64) -> f64 {
        2.0 * price_b(t) - 30.0 + 3.0 * (t as f64 / 2.0).sin()
    }

    /// Feed one bar, let the dispatch tasks run, and route their reports
    /// and fills back into the engine.
    async fn feed(
        engine: &mut StatArbEngine,
        broker: &PaperBroker,
        fills: &mut mpsc::Receiver<FillEvent>,
        t: i64,
    ) {
        let pa = Decimal::from_f64(price_a(t)).unwrap();
        let pb = Decimal::from_f64(price_b(t)).unwrap();
        broker.set_clock(t);
        broker.mark("AAA", pa);
        broker.mark("BBB", pb);
        engine.on_tick(MarketTick {
            instrument: "AAA".to_string(),
            ts: t,
            price: pa,
            volume: None,
        });
        engine.on_tick(MarketTick {
            instrument: "BBB".to_string(),
            ts: t,
            price: pb,
            volume: None,
        });
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        engine.drain_exec_reports();
        while let Ok(fill) = fills.try_recv() {
            engine.on_fill_event(fill);
        }
        engine.drain_exec_reports();
    }

    #[tokio::test]
    async fn cointegrated_pair_is_detected_and_traded_round_trip() {
        let (fill_tx, mut fill_rx) = mpsc::channel(256);
        let broker = Arc::new(PaperBroker::new(fill_tx));
        let mut engine = StatArbEngine::new(test_config(), broker.clone());

        // warm up price history, then form the universe
        for t in 0..300 {
            feed(&mut engine, &broker, &mut fill_rx, t).await;
        }
        engine.refresh_universe(300);
        let universe = engine.universe_handle().current();
        assert_eq!(universe.len(), 1);
        let pair = universe.get("AAA/BBB").unwrap();
        assert!((pair.beta - 2.0).abs() < 0.2, "beta={}", pair.beta);
        assert!(pair.p_value < 0.05, "p={}", pair.p_value);

        // trade through several oscillation cycles
        let mut opened = 0usize;
        let mut was_open = false;
        for t in 300..700 {
            feed(&mut engine, &broker, &mut fill_rx, t).await;
            let open_now = engine.portfolio().open_position_count() > 0;
            if open_now && !was_open {
                opened += 1;
            }
            assert!(engine.portfolio().open_position_count() <= 1);
            was_open = open_now;
        }

        assert!(opened >= 2, "expected repeated round trips, got {}", opened);
        // every entry was eventually flattened inside the run or is the
        // single position still riding the current excursion
        assert!(engine.portfolio().open_position_count() <= 1);
    }

    #[tokio::test]
    async fn vetoed_entry_resets_the_phase_machine() {
        let mut cfg = test_config();
        // no capital: every entry is vetoed
        cfg.limits.max_aggregate_exposure = 0.000_001;
        let (fill_tx, mut fill_rx) = mpsc::channel(256);
        let broker = Arc::new(PaperBroker::new(fill_tx));
        let mut engine = StatArbEngine::new(cfg, broker.clone());

        for t in 0..300 {
            feed(&mut engine, &broker, &mut fill_rx, t).await;
        }
        engine.refresh_universe(300);
        for t in 300..500 {
            feed(&mut engine, &broker, &mut fill_rx, t).await;
            assert_eq!(engine.portfolio().open_position_count(), 0);
            // phase machine never sticks in an entered state without a
            // position behind it
            assert_eq!(
                engine.signals.phase("AAA/BBB"),
                crate::signal::SpreadPhase::Flat
            );
        }
    }

    #[tokio::test]
    async fn force_close_flattens_an_aged_position() {
        let mut cfg = test_config();
        cfg.force_close_secs = 10;
        let (fill_tx, mut fill_rx) = mpsc::channel(256);
        let broker = Arc::new(PaperBroker::new(fill_tx));
        let mut engine = StatArbEngine::new(cfg, broker.clone());

        for t in 0..300 {
            feed(&mut engine, &broker, &mut fill_rx, t).await;
        }
        engine.refresh_universe(300);

        // run until an entry fills
        let mut entry_ts = None;
        let mut t = 300i64;
        while entry_ts.is_none() && t < 600 {
            feed(&mut engine, &broker, &mut fill_rx, t).await;
            entry_ts = engine.portfolio().open_positions().next().map(|p| p.entry_ts);
            t += 1;
        }
        let entry_ts = entry_ts.expect("no position was ever opened");

        // freeze prices at the entry level: the z-score stays out in the
        // no-man's-land between the exit and entry bands, so only the time
        // stop can flatten the position
        let frozen = t - 1;
        let pa = Decimal::from_f64(price_a(frozen)).unwrap();
        let pb = Decimal::from_f64(price_b(frozen)).unwrap();
        let mut closed_at = None;
        for ts in t..t + 30 {
            broker.set_clock(ts);
            engine.on_tick(MarketTick {
                instrument: "AAA".to_string(),
                ts,
                price: pa,
                volume: None,
            });
            engine.on_tick(MarketTick {
                instrument: "BBB".to_string(),
                ts,
                price: pb,
                volume: None,
            });
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
            engine.drain_exec_reports();
            while let Ok(fill) = fill_rx.try_recv() {
                engine.on_fill_event(fill);
            }
            engine.drain_exec_reports();
            if closed_at.is_none() && engine.portfolio().open_position_count() == 0 {
                closed_at = Some(ts);
            }
        }
        let closed_at = closed_at.expect("position was never force-closed");
        let held = closed_at - entry_ts;
        assert!(held >= 10, "closed after only {}s", held);
        assert!(held <= 11, "position held {}s past the time stop", held);
    }

    #[tokio::test]
    async fn universe_refresh_runs_off_the_decision_task() {
        let (fill_tx, mut fill_rx) = mpsc::channel(256);
        let broker = Arc::new(PaperBroker::new(fill_tx));
        let mut engine = StatArbEngine::new(test_config(), broker.clone());
        for t in 0..300 {
            feed(&mut engine, &broker, &mut fill_rx, t).await;
        }

        engine.spawn_universe_refresh(300);
        // the scan completes on the blocking pool and the result lands in
        // the shared handle without the engine touching it again
        let handle = engine.universe_handle();
        let mut published = false;
        for _ in 0..200 {
            if handle.current().len() == 1 {
                published = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(published, "refresh result was never published");
        assert!(handle.current().get("AAA/BBB").is_some());
    }

    #[tokio::test]
    async fn stale_tick_is_dropped_without_state_change() {
        let (fill_tx, _fill_rx) = mpsc::channel(16);
        let broker = Arc::new(PaperBroker::new(fill_tx));
        let mut engine = StatArbEngine::new(test_config(), broker);

        let tick = |ts: i64, price: i64| MarketTick {
            instrument: "AAA".to_string(),
            ts,
            price: Decimal::from(price),
            volume: None,
        };
        engine.on_tick(tick(100, 70));
        engine.on_tick(tick(100, 71)); // duplicate timestamp
        engine.on_tick(tick(90, 72)); // regression
        assert_eq!(engine.store.len("AAA"), 1);
        assert_eq!(engine.store.last("AAA").unwrap().price, 70.0);
    }
}
