//! Per-pair entry/exit state machine over spread z-scores.
//!
//! Transition logic is a pure function of (current phase, z-score,
//! thresholds); the generator just keys phases by pair id and stamps
//! emitted signals. Hysteresis (exit_z strictly below entry_z) is enforced
//! by config validation before a generator is ever constructed.

use std::collections::HashMap;

/// Where a pair currently sits in its trade cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpreadPhase {
    Flat,
    LongSpread,
    ShortSpread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    MeanReverted,
    StopLoss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    EnterLongSpread,
    EnterShortSpread,
    Exit(ExitReason),
    None,
}

impl SignalKind {
    pub fn is_entry(&self) -> bool {
        matches!(self, SignalKind::EnterLongSpread | SignalKind::EnterShortSpread)
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, SignalKind::Exit(_))
    }
}

#[derive(Debug, Clone)]
pub struct Signal {
    pub pair_key: String,
    pub kind: SignalKind,
    pub z_score: f64,
    pub ts: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub entry_z: f64,
    pub exit_z: f64,
    pub stop_loss_z: f64,
}

/// Pure transition: next phase plus the signal the move implies.
pub fn transition(phase: SpreadPhase, z: f64, th: &Thresholds) -> (SpreadPhase, SignalKind) {
    match phase {
        SpreadPhase::Flat => {
            if z <= -th.entry_z {
                (SpreadPhase::LongSpread, SignalKind::EnterLongSpread)
            } else if z >= th.entry_z {
                (SpreadPhase::ShortSpread, SignalKind::EnterShortSpread)
            } else {
                (SpreadPhase::Flat, SignalKind::None)
            }
        }
        SpreadPhase::LongSpread => {
            if z <= -th.stop_loss_z {
                (SpreadPhase::Flat, SignalKind::Exit(ExitReason::StopLoss))
            } else if z >= -th.exit_z {
                (SpreadPhase::Flat, SignalKind::Exit(ExitReason::MeanReverted))
            } else {
                (SpreadPhase::LongSpread, SignalKind::None)
            }
        }
        SpreadPhase::ShortSpread => {
            if z >= th.stop_loss_z {
                (SpreadPhase::Flat, SignalKind::Exit(ExitReason::StopLoss))
            } else if z <= th.exit_z {
                (SpreadPhase::Flat, SignalKind::Exit(ExitReason::MeanReverted))
            } else {
                (SpreadPhase::ShortSpread, SignalKind::None)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PhaseState {
    phase: SpreadPhase,
    last_exit_ts: Option<i64>,
}

/// Keyed collection of per-pair phases. Newly tracked pairs start FLAT; a
/// pair is dropped from tracking once its position is closed and it has
/// left the universe.
#[derive(Debug)]
pub struct SignalGenerator {
    thresholds: Thresholds,
    cooldown_secs: i64,
    states: HashMap<String, PhaseState>,
}

impl SignalGenerator {
    pub fn new(thresholds: Thresholds, cooldown_secs: i64) -> Self {
        Self {
            thresholds,
            cooldown_secs,
            states: HashMap::new(),
        }
    }

    /// Feed the latest z-score for a pair and get back the resulting signal.
    /// Entries within the post-exit cooldown are suppressed to NONE.
    pub fn on_z_score(&mut self, pair_key: &str, z: f64, ts: i64) -> Signal {
        let state = self.states.entry(pair_key.to_string()).or_insert(PhaseState {
            phase: SpreadPhase::Flat,
            last_exit_ts: None,
        });
        let (mut next, mut kind) = transition(state.phase, z, &self.thresholds);
        if kind.is_entry() {
            if let Some(exit_ts) = state.last_exit_ts {
                if ts.saturating_sub(exit_ts) < self.cooldown_secs {
                    next = SpreadPhase::Flat;
                    kind = SignalKind::None;
                }
            }
        }
        if kind.is_exit() {
            state.last_exit_ts = Some(ts);
        }
        state.phase = next;
        Signal {
            pair_key: pair_key.to_string(),
            kind,
            z_score: z,
            ts,
        }
    }

    pub fn phase(&self, pair_key: &str) -> SpreadPhase {
        self.states
            .get(pair_key)
            .map_or(SpreadPhase::Flat, |s| s.phase)
    }

    /// Force a pair back to FLAT, e.g. after execution failed to open the
    /// position the phase assumed.
    pub fn reset(&mut self, pair_key: &str) {
        if let Some(state) = self.states.get_mut(pair_key) {
            state.phase = SpreadPhase::Flat;
        }
    }

    pub fn untrack(&mut self, pair_key: &str) {
        self.states.remove(pair_key);
    }
}
