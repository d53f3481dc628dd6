use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::market::Instrument;

const DEFAULT_LOOKBACK_WINDOW: usize = 480;
const DEFAULT_COINT_MIN_SAMPLES: usize = 60;
const DEFAULT_SIGNIFICANCE_THRESHOLD: f64 = 0.05;
const DEFAULT_HALF_LIFE_MAX: f64 = 120.0;
const DEFAULT_MIN_CORRELATION: f64 = 0.6;
const DEFAULT_SPREAD_WINDOW: usize = 240;
const DEFAULT_MIN_WINDOW: usize = 30;
const DEFAULT_ENTRY_Z: f64 = 2.0;
const DEFAULT_EXIT_Z: f64 = 0.5;
const DEFAULT_STOP_LOSS_Z: f64 = 3.3;
const DEFAULT_COOLDOWN_SECS: i64 = 30;
const DEFAULT_FORCE_CLOSE_SECS: i64 = 0; // 0 disables the time stop
const DEFAULT_RISK_PER_TRADE: f64 = 0.01;
const DEFAULT_EQUITY_USD: f64 = 10_000.0;
const DEFAULT_MAX_OPEN_POSITIONS: usize = 3;
const DEFAULT_MAX_CAPITAL_PER_PAIR: f64 = 2_000.0;
const DEFAULT_MAX_AGGREGATE_EXPOSURE: f64 = 5_000.0;
const DEFAULT_MAX_DRAWDOWN: f64 = 0.10;
const DEFAULT_RECONCILE_TIMEOUT_SECS: i64 = 120;
const DEFAULT_REJECT_MAX_RETRIES: u32 = 1;
const DEFAULT_IDEMPOTENCY_RETENTION_SECS: i64 = 3600;
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 3600;
const DEFAULT_TICK_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigValidationError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMode {
    BetaNeutral,
    DollarNeutral,
}

impl FromStr for SizingMode {
    type Err = ConfigValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "beta_neutral" => Ok(SizingMode::BetaNeutral),
            "dollar_neutral" => Ok(SizingMode::DollarNeutral),
            other => Err(ConfigValidationError(format!(
                "unknown sizing_mode '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
struct InstrumentYaml {
    id: String,
    tick_size: Option<Decimal>,
    lot_size: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct StatArbYaml {
    instruments: Option<Vec<InstrumentYaml>>,
    lookback_window: Option<usize>,
    coint_min_samples: Option<usize>,
    significance_threshold: Option<f64>,
    half_life_max: Option<f64>,
    min_correlation: Option<f64>,
    spread_window: Option<usize>,
    min_window: Option<usize>,
    entry_z_score: Option<f64>,
    exit_z_score: Option<f64>,
    stop_loss_z_score: Option<f64>,
    cooldown_secs: Option<i64>,
    force_close_secs: Option<i64>,
    risk_per_trade: Option<f64>,
    equity_usd_fallback: Option<f64>,
    sizing_mode: Option<String>,
    max_open_positions: Option<usize>,
    max_capital_per_pair: Option<f64>,
    max_aggregate_exposure: Option<f64>,
    max_drawdown: Option<f64>,
    reconcile_timeout_secs: Option<i64>,
    reject_max_retries: Option<u32>,
    idempotency_retention_secs: Option<i64>,
    refresh_interval_secs: Option<u64>,
    tick_queue_depth: Option<usize>,
    snapshot_file: Option<String>,
}

/// Process-wide risk limits, read-only after load.
#[derive(Debug, Clone, Copy)]
pub struct RiskLimits {
    pub max_open_positions: usize,
    pub max_capital_per_pair: f64,
    pub max_aggregate_exposure: f64,
    pub max_drawdown: f64,
}

#[derive(Debug, Clone)]
pub struct StatArbConfig {
    pub instruments: Vec<Instrument>,
    /// Price history capacity per instrument, in samples.
    pub lookback_window: usize,
    pub coint_min_samples: usize,
    pub significance_threshold: f64,
    /// Pairs whose residual half-life exceeds this (in samples) are skipped.
    pub half_life_max: f64,
    /// Candidate legs must carry at least this absolute price correlation;
    /// a stationary leg regressed against noise gives a near-zero hedge
    /// ratio and a residual that fakes stationarity, and this gate keeps
    /// such pairs out of the universe.
    pub min_correlation: f64,
    pub spread_window: usize,
    pub min_window: usize,
    pub entry_z: f64,
    pub exit_z: f64,
    pub stop_loss_z: f64,
    pub cooldown_secs: i64,
    /// Max holding time before a position is force-closed; 0 disables.
    pub force_close_secs: i64,
    pub risk_per_trade: f64,
    pub equity_usd: f64,
    pub sizing_mode: SizingMode,
    pub limits: RiskLimits,
    pub reconcile_timeout_secs: i64,
    pub reject_max_retries: u32,
    pub idempotency_retention_secs: i64,
    pub refresh_interval_secs: u64,
    pub tick_queue_depth: usize,
    pub snapshot_file: Option<String>,
}

impl StatArbConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let path = env::var("STATARB_CONFIG")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let mut cfg = match path {
            Some(path) => Self::from_yaml_path(path)?,
            None => Self::default_config(),
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open statarb config {}", path_ref.display()))?;
        let yaml: StatArbYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse statarb config {}", path_ref.display()))?;

        let instruments = yaml
            .instruments
            .unwrap_or_default()
            .into_iter()
            .map(|i| Instrument {
                id: i.id,
                tick_size: i.tick_size.unwrap_or_else(|| Decimal::new(1, 2)),
                lot_size: i.lot_size.unwrap_or_else(|| Decimal::new(1, 3)),
            })
            .collect();
        let sizing_mode = yaml
            .sizing_mode
            .as_deref()
            .map(SizingMode::from_str)
            .transpose()?
            .unwrap_or(SizingMode::BetaNeutral);

        Ok(StatArbConfig {
            instruments,
            lookback_window: yaml.lookback_window.unwrap_or(DEFAULT_LOOKBACK_WINDOW),
            coint_min_samples: yaml.coint_min_samples.unwrap_or(DEFAULT_COINT_MIN_SAMPLES),
            significance_threshold: yaml
                .significance_threshold
                .unwrap_or(DEFAULT_SIGNIFICANCE_THRESHOLD),
            half_life_max: yaml.half_life_max.unwrap_or(DEFAULT_HALF_LIFE_MAX),
            min_correlation: yaml.min_correlation.unwrap_or(DEFAULT_MIN_CORRELATION),
            spread_window: yaml.spread_window.unwrap_or(DEFAULT_SPREAD_WINDOW),
            min_window: yaml.min_window.unwrap_or(DEFAULT_MIN_WINDOW),
            entry_z: yaml.entry_z_score.unwrap_or(DEFAULT_ENTRY_Z),
            exit_z: yaml.exit_z_score.unwrap_or(DEFAULT_EXIT_Z),
            stop_loss_z: yaml.stop_loss_z_score.unwrap_or(DEFAULT_STOP_LOSS_Z),
            cooldown_secs: yaml.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS),
            force_close_secs: yaml.force_close_secs.unwrap_or(DEFAULT_FORCE_CLOSE_SECS),
            risk_per_trade: yaml.risk_per_trade.unwrap_or(DEFAULT_RISK_PER_TRADE),
            equity_usd: yaml.equity_usd_fallback.unwrap_or(DEFAULT_EQUITY_USD),
            sizing_mode,
            limits: RiskLimits {
                max_open_positions: yaml
                    .max_open_positions
                    .unwrap_or(DEFAULT_MAX_OPEN_POSITIONS),
                max_capital_per_pair: yaml
                    .max_capital_per_pair
                    .unwrap_or(DEFAULT_MAX_CAPITAL_PER_PAIR),
                max_aggregate_exposure: yaml
                    .max_aggregate_exposure
                    .unwrap_or(DEFAULT_MAX_AGGREGATE_EXPOSURE),
                max_drawdown: yaml.max_drawdown.unwrap_or(DEFAULT_MAX_DRAWDOWN),
            },
            reconcile_timeout_secs: yaml
                .reconcile_timeout_secs
                .unwrap_or(DEFAULT_RECONCILE_TIMEOUT_SECS),
            reject_max_retries: yaml.reject_max_retries.unwrap_or(DEFAULT_REJECT_MAX_RETRIES),
            idempotency_retention_secs: yaml
                .idempotency_retention_secs
                .unwrap_or(DEFAULT_IDEMPOTENCY_RETENTION_SECS),
            refresh_interval_secs: yaml
                .refresh_interval_secs
                .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS),
            tick_queue_depth: yaml.tick_queue_depth.unwrap_or(DEFAULT_TICK_QUEUE_DEPTH),
            snapshot_file: yaml.snapshot_file,
        })
    }

    pub fn default_config() -> Self {
        StatArbConfig {
            instruments: Vec::new(),
            lookback_window: DEFAULT_LOOKBACK_WINDOW,
            coint_min_samples: DEFAULT_COINT_MIN_SAMPLES,
            significance_threshold: DEFAULT_SIGNIFICANCE_THRESHOLD,
            half_life_max: DEFAULT_HALF_LIFE_MAX,
            min_correlation: DEFAULT_MIN_CORRELATION,
            spread_window: DEFAULT_SPREAD_WINDOW,
            min_window: DEFAULT_MIN_WINDOW,
            entry_z: DEFAULT_ENTRY_Z,
            exit_z: DEFAULT_EXIT_Z,
            stop_loss_z: DEFAULT_STOP_LOSS_Z,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            force_close_secs: DEFAULT_FORCE_CLOSE_SECS,
            risk_per_trade: DEFAULT_RISK_PER_TRADE,
            equity_usd: DEFAULT_EQUITY_USD,
            sizing_mode: SizingMode::BetaNeutral,
            limits: RiskLimits {
                max_open_positions: DEFAULT_MAX_OPEN_POSITIONS,
                max_capital_per_pair: DEFAULT_MAX_CAPITAL_PER_PAIR,
                max_aggregate_exposure: DEFAULT_MAX_AGGREGATE_EXPOSURE,
                max_drawdown: DEFAULT_MAX_DRAWDOWN,
            },
            reconcile_timeout_secs: DEFAULT_RECONCILE_TIMEOUT_SECS,
            reject_max_retries: DEFAULT_REJECT_MAX_RETRIES,
            idempotency_retention_secs: DEFAULT_IDEMPOTENCY_RETENTION_SECS,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            tick_queue_depth: DEFAULT_TICK_QUEUE_DEPTH,
            snapshot_file: None,
        }
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        override_parse(&mut self.entry_z, "STATARB_ENTRY_Z")?;
        override_parse(&mut self.exit_z, "STATARB_EXIT_Z")?;
        override_parse(&mut self.stop_loss_z, "STATARB_STOP_LOSS_Z")?;
        override_parse(&mut self.risk_per_trade, "STATARB_RISK_PER_TRADE")?;
        override_parse(&mut self.equity_usd, "STATARB_EQUITY_USD")?;
        override_parse(&mut self.significance_threshold, "STATARB_SIGNIFICANCE")?;
        override_parse(&mut self.min_correlation, "STATARB_MIN_CORRELATION")?;
        override_parse(&mut self.refresh_interval_secs, "STATARB_REFRESH_SECS")?;
        if let Ok(raw) = env::var("STATARB_SIZING_MODE") {
            self.sizing_mode = raw.parse()?;
        }
        if let Ok(raw) = env::var("STATARB_SNAPSHOT_FILE") {
            if !raw.trim().is_empty() {
                self.snapshot_file = Some(raw);
            }
        }
        Ok(())
    }

    /// Fail-fast sanity checks. Anything rejected here is a startup error,
    /// never a runtime condition.
    pub fn validate(&self) -> std::result::Result<(), ConfigValidationError> {
        if !(self.exit_z > 0.0 && self.exit_z < self.entry_z) {
            return Err(ConfigValidationError(format!(
                "exit_z ({}) must be positive and strictly below entry_z ({})",
                self.exit_z, self.entry_z
            )));
        }
        if self.stop_loss_z <= self.entry_z {
            return Err(ConfigValidationError(format!(
                "stop_loss_z ({}) must exceed entry_z ({})",
                self.stop_loss_z, self.entry_z
            )));
        }
        if self.min_window < 2 {
            return Err(ConfigValidationError(
                "min_window must be at least 2".to_string(),
            ));
        }
        if self.spread_window < self.min_window {
            return Err(ConfigValidationError(format!(
                "spread_window ({}) must be >= min_window ({})",
                self.spread_window, self.min_window
            )));
        }
        if self.lookback_window < self.coint_min_samples {
            return Err(ConfigValidationError(format!(
                "lookback_window ({}) must cover coint_min_samples ({})",
                self.lookback_window, self.coint_min_samples
            )));
        }
        if !(self.risk_per_trade > 0.0 && self.risk_per_trade <= 1.0) {
            return Err(ConfigValidationError(format!(
                "risk_per_trade ({}) must be in (0, 1]",
                self.risk_per_trade
            )));
        }
        if !(self.significance_threshold > 0.0 && self.significance_threshold < 1.0) {
            return Err(ConfigValidationError(format!(
                "significance_threshold ({}) must be in (0, 1)",
                self.significance_threshold
            )));
        }
        if !(0.0..1.0).contains(&self.min_correlation) {
            return Err(ConfigValidationError(format!(
                "min_correlation ({}) must be in [0, 1)",
                self.min_correlation
            )));
        }
        if self.limits.max_open_positions == 0
            || self.limits.max_capital_per_pair <= 0.0
            || self.limits.max_aggregate_exposure <= 0.0
            || !(self.limits.max_drawdown > 0.0 && self.limits.max_drawdown <= 1.0)
        {
            return Err(ConfigValidationError(
                "risk limits must all be positive (max_drawdown in (0, 1])".to_string(),
            ));
        }
        if self.reconcile_timeout_secs <= 0 {
            return Err(ConfigValidationError(
                "reconcile_timeout_secs must be positive".to_string(),
            ));
        }
        if self.refresh_interval_secs == 0 {
            return Err(ConfigValidationError(
                "refresh_interval_secs must be positive".to_string(),
            ));
        }
        if self.tick_queue_depth == 0 {
            return Err(ConfigValidationError(
                "tick_queue_depth must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn thresholds(&self) -> crate::signal::Thresholds {
        crate::signal::Thresholds {
            entry_z: self.entry_z,
            exit_z: self.exit_z,
            stop_loss_z: self.stop_loss_z,
        }
    }
}

fn override_parse<T: FromStr>(slot: &mut T, key: &str) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = env::var(key) {
        if !raw.trim().is_empty() {
            *slot = raw
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid {}: {}", key, e))?;
        }
    }
    Ok(())
}
