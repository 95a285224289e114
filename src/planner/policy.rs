//! Timing and fee policy data
//!
//! Everything here is plain configuration; `validate` is the only place a
//! policy is rejected, so the planner itself never fails.

use crate::errors::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};

/// Inclusive delay bounds in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min: u64,
    pub max: u64,
}

/// Window and delay settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingPolicy {
    #[serde(default = "default_delay_range")]
    pub delay_range: DelayRange,

    /// Accounts per window
    #[serde(default = "default_wallets_per_window")]
    pub wallets_per_window: usize,

    /// Nominal spacing between window start offsets
    #[serde(default = "default_window_size_ms")]
    pub window_size_ms: u64,
}

fn default_delay_range() -> DelayRange {
    DelayRange { min: 300, max: 2000 }
}
fn default_wallets_per_window() -> usize { 5 }
fn default_window_size_ms() -> u64 { 10_000 }

impl Default for TimingPolicy {
    fn default() -> Self {
        Self {
            delay_range: default_delay_range(),
            wallets_per_window: default_wallets_per_window(),
            window_size_ms: default_window_size_ms(),
        }
    }
}

impl TimingPolicy {
    pub fn validate(&self) -> EngineResult<()> {
        if self.delay_range.min > self.delay_range.max {
            return Err(EngineError::Config(format!(
                "delay_range.min ({}) exceeds delay_range.max ({})",
                self.delay_range.min, self.delay_range.max
            )));
        }
        if self.wallets_per_window == 0 {
            return Err(EngineError::Config(
                "wallets_per_window must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fee strategy of the bundle owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeBehavior {
    Conservative,
    Moderate,
    Aggressive,
}

/// Fee-rate boundaries between congestion levels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CongestionThresholds {
    /// Rates at or below this are `low`
    pub low_max: f64,
    /// Rates at or above this are `high`
    pub high_min: f64,
}

impl Default for CongestionThresholds {
    fn default() -> Self {
        Self {
            low_max: 20.0,
            high_min: 50.0,
        }
    }
}

/// Multiplier per congestion level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelMultipliers {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

/// Behaviour x congestion multiplier table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MultiplierTable {
    pub conservative: LevelMultipliers,
    pub moderate: LevelMultipliers,
    pub aggressive: LevelMultipliers,
}

impl Default for MultiplierTable {
    fn default() -> Self {
        Self {
            conservative: LevelMultipliers {
                low: 1.0,
                medium: 1.1,
                high: 1.25,
            },
            moderate: LevelMultipliers {
                low: 1.05,
                medium: 1.2,
                high: 1.5,
            },
            aggressive: LevelMultipliers {
                low: 1.1,
                medium: 1.35,
                high: 1.8,
            },
        }
    }
}

impl MultiplierTable {
    pub fn row(&self, behavior: FeeBehavior) -> &LevelMultipliers {
        match behavior {
            FeeBehavior::Conservative => &self.conservative,
            FeeBehavior::Moderate => &self.moderate,
            FeeBehavior::Aggressive => &self.aggressive,
        }
    }
}

/// Protection against transactions being front-run in the public mempool
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum FrontRunProtection {
    #[default]
    None,
    /// Pay `percent` more than the market-aware fee
    FeeBump { percent: f64 },
    /// Ask the ledger client for its private submission path
    PrivateSubmission,
}

/// Fee settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeePolicy {
    #[serde(default = "default_behavior")]
    pub behavior: FeeBehavior,

    /// Protocol minimum fee in fee units
    #[serde(default = "default_min_fee")]
    pub min_fee: u64,

    #[serde(default)]
    pub thresholds: CongestionThresholds,

    #[serde(default)]
    pub multipliers: MultiplierTable,

    #[serde(default)]
    pub front_running: FrontRunProtection,
}

fn default_behavior() -> FeeBehavior { FeeBehavior::Moderate }
fn default_min_fee() -> u64 { 1_000 }

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            behavior: default_behavior(),
            min_fee: default_min_fee(),
            thresholds: CongestionThresholds::default(),
            multipliers: MultiplierTable::default(),
            front_running: FrontRunProtection::default(),
        }
    }
}

impl FeePolicy {
    pub fn validate(&self) -> EngineResult<()> {
        let t = self.thresholds;
        if !t.low_max.is_finite() || !t.high_min.is_finite() || t.low_max < 0.0 {
            return Err(EngineError::Config(
                "congestion thresholds must be finite and non-negative".to_string(),
            ));
        }
        if t.low_max > t.high_min {
            return Err(EngineError::Config(format!(
                "thresholds.low_max ({}) exceeds thresholds.high_min ({})",
                t.low_max, t.high_min
            )));
        }

        for (name, row) in [
            ("conservative", &self.multipliers.conservative),
            ("moderate", &self.multipliers.moderate),
            ("aggressive", &self.multipliers.aggressive),
        ] {
            for value in [row.low, row.medium, row.high] {
                if !value.is_finite() || value <= 0.0 {
                    return Err(EngineError::Config(format!(
                        "multipliers.{name} must be finite and positive, got {value}"
                    )));
                }
            }
        }

        if let FrontRunProtection::FeeBump { percent } = self.front_running {
            if !percent.is_finite() || percent < 0.0 {
                return Err(EngineError::Config(format!(
                    "fee bump percent must be finite and non-negative, got {percent}"
                )));
            }
        }
        Ok(())
    }
}
