//! Market-aware fee multipliers

use super::policy::{CongestionThresholds, FeePolicy, FrontRunProtection};
use serde::{Deserialize, Serialize};

/// Coarse classification of current ledger fee pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionLevel {
    Low,
    Medium,
    High,
}

impl CongestionLevel {
    pub fn classify(fee_rate: f64, thresholds: &CongestionThresholds) -> Self {
        if !fee_rate.is_finite() || fee_rate >= thresholds.high_min {
            CongestionLevel::High
        } else if fee_rate <= thresholds.low_max {
            CongestionLevel::Low
        } else {
            CongestionLevel::Medium
        }
    }
}

/// Market snapshot taken from the ledger health probe
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketConditions {
    pub fee_rate: f64,
}

/// Fee decision for one task
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeQuote {
    pub multiplier: f64,
    pub private_submission: bool,
    pub congestion: CongestionLevel,
}

/// Multiplier from the behaviour x congestion table
pub fn market_multiplier(policy: &FeePolicy, market: &MarketConditions) -> (f64, CongestionLevel) {
    let level = CongestionLevel::classify(market.fee_rate, &policy.thresholds);
    let row = policy.multipliers.row(policy.behavior);
    let multiplier = match level {
        CongestionLevel::Low => row.low,
        CongestionLevel::Medium => row.medium,
        CongestionLevel::High => row.high,
    };
    (multiplier, level)
}

/// Smallest multiplier that keeps `base_fee * multiplier` at or above `min_fee`
pub fn min_fee_multiplier(base_fee: u64, min_fee: u64) -> f64 {
    if base_fee == 0 {
        return 1.0;
    }
    (min_fee as f64 / base_fee as f64).max(0.0)
}

/// Full fee decision: market table, front-running protection, protocol floor
pub fn quote(policy: &FeePolicy, market: &MarketConditions, base_fee: u64) -> FeeQuote {
    let (mut multiplier, congestion) = market_multiplier(policy, market);

    let private_submission = match policy.front_running {
        FrontRunProtection::None => false,
        FrontRunProtection::FeeBump { percent } => {
            multiplier *= 1.0 + percent / 100.0;
            false
        }
        FrontRunProtection::PrivateSubmission => true,
    };

    FeeQuote {
        multiplier: multiplier.max(min_fee_multiplier(base_fee, policy.min_fee)),
        private_submission,
        congestion,
    }
}

/// Fee actually paid for a task, never below the protocol minimum
pub fn effective_fee(base_fee: u64, multiplier: f64, min_fee: u64) -> u64 {
    let fee = (base_fee as f64 * multiplier).ceil();
    let fee = if fee.is_finite() && fee > 0.0 {
        fee.min(u64::MAX as f64) as u64
    } else {
        0
    };
    fee.max(min_fee)
}
