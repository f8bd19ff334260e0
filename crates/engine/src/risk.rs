//! Risk scoring for periodic scheduling
//!
//! ```text
//! score = min(daily_volume / 1000, 50)
//!       + min(tx_count_30d / 10, 30)
//!       + unresolved_anomalies * 20
//!       + min(balance / 10000, 15)
//! halved when idle > 7 days, clamped to 0..=100
//! ```
//!
//! | level    | score | priority | interval |
//! |----------|-------|----------|----------|
//! | critical | > 80  | 1        | 6h       |
//! | high     | > 60  | 3        | 12h      |
//! | medium   | > 20  | 5        | 24h      |
//! | low      | <= 20 | 8        | 48h      |

use chrono::Duration;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

use crate::config::PeriodicConfig;

/// Signals gathered for one wallet
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskInputs {
    pub daily_volume: Decimal,
    pub transaction_count_30d: u64,
    pub unresolved_anomalies: u64,
    pub balance: Decimal,
    /// Days since the last completed transaction
    pub days_inactive: i64,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: Decimal) -> Self {
        if score > Decimal::from(80) {
            RiskLevel::Critical
        } else if score > Decimal::from(60) {
            RiskLevel::High
        } else if score > Decimal::from(20) {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Queue priority, lower runs first
    pub fn priority(&self) -> u8 {
        match self {
            RiskLevel::Critical => 1,
            RiskLevel::High => 3,
            RiskLevel::Medium => 5,
            RiskLevel::Low => 8,
        }
    }

    pub fn base_interval_hours(&self) -> i64 {
        match self {
            RiskLevel::Critical => 6,
            RiskLevel::High => 12,
            RiskLevel::Medium => 24,
            RiskLevel::Low => 48,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskAssessment {
    pub score: Decimal,
    pub level: RiskLevel,
    pub priority: u8,
    /// Time between two periodic audits
    pub frequency: Duration,
}

pub fn risk_score(inputs: &RiskInputs, config: &PeriodicConfig) -> Decimal {
    let volume = (inputs.daily_volume / Decimal::from(1_000)).min(Decimal::from(50));
    let frequency = (Decimal::from(inputs.transaction_count_30d) / Decimal::from(10)).min(Decimal::from(30));
    let anomalies = Decimal::from(inputs.unresolved_anomalies) * Decimal::from(20);
    let balance = (inputs.balance.max(Decimal::ZERO) / Decimal::from(10_000)).min(Decimal::from(15));

    let mut score = volume.max(Decimal::ZERO) + frequency + anomalies + balance;
    if inputs.days_inactive > config.inactive_halving_days {
        score /= Decimal::TWO;
    }
    score.clamp(Decimal::ZERO, Decimal::ONE_HUNDRED)
}

/// Interval between audits, bounded to `[min_frequency_hours, max_frequency_hours]`
pub fn audit_frequency(level: RiskLevel, inputs: &RiskInputs, config: &PeriodicConfig) -> Duration {
    let mut hours = Decimal::from(level.base_interval_hours());
    if inputs.daily_volume > config.high_volume_daily {
        hours /= Decimal::TWO;
    }
    if inputs.days_inactive > config.dormant_days {
        hours *= Decimal::from(3);
    }
    let hours = hours.clamp(
        Decimal::from(config.min_frequency_hours),
        Decimal::from(config.max_frequency_hours),
    );

    let minutes = (hours * Decimal::from(60)).round().to_i64().unwrap_or(config.max_frequency_hours * 60);
    Duration::minutes(minutes)
}

pub fn assess(inputs: &RiskInputs, config: &PeriodicConfig) -> RiskAssessment {
    let score = risk_score(inputs, config);
    let level = RiskLevel::from_score(score);
    RiskAssessment {
        score,
        level,
        priority: level.priority(),
        frequency: audit_frequency(level, inputs, config),
    }
}
