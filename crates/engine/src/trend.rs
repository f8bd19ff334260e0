//! Trend signals across a wallet's snapshots
//!
//! Input is the snapshot history of the trend window, oldest first. At
//! least two snapshots are needed to say anything.

use ledgerwatch_core::{AuditSnapshot, Invariant, Severity, WalletId};
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

use crate::anomaly::Anomaly;
use crate::config::PeriodicConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

impl TrendDirection {
    /// Changes within ±5% count as stable
    pub fn of(change_ratio: Decimal) -> Self {
        let band = Decimal::new(5, 2);
        if change_ratio > band {
            TrendDirection::Increasing
        } else if change_ratio < -band {
            TrendDirection::Decreasing
        } else {
            TrendDirection::Stable
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    pub snapshot_count: usize,
    pub balance_trend: TrendDirection,
    /// `(last - first) / |first|`, zero when the first balance is zero
    pub balance_change_ratio: Decimal,
    /// Coefficient of variation of the balances
    pub volatility: Decimal,
    /// Latest transaction rate against the earlier average, needs 3 snapshots
    pub frequency_change: Option<Decimal>,
    /// Balance movement in the later half against the earlier half
    pub volume_trend: TrendDirection,
}

fn relative_change(from: Decimal, to: Decimal) -> Decimal {
    if from.is_zero() {
        Decimal::ZERO
    } else {
        (to - from) / from.abs()
    }
}

fn coefficient_of_variation(values: &[Decimal]) -> Decimal {
    let n = Decimal::from(values.len());
    let mean = values.iter().copied().sum::<Decimal>() / n;
    if mean.is_zero() {
        return Decimal::ZERO;
    }
    let variance = values
        .iter()
        .map(|v| (*v - mean) * (*v - mean))
        .sum::<Decimal>()
        / n;
    variance.sqrt().unwrap_or(Decimal::ZERO) / mean.abs()
}

/// Transactions per hour between consecutive snapshots
fn transaction_rates(snapshots: &[AuditSnapshot]) -> Vec<Decimal> {
    snapshots
        .windows(2)
        .filter_map(|pair| {
            let minutes = (pair[1].snapshot_date - pair[0].snapshot_date).num_minutes();
            if minutes <= 0 {
                return None;
            }
            let delta = pair[1].transaction_count.saturating_sub(pair[0].transaction_count);
            Some(Decimal::from(delta) * Decimal::from(60) / Decimal::from(minutes))
        })
        .collect()
}

fn frequency_change(rates: &[Decimal]) -> Option<Decimal> {
    let (latest, earlier) = rates.split_last()?;
    if earlier.is_empty() {
        return None;
    }
    let baseline = earlier.iter().copied().sum::<Decimal>() / Decimal::from(earlier.len());
    if baseline.is_zero() {
        return None;
    }
    Some((*latest - baseline) / baseline)
}

fn volume_trend(snapshots: &[AuditSnapshot]) -> TrendDirection {
    let movements: Vec<Decimal> = snapshots
        .windows(2)
        .map(|pair| (pair[1].balance - pair[0].balance).abs())
        .collect();
    let mid = movements.len() / 2;
    if mid == 0 {
        return TrendDirection::Stable;
    }
    let earlier: Decimal = movements[..mid].iter().copied().sum();
    let later: Decimal = movements[mid..].iter().copied().sum();
    TrendDirection::of(relative_change(earlier, later))
}

pub fn analyze(snapshots: &[AuditSnapshot]) -> Option<TrendReport> {
    let (first, last) = match snapshots {
        [first, .., last] => (first, last),
        _ => return None,
    };

    let balances: Vec<Decimal> = snapshots.iter().map(|s| s.balance).collect();
    let balance_change_ratio = relative_change(first.balance, last.balance);

    Some(TrendReport {
        snapshot_count: snapshots.len(),
        balance_trend: TrendDirection::of(balance_change_ratio),
        balance_change_ratio,
        volatility: coefficient_of_variation(&balances),
        frequency_change: frequency_change(&transaction_rates(snapshots)),
        volume_trend: volume_trend(snapshots),
    })
}

/// Anomalies implied by a trend report
pub fn trend_anomalies(wallet_id: WalletId, report: &TrendReport, config: &PeriodicConfig) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();

    if report.balance_change_ratio < -config.sharp_decline_ratio {
        anomalies.push(
            Anomaly::wallet(Invariant::SharpBalanceDecline, wallet_id)
                .values(-config.sharp_decline_ratio, report.balance_change_ratio)
                .severity(Severity::High)
                .describe(format!(
                    "Wallet {} balance fell {}% over {} snapshots",
                    wallet_id,
                    (-report.balance_change_ratio * Decimal::ONE_HUNDRED).round_dp(1),
                    report.snapshot_count
                )),
        );
    }

    if report.volatility > config.volatility_threshold {
        anomalies.push(
            Anomaly::wallet(Invariant::HighBalanceVolatility, wallet_id)
                .values(config.volatility_threshold, report.volatility.round_dp(4))
                .severity(Severity::Medium)
                .describe(format!(
                    "Wallet {} balance volatility {} exceeds {}",
                    wallet_id,
                    report.volatility.round_dp(2),
                    config.volatility_threshold
                )),
        );
    }

    if let Some(change) = report.frequency_change {
        if change > config.frequency_change_threshold {
            anomalies.push(
                Anomaly::wallet(Invariant::TransactionFrequencySpike, wallet_id)
                    .values(config.frequency_change_threshold, change.round_dp(4))
                    .severity(Severity::Medium)
                    .describe(format!(
                        "Wallet {} transaction rate up {}%",
                        wallet_id,
                        (change * Decimal::ONE_HUNDRED).round_dp(0)
                    )),
            );
        }
    }

    anomalies
        .into_iter()
        .map(|a| {
            a.meta("balance_trend", report.balance_trend.as_ref())
                .meta("volume_trend", report.volume_trend.as_ref())
        })
        .collect()
}
