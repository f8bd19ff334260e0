//! Audit engine configuration
//!
//! Every threshold is tunable from a JSON file. Missing fields fall back to
//! the defaults below, so a partial file only overrides what it names.

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AuditError, AuditResult};
use crate::severity::SeverityThresholds;

/// Top-level configuration, one section per auditor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub targeted: TargetedConfig,
    #[serde(default)]
    pub periodic: PeriodicConfig,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl AuditConfig {
    /// Load configuration from JSON file
    pub fn from_file(path: &Path) -> AuditResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the auditors misbehave
    pub fn validate(&self) -> AuditResult<()> {
        if self.queue.default_max_attempts == 0 {
            return Err(AuditError::Config("queue.default_max_attempts must be > 0".into()));
        }
        if self.global.batch_size == 0 {
            return Err(AuditError::Config("global.batch_size must be > 0".into()));
        }
        if self.periodic.min_frequency_hours > self.periodic.max_frequency_hours {
            return Err(AuditError::Config(
                "periodic.min_frequency_hours exceeds max_frequency_hours".into(),
            ));
        }
        if self.targeted.auto_correct_below > self.realtime.mismatch_tolerance {
            return Err(AuditError::Config(
                "targeted.auto_correct_below must not exceed realtime.mismatch_tolerance".into(),
            ));
        }
        Ok(())
    }
}

// === Realtime ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Smallest balance/ledger drift reported as a mismatch
    #[serde(default = "default_mismatch_tolerance")]
    pub mismatch_tolerance: Decimal,

    /// Context used to grade negative balances
    #[serde(default = "default_negative_balance_reference")]
    pub negative_balance_reference: Decimal,

    /// Transactions above this amount trigger a targeted audit
    #[serde(default = "default_targeted_trigger_amount")]
    pub targeted_trigger_amount: Decimal,

    /// Debounce before the triggered targeted audit runs
    #[serde(default = "default_targeted_delay_secs")]
    pub targeted_delay_secs: u64,

    #[serde(default = "default_unusual_size_multiplier")]
    pub unusual_size_multiplier: Decimal,

    #[serde(default = "default_average_window_days")]
    pub average_window_days: i64,

    #[serde(default = "default_high_frequency_window_minutes")]
    pub high_frequency_window_minutes: i64,

    /// More transactions than this inside the window is flagged
    #[serde(default = "default_high_frequency_threshold")]
    pub high_frequency_threshold: u64,

    #[serde(default = "default_fingerprint_cache_ttl_secs")]
    pub fingerprint_cache_ttl_secs: u64,

    #[serde(default = "SeverityThresholds::realtime")]
    pub severity: SeverityThresholds,
}

fn default_mismatch_tolerance() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_negative_balance_reference() -> Decimal {
    Decimal::new(1_000, 0)
}

fn default_targeted_trigger_amount() -> Decimal {
    Decimal::new(1_000, 0)
}

fn default_targeted_delay_secs() -> u64 {
    300 // 5 minutes
}

fn default_unusual_size_multiplier() -> Decimal {
    Decimal::new(10, 0)
}

fn default_average_window_days() -> i64 {
    30
}

fn default_high_frequency_window_minutes() -> i64 {
    60
}

fn default_high_frequency_threshold() -> u64 {
    10
}

fn default_fingerprint_cache_ttl_secs() -> u64 {
    3_600 // 1 hour
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            mismatch_tolerance: default_mismatch_tolerance(),
            negative_balance_reference: default_negative_balance_reference(),
            targeted_trigger_amount: default_targeted_trigger_amount(),
            targeted_delay_secs: default_targeted_delay_secs(),
            unusual_size_multiplier: default_unusual_size_multiplier(),
            average_window_days: default_average_window_days(),
            high_frequency_window_minutes: default_high_frequency_window_minutes(),
            high_frequency_threshold: default_high_frequency_threshold(),
            fingerprint_cache_ttl_secs: default_fingerprint_cache_ttl_secs(),
            severity: SeverityThresholds::realtime(),
        }
    }
}

impl RealtimeConfig {
    pub fn targeted_delay(&self) -> Duration {
        Duration::seconds(self.targeted_delay_secs as i64)
    }

    pub fn average_window(&self) -> Duration {
        Duration::days(self.average_window_days)
    }

    pub fn high_frequency_window(&self) -> Duration {
        Duration::minutes(self.high_frequency_window_minutes)
    }

    pub fn fingerprint_cache_ttl(&self) -> Duration {
        Duration::seconds(self.fingerprint_cache_ttl_secs as i64)
    }
}

// === Targeted ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetedConfig {
    /// Per-entity lock lifetime; doubles as the stuck-worker timeout
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Drift strictly below this is corrected automatically
    #[serde(default = "default_auto_correct_below")]
    pub auto_correct_below: Decimal,

    /// How long a job waits when the entity lock is busy
    #[serde(default = "default_lock_retry_delay_secs")]
    pub lock_retry_delay_secs: u64,

    /// Delay before a failed job becomes due again
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    /// Points of the running-balance trail kept in log metadata
    #[serde(default = "default_trail_length")]
    pub trail_length: usize,
}

fn default_lock_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_auto_correct_below() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_lock_retry_delay_secs() -> u64 {
    60
}

fn default_retry_backoff_secs() -> u64 {
    60
}

fn default_trail_length() -> usize {
    50
}

impl Default for TargetedConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl_secs(),
            auto_correct_below: default_auto_correct_below(),
            lock_retry_delay_secs: default_lock_retry_delay_secs(),
            retry_backoff_secs: default_retry_backoff_secs(),
            trail_length: default_trail_length(),
        }
    }
}

impl TargetedConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::seconds(self.lock_ttl_secs as i64)
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::seconds(self.lock_retry_delay_secs as i64)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::seconds(self.retry_backoff_secs as i64)
    }
}

// === Periodic ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicConfig {
    /// Wallets with a transaction inside this window are considered active
    #[serde(default = "default_activity_window_days")]
    pub activity_window_days: i64,

    /// Risk score is halved after this many idle days
    #[serde(default = "default_inactive_halving_days")]
    pub inactive_halving_days: i64,

    /// Audit interval is tripled after this many idle days
    #[serde(default = "default_periodic_dormant_days")]
    pub dormant_days: i64,

    /// Daily volume above which the interval is halved
    #[serde(default = "default_high_volume_daily")]
    pub high_volume_daily: Decimal,

    #[serde(default = "default_min_frequency_hours")]
    pub min_frequency_hours: i64,

    #[serde(default = "default_max_frequency_hours")]
    pub max_frequency_hours: i64,

    /// A wallet must move more than this since its last snapshot to be rescheduled
    #[serde(default = "default_balance_change_threshold")]
    pub balance_change_threshold: Decimal,

    #[serde(default = "default_tx_count_change_threshold")]
    pub tx_count_change_threshold: u64,

    /// Grace applied to the job creation time when checking for staleness
    #[serde(default = "default_stale_grace_secs")]
    pub stale_grace_secs: u64,

    #[serde(default = "default_global_audit_delay_hours")]
    pub global_audit_delay_hours: i64,

    #[serde(default = "default_trend_window_days")]
    pub trend_window_days: i64,

    /// Coefficient of variation above which balances are flagged
    #[serde(default = "default_volatility_threshold")]
    pub volatility_threshold: Decimal,

    /// Relative change in transaction rate above which it is flagged (2.0 = 200%)
    #[serde(default = "default_frequency_change_threshold")]
    pub frequency_change_threshold: Decimal,

    /// Fractional drop of the balance over the window flagged as sharp
    #[serde(default = "default_sharp_decline_ratio")]
    pub sharp_decline_ratio: Decimal,
}

fn default_activity_window_days() -> i64 {
    30
}

fn default_inactive_halving_days() -> i64 {
    7
}

fn default_periodic_dormant_days() -> i64 {
    30
}

fn default_high_volume_daily() -> Decimal {
    Decimal::new(50_000, 0)
}

fn default_min_frequency_hours() -> i64 {
    1
}

fn default_max_frequency_hours() -> i64 {
    168 // 1 week
}

fn default_balance_change_threshold() -> Decimal {
    Decimal::new(100, 0)
}

fn default_tx_count_change_threshold() -> u64 {
    10
}

fn default_stale_grace_secs() -> u64 {
    3_600 // 1 hour
}

fn default_global_audit_delay_hours() -> i64 {
    24
}

fn default_trend_window_days() -> i64 {
    30
}

fn default_volatility_threshold() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_frequency_change_threshold() -> Decimal {
    Decimal::new(2, 0)
}

fn default_sharp_decline_ratio() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

impl Default for PeriodicConfig {
    fn default() -> Self {
        Self {
            activity_window_days: default_activity_window_days(),
            inactive_halving_days: default_inactive_halving_days(),
            dormant_days: default_periodic_dormant_days(),
            high_volume_daily: default_high_volume_daily(),
            min_frequency_hours: default_min_frequency_hours(),
            max_frequency_hours: default_max_frequency_hours(),
            balance_change_threshold: default_balance_change_threshold(),
            tx_count_change_threshold: default_tx_count_change_threshold(),
            stale_grace_secs: default_stale_grace_secs(),
            global_audit_delay_hours: default_global_audit_delay_hours(),
            trend_window_days: default_trend_window_days(),
            volatility_threshold: default_volatility_threshold(),
            frequency_change_threshold: default_frequency_change_threshold(),
            sharp_decline_ratio: default_sharp_decline_ratio(),
        }
    }
}

impl PeriodicConfig {
    pub fn activity_window(&self) -> Duration {
        Duration::days(self.activity_window_days)
    }

    pub fn stale_grace(&self) -> Duration {
        Duration::seconds(self.stale_grace_secs as i64)
    }

    pub fn global_audit_delay(&self) -> Duration {
        Duration::hours(self.global_audit_delay_hours)
    }

    pub fn trend_window(&self) -> Duration {
        Duration::days(self.trend_window_days)
    }
}

// === Global ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Wallets read per page during the detail pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Accepted drift on system-level equations
    #[serde(default = "default_equation_tolerance")]
    pub equation_tolerance: Decimal,

    /// Minimum `solde_marchand / engagement_users`
    #[serde(default = "default_liquidity_min_ratio")]
    pub liquidity_min_ratio: Decimal,

    /// Share of engagement held by one wallet before it is flagged
    #[serde(default = "default_concentration_threshold")]
    pub concentration_threshold: Decimal,

    /// Share of balances sitting in dormant wallets before it is flagged
    #[serde(default = "default_dormant_share_threshold")]
    pub dormant_share_threshold: Decimal,

    #[serde(default = "default_global_dormant_days")]
    pub dormant_days: i64,

    #[serde(default = "SeverityThresholds::global")]
    pub severity: SeverityThresholds,
}

fn default_batch_size() -> usize {
    1_000
}

fn default_equation_tolerance() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_liquidity_min_ratio() -> Decimal {
    Decimal::new(1, 1) // 0.1
}

fn default_concentration_threshold() -> Decimal {
    Decimal::new(5, 1)
}

fn default_dormant_share_threshold() -> Decimal {
    Decimal::new(5, 1)
}

fn default_global_dormant_days() -> i64 {
    90
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            equation_tolerance: default_equation_tolerance(),
            liquidity_min_ratio: default_liquidity_min_ratio(),
            concentration_threshold: default_concentration_threshold(),
            dormant_share_threshold: default_dormant_share_threshold(),
            dormant_days: default_global_dormant_days(),
            severity: SeverityThresholds::global(),
        }
    }
}

impl GlobalConfig {
    pub fn dormant_after(&self) -> Duration {
        Duration::days(self.dormant_days)
    }
}

// === Queue ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// How long a claimed job stays reserved for its worker
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    #[serde(default = "default_worker_poll_ms")]
    pub worker_poll_ms: u64,

    #[serde(default = "default_queue_name")]
    pub queue_name: String,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_lease_secs() -> u64 {
    300
}

fn default_worker_poll_ms() -> u64 {
    1_000
}

fn default_queue_name() -> String {
    "audits".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            lease_secs: default_lease_secs(),
            worker_poll_ms: default_worker_poll_ms(),
            queue_name: default_queue_name(),
        }
    }
}

impl QueueConfig {
    pub fn lease(&self) -> Duration {
        Duration::seconds(self.lease_secs as i64)
    }

    pub fn worker_poll(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.worker_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AuditConfig::default();

        assert_eq!(config.realtime.mismatch_tolerance, dec!(0.01));
        assert_eq!(config.realtime.targeted_trigger_amount, dec!(1000));
        assert_eq!(config.realtime.high_frequency_threshold, 10);
        assert_eq!(config.targeted.lock_ttl_secs, 300);
        assert_eq!(config.targeted.auto_correct_below, dec!(0.01));
        assert_eq!(config.periodic.max_frequency_hours, 168);
        assert_eq!(config.global.batch_size, 1000);
        assert_eq!(config.queue.default_max_attempts, 3);
        assert_eq!(config.queue.queue_name, "audits");
        assert_eq!(config.global.severity, SeverityThresholds::global());
    }

    #[test]
    fn test_config_partial_json() {
        let json = r#"{ "targeted": { "lock_ttl_secs": 60 }, "global": { "batch_size": 10 } }"#;
        let config: AuditConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.targeted.lock_ttl_secs, 60);
        assert_eq!(config.targeted.auto_correct_below, dec!(0.01)); // default
        assert_eq!(config.global.batch_size, 10);
        assert_eq!(config.realtime.severity, SeverityThresholds::realtime());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "queue": {{ "queue_name": "nightly" }} }}"#).unwrap();

        let config = AuditConfig::from_file(file.path()).unwrap();
        assert_eq!(config.queue.queue_name, "nightly");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = AuditConfig::default();
        config.global.batch_size = 0;
        assert!(matches!(config.validate(), Err(AuditError::Config(_))));
    }

    #[test]
    fn test_duration_helpers() {
        let config = AuditConfig::default();

        assert_eq!(config.targeted.lock_ttl(), Duration::minutes(5));
        assert_eq!(config.realtime.targeted_delay(), Duration::minutes(5));
        assert_eq!(config.periodic.stale_grace(), Duration::hours(1));
        assert_eq!(config.queue.worker_poll(), std::time::Duration::from_secs(1));
    }
}
