//! Point-in-time wallet snapshots and manual correction requests

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::audit::{AuditLogId, AuditType};
use crate::ledger::WalletId;

pub type SnapshotId = i64;

/// Immutable copy of a wallet's state, taken before any corrective action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSnapshot {
    pub id: SnapshotId,
    pub wallet_id: WalletId,
    pub balance: Decimal,
    pub transaction_count: u64,
    pub snapshot_date: DateTime<Utc>,
    /// Auditor that took the snapshot
    pub audit_type: AuditType,
}

/// Insert payload for an [`AuditSnapshot`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSnapshot {
    pub wallet_id: WalletId,
    pub balance: Decimal,
    pub transaction_count: u64,
    pub snapshot_date: DateTime<Utc>,
    pub audit_type: AuditType,
}

impl NewSnapshot {
    pub fn into_snapshot(self, id: SnapshotId) -> AuditSnapshot {
        AuditSnapshot {
            id,
            wallet_id: self.wallet_id,
            balance: self.balance,
            transaction_count: self.transaction_count,
            snapshot_date: self.snapshot_date,
            audit_type: self.audit_type,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CorrectionStatus {
    Open,
    Closed,
}

/// Manual follow-up for a critical finding that may not be auto-corrected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRequest {
    pub id: i64,
    pub audit_log_id: AuditLogId,
    pub wallet_id: WalletId,
    pub current_balance: Decimal,
    pub ledger_balance: Decimal,
    pub status: CorrectionStatus,
    pub created_at: DateTime<Utc>,
}
