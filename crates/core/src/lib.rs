//! LedgerWatch Core - Domain types
//!
//! Types shared by every LedgerWatch crate:
//! - [`ledger`]: wallet and system-wallet transactions, the read-only ledger
//! - [`audit`]: audit findings (`AuditLog`) and their classification enums
//! - [`queue`]: audit jobs waiting for a worker
//! - [`snapshot`]: point-in-time wallet copies and manual correction requests
//! - [`clock`]: injectable time source

pub mod audit;
pub mod clock;
pub mod ledger;
pub mod queue;
pub mod snapshot;

pub use audit::{
    AnomalyScope, AuditLog, AuditLogId, AuditStats, AuditStatus, AuditType, EntityType, Invariant,
    NewAuditLog, Severity,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use ledger::{
    rounding_tolerance, signed_amount, Flow, Nature, SystemTransaction, SystemWallet, Transaction,
    TransactionCompleted, TransactionId, TxStatus, UserId, Wallet, WalletId,
};
pub use queue::{AuditQueueJob, JobId, NewAuditJob, PRIORITY_CRITICAL, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_NORMAL};
pub use snapshot::{AuditSnapshot, CorrectionRequest, CorrectionStatus, NewSnapshot, SnapshotId};
