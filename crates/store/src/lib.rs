//! LedgerWatch Store - Persistence contracts for the audit engine
//!
//! Auditors depend on narrow repository traits instead of a global ORM:
//!
//! ```text
//!  WalletRepository        wallets (read, balance write for auto-correction)
//!  LedgerRepository        wallet transactions (read, aggregates)
//!  SystemLedgerRepository  merchant wallet + its transactions (read)
//!  AuditLogRepository      financial_audit_logs   ┐
//!  AuditQueueRepository    audit_queue            ├ owned by the audit engine
//!  SnapshotRepository      audit_snapshots        │
//!  CorrectionRepository    correction_requests    │
//!  LeaseRepository         audit_locks            ┘
//!  TransactionRunner       atomic unit of work
//! ```
//!
//! [`AuditStore`] bundles all of them. Two engines are provided:
//! [`MemoryStore`] and [`SqliteStore`].

pub mod error;
pub mod memory;
pub mod repository;
pub mod sqlite;

pub use error::{StoreError, StoreResult};
pub use memory::{Fault, MemoryStore};
pub use repository::{
    transaction, AuditLogRepository, AuditQueueRepository, AuditStore, CorrectionRepository,
    LeaseRepository, LedgerRepository, LogGrouping, SnapshotRepository, SystemLedgerRepository,
    TransactionRunner, WalletActivity, WalletRepository,
};
pub use sqlite::SqliteStore;
