//! Audit engine errors
//!
//! Only operational failures live here. Financial anomalies are recorded as
//! audit logs and never surface as `Err`.

use ledgerwatch_store::StoreError;
use thiserror::Error;

/// Errors from the audit engine
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("System wallet is missing")]
    MissingSystemWallet,

    #[error("Unsupported job {job_id}: {reason}")]
    UnsupportedJob { job_id: i64, reason: String },

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result type for audit operations
pub type AuditResult<T> = Result<T, AuditError>;
