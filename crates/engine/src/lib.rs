//! LedgerWatch Engine - Financial audit and anomaly detection
//!
//! Layered auditors that keep cached balances honest against the ledger:
//!
//! ```text
//!  transaction committed
//!        │
//!        ▼
//!  AuditOrchestrator ──► RealtimeAuditor (sync, never fails the caller)
//!        │                     │ large amount / negative balance
//!        │                     ▼
//!        │               audit_queue ◄── PeriodicAuditor::schedule (risk-weighted)
//!        │                     │
//!        │                     ▼
//!        │               QueueWorker ──► TargetedAuditor  (replay, auto-correct or escalate)
//!        │                           ──► PeriodicAuditor  (snapshot + trends)
//!        │                           ──► GlobalAuditor    (system-wide equations)
//!        ▼
//!  financial_audit_logs ──► NotificationRouter ──► auditors
//! ```
//!
//! Every finding is fingerprinted on its stable attributes so repeated
//! detections of the same condition produce one log.

pub mod anomaly;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod fingerprint;
pub mod global;
pub mod lock;
pub mod notify;
pub mod orchestrator;
pub mod periodic;
pub mod realtime;
pub mod risk;
pub mod severity;
pub mod targeted;
pub mod trend;
pub mod worker;

pub use anomaly::{Anomaly, AnomalyRecorder, Recorded};
pub use cache::{Cache, MemoryCache, StoreCache};
pub use config::{
    AuditConfig, GlobalConfig, PeriodicConfig, QueueConfig, RealtimeConfig, TargetedConfig,
};
pub use context::AuditServices;
pub use error::{AuditError, AuditResult};
pub use fingerprint::fingerprint;
pub use global::{
    default_detectors, AbnormalGrowthDetector, DormantFundsDetector, GlobalAuditReport,
    GlobalAuditor, PatternContext, PatternDetector, RiskConcentrationDetector,
};
pub use lock::{EntityLock, LockGuard};
pub use notify::{
    AnomalyNotification, MemoryNotifier, NotificationRouter, Notifier, NotifyError, RoleDirectory,
    StaticDirectory, TracingNotifier,
};
pub use orchestrator::AuditOrchestrator;
pub use periodic::{PeriodicAuditor, PeriodicOutcome, ScheduleReport};
pub use realtime::{RealtimeAuditor, RealtimeReport};
pub use risk::{assess, audit_frequency, risk_score, RiskAssessment, RiskInputs, RiskLevel};
pub use severity::{classify, SeverityThresholds};
pub use targeted::{
    replay, Finding, LedgerReplay, ReconciliationReport, Resolution, TargetedAuditor,
    TargetedOutcome, TrailPoint,
};
pub use trend::{analyze, trend_anomalies, TrendDirection, TrendReport};
pub use worker::{DrainReport, JobOutcome, QueueWorker};
