//! Anomaly notification fan-out
//!
//! ```text
//! AuditLog ──► NotificationRouter ──► RoleDirectory (who is an auditor?)
//!                     │
//!                     └──► Notifier::notify(user, AnomalyNotification)
//! ```
//!
//! Delivery failures are logged per recipient and never abort an audit.

use std::collections::BTreeSet;
use std::sync::Arc;

use ledgerwatch_core::{AuditLog, AuditLogId, Severity, UserId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Payload sent to each auditor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyNotification {
    pub audit_log_id: AuditLogId,
    pub severity: Severity,
    pub description: String,
}

impl From<&AuditLog> for AnomalyNotification {
    fn from(log: &AuditLog) -> Self {
        Self {
            audit_log_id: log.id,
            severity: log.severity,
            description: log.description.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Delivery to user {user} failed: {reason}")]
    Delivery { user: UserId, reason: String },
}

/// Delivery transport
pub trait Notifier: Send + Sync {
    fn notify(&self, user: UserId, notification: &AnomalyNotification) -> Result<(), NotifyError>;
}

/// Answers "who may receive audit alerts"
pub trait RoleDirectory: Send + Sync {
    /// Users to consider for delivery
    fn users(&self) -> Vec<UserId>;

    /// Holds the auditor or super-admin capability
    fn is_auditor(&self, user: UserId) -> bool;
}

/// Fixed set of auditors
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    auditors: BTreeSet<UserId>,
}

impl StaticDirectory {
    pub fn new(auditors: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            auditors: auditors.into_iter().collect(),
        }
    }
}

impl RoleDirectory for StaticDirectory {
    fn users(&self) -> Vec<UserId> {
        self.auditors.iter().copied().collect()
    }

    fn is_auditor(&self, user: UserId) -> bool {
        self.auditors.contains(&user)
    }
}

/// Delivers notifications as log lines
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, user: UserId, notification: &AnomalyNotification) -> Result<(), NotifyError> {
        tracing::warn!(
            user_id = user,
            audit_log_id = notification.audit_log_id,
            severity = %notification.severity,
            "Audit anomaly: {}",
            notification.description
        );
        Ok(())
    }
}

/// Records deliveries (for testing)
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<(UserId, AnomalyNotification)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(UserId, AnomalyNotification)> {
        self.sent.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, user: UserId, notification: &AnomalyNotification) -> Result<(), NotifyError> {
        self.sent.lock().push((user, notification.clone()));
        Ok(())
    }
}

/// Sends each new audit log to every auditor
#[derive(Clone)]
pub struct NotificationRouter {
    directory: Arc<dyn RoleDirectory>,
    notifier: Arc<dyn Notifier>,
}

impl NotificationRouter {
    pub fn new(directory: Arc<dyn RoleDirectory>, notifier: Arc<dyn Notifier>) -> Self {
        Self { directory, notifier }
    }

    /// Log-only router with nobody to notify
    pub fn silent() -> Self {
        Self::new(Arc::new(StaticDirectory::default()), Arc::new(TracingNotifier))
    }

    /// Returns the number of successful deliveries
    pub fn route(&self, log: &AuditLog) -> usize {
        let notification = AnomalyNotification::from(log);
        let mut delivered = 0;

        for user in self.directory.users() {
            if !self.directory.is_auditor(user) {
                continue;
            }
            match self.notifier.notify(user, &notification) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(audit_log_id = log.id, error = %e, "Notification delivery failed");
                }
            }
        }

        delivered
    }
}
