//! Audit queue jobs
//!
//! Jobs are rows in a polling table. A worker reserves a due job for a
//! lease, deletes it on success and counts an attempt on failure. Jobs that
//! reach `max_attempts` stay in the table for manual inspection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditType, EntityType};

pub type JobId = i64;

/// Lower number = higher priority
pub const PRIORITY_CRITICAL: u8 = 1;
pub const PRIORITY_HIGH: u8 = 2;
pub const PRIORITY_NORMAL: u8 = 5;
pub const PRIORITY_LOW: u8 = 8;

/// A queued audit job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditQueueJob {
    pub id: JobId,
    pub queue_name: String,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub audit_type: AuditType,
    pub priority: u8,
    pub scheduled_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Set while a worker holds the job
    pub reserved_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditQueueJob {
    /// Out of retries, left for manual attention
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn is_reserved(&self, now: DateTime<Utc>) -> bool {
        self.reserved_until.map_or(false, |until| until > now)
    }

    /// Eligible to be claimed by a worker at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now && !self.is_exhausted() && !self.is_reserved(now)
    }
}

/// Insert payload for an [`AuditQueueJob`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditJob {
    pub queue_name: String,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub audit_type: AuditType,
    pub priority: u8,
    pub scheduled_at: DateTime<Utc>,
    pub max_attempts: u32,
}

impl NewAuditJob {
    pub fn into_job(self, id: JobId, created_at: DateTime<Utc>) -> AuditQueueJob {
        AuditQueueJob {
            id,
            queue_name: self.queue_name,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            audit_type: self.audit_type,
            priority: self.priority,
            scheduled_at: self.scheduled_at,
            attempts: 0,
            max_attempts: self.max_attempts,
            reserved_until: None,
            last_error: None,
            created_at,
        }
    }
}
