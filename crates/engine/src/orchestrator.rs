//! Audit orchestrator
//!
//! The one entry point the rest of the platform talks to. It wires the
//! auditors to shared services and exposes the read side used by
//! dashboards.

use ledgerwatch_core::{
    AnomalyScope, AuditLog, AuditLogId, AuditStats, AuditStatus, AuditType, CorrectionRequest,
    EntityType, JobId, Nature, NewAuditJob, TransactionCompleted, TxStatus, WalletId,
};
use ledgerwatch_store::{
    AuditLogRepository, AuditQueueRepository, CorrectionRepository, LogGrouping, StoreError,
};
use serde_json::{Map, Value};

use crate::anomaly::{Anomaly, AnomalyRecorder, Recorded};
use crate::context::AuditServices;
use crate::error::AuditResult;
use crate::global::{GlobalAuditReport, GlobalAuditor};
use crate::periodic::PeriodicAuditor;
use crate::realtime::{RealtimeAuditor, RealtimeReport};

pub struct AuditOrchestrator {
    services: AuditServices,
    recorder: AnomalyRecorder,
    realtime: RealtimeAuditor,
    periodic: PeriodicAuditor,
    global: GlobalAuditor,
}

impl AuditOrchestrator {
    pub fn new(services: AuditServices) -> Self {
        Self {
            recorder: AnomalyRecorder::new(services.clone()),
            realtime: RealtimeAuditor::new(services.clone()),
            periodic: PeriodicAuditor::new(services.clone()),
            global: GlobalAuditor::new(services.clone()),
            services,
        }
    }

    /// Use a custom global auditor, e.g. with other pattern detectors
    pub fn with_global_auditor(mut self, global: GlobalAuditor) -> Self {
        self.global = global;
        self
    }

    pub fn services(&self) -> &AuditServices {
        &self.services
    }

    /// Post-commit hook for business transactions
    ///
    /// Only completed internal wallet transactions are audited. Never fails.
    pub fn audit_transaction(&self, event: &TransactionCompleted) -> Option<RealtimeReport> {
        if event.nature != Nature::Internal || event.status != TxStatus::Completed {
            return None;
        }
        Some(self.realtime.audit(event))
    }

    /// Queue a reconciliation of one wallet, due now
    ///
    /// Returns the outstanding job if one is already queued.
    pub fn schedule_targeted_audit(&self, wallet_id: WalletId, priority: u8) -> AuditResult<JobId> {
        let now = self.services.clock.now();
        let queue = &self.services.config.queue;
        let (job, created) = self.services.store.enqueue_unique(
            NewAuditJob {
                queue_name: queue.queue_name.clone(),
                entity_type: EntityType::Wallet,
                entity_id: wallet_id,
                audit_type: AuditType::Batch,
                priority,
                scheduled_at: now,
                max_attempts: queue.default_max_attempts,
            },
            now,
        )?;
        if created {
            tracing::info!(wallet_id, job_id = job.id, priority, "Targeted audit scheduled");
        }
        Ok(job.id)
    }

    pub fn execute_global_audit(&self) -> AuditResult<GlobalAuditReport> {
        self.global.run()
    }

    /// Run a scheduling sweep, returning how many wallet audits were queued
    pub fn schedule_periodic_audits(&self) -> AuditResult<usize> {
        Ok(self.periodic.schedule()?.scheduled)
    }

    pub fn audit_stats(&self) -> AuditResult<AuditStats> {
        let store = &self.services.store;
        let by_status: std::collections::BTreeMap<_, _> =
            store.count_audit_logs_by(LogGrouping::Status)?.into_iter().collect();
        Ok(AuditStats {
            total: by_status.values().sum(),
            by_status,
            by_severity: store.count_audit_logs_by(LogGrouping::Severity)?.into_iter().collect(),
            by_type: store.count_audit_logs_by(LogGrouping::AuditType)?.into_iter().collect(),
            queue_depth: store.queue_depth()?,
            failed_jobs: store.failed_jobs()?.len() as u64,
        })
    }

    pub fn recent_audit_logs(&self, limit: usize) -> AuditResult<Vec<AuditLog>> {
        Ok(self.services.store.recent_audit_logs(limit)?)
    }

    pub fn entity_audit_history(
        &self,
        entity_type: EntityType,
        entity_id: i64,
    ) -> AuditResult<Vec<AuditLog>> {
        Ok(self.services.store.entity_audit_logs(entity_type, entity_id)?)
    }

    /// Record a manually entered anomaly as `pending`
    ///
    /// An anomaly already on file under the same fingerprint returns the
    /// existing log instead of creating a second one.
    pub fn create_audit_log(&self, anomaly: Anomaly, scope: AnomalyScope) -> AuditResult<AuditLog> {
        match self.recorder.record(anomaly, scope, AuditStatus::Pending)? {
            Recorded::Created(log) => {
                self.recorder.notify(&log);
                Ok(log)
            }
            Recorded::Duplicate { fingerprint } => Ok(self
                .services
                .store
                .find_by_fingerprint(&fingerprint)?
                .ok_or_else(|| StoreError::not_found("audit_log", &fingerprint))?),
        }
    }

    /// Move a log through its lifecycle, stamping `processed_at`
    pub fn update_audit_status(
        &self,
        id: AuditLogId,
        status: AuditStatus,
        metadata: Option<Map<String, Value>>,
    ) -> AuditResult<AuditLog> {
        let store = &self.services.store;
        let processed_at = match status {
            AuditStatus::Pending => None,
            _ => Some(self.services.clock.now()),
        };
        store.update_audit_status(id, status, processed_at, metadata)?;
        Ok(store
            .audit_log(id)?
            .ok_or_else(|| StoreError::not_found("audit_log", id))?)
    }

    pub fn open_correction_requests(&self) -> AuditResult<Vec<CorrectionRequest>> {
        Ok(self.services.store.open_correction_requests()?)
    }
}
