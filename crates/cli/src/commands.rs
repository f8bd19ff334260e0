//! CLI commands

use std::sync::Arc;

use chrono::Utc;
use ledgerwatch_core::{AuditLog, EntityType, SystemWallet, WalletId};
use ledgerwatch_engine::DrainReport;
use ledgerwatch_store::{AuditQueueRepository, SystemLedgerRepository};
use rust_decimal::Decimal;
use tokio::sync::watch;

use crate::context::AppContext;

/// Create the schema and an empty system wallet if none exists
pub fn init(ctx: &AppContext) -> Result<(), anyhow::Error> {
    if ctx.store.system_wallet()?.is_none() {
        ctx.store.set_system_wallet(&SystemWallet {
            solde_marchand: Decimal::ZERO,
            engagement_users: Decimal::ZERO,
            plateforme_benefices: Decimal::ZERO,
            updated_at: Utc::now(),
        })?;
    }
    println!("✅ Audit database ready at {}", ctx.db_path().display());
    Ok(())
}

/// Run one periodic scheduling sweep
pub fn schedule(ctx: &AppContext) -> Result<(), anyhow::Error> {
    let scheduled = ctx.orchestrator.schedule_periodic_audits()?;
    println!("✅ Scheduled {} periodic audits", scheduled);
    Ok(())
}

fn print_drain(report: &DrainReport) {
    println!(
        "✅ Drained {} jobs: {} completed, {} deferred, {} discarded, {} failed",
        report.processed(),
        report.completed,
        report.deferred,
        report.discarded,
        report.failed
    );
}

/// Process due jobs once, or keep polling until Ctrl-C
pub async fn work(ctx: &AppContext, once: bool) -> Result<(), anyhow::Error> {
    let worker = Arc::new(ctx.worker());

    if once {
        let report = tokio::task::spawn_blocking(move || worker.drain_once()).await??;
        print_drain(&report);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll = ctx.services.config.queue.worker_poll();
    let handle = tokio::spawn(worker.run(poll, shutdown_rx));

    println!("👷 Worker running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    shutdown_tx.send(true)?;
    handle.await??;
    println!("✅ Worker stopped");
    Ok(())
}

/// Run the global audit now
pub fn global(ctx: &AppContext) -> Result<(), anyhow::Error> {
    let report = ctx.orchestrator.execute_global_audit()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.anomalies_created > 0 {
        println!("⚠️  {} new anomalies", report.anomalies_created);
    } else {
        println!("✅ No new anomalies");
    }
    Ok(())
}

pub fn stats(ctx: &AppContext) -> Result<(), anyhow::Error> {
    let stats = ctx.orchestrator.audit_stats()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn print_logs(logs: &[AuditLog]) {
    if logs.is_empty() {
        println!("No audit logs");
        return;
    }
    for log in logs {
        println!(
            "#{:<6} {} {:<9} {:<13} {}:{} {} (diff {})",
            log.id,
            log.created_at.format("%Y-%m-%d %H:%M:%S"),
            log.severity,
            log.status,
            log.entity_type,
            log.entity_id,
            log.invariant_violated,
            log.difference
        );
    }
}

pub fn recent(ctx: &AppContext, limit: usize) -> Result<(), anyhow::Error> {
    print_logs(&ctx.orchestrator.recent_audit_logs(limit)?);
    Ok(())
}

pub fn history(ctx: &AppContext, wallet_id: WalletId) -> Result<(), anyhow::Error> {
    print_logs(&ctx.orchestrator.entity_audit_history(EntityType::Wallet, wallet_id)?);
    Ok(())
}

/// Queue a targeted audit for a wallet
pub fn enqueue(ctx: &AppContext, wallet_id: WalletId, priority: u8) -> Result<(), anyhow::Error> {
    let job_id = ctx.orchestrator.schedule_targeted_audit(wallet_id, priority)?;
    println!("✅ Targeted audit for wallet {} queued (job {})", wallet_id, job_id);
    Ok(())
}

/// Jobs that ran out of attempts
pub fn failed(ctx: &AppContext) -> Result<(), anyhow::Error> {
    let jobs = ctx.store.failed_jobs()?;
    if jobs.is_empty() {
        println!("✅ No failed jobs");
        return Ok(());
    }
    for job in jobs {
        println!(
            "job {} {} {}:{} attempts {}/{} last error: {}",
            job.id,
            job.audit_type,
            job.entity_type,
            job.entity_id,
            job.attempts,
            job.max_attempts,
            job.last_error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
