//! SQLite storage engine
//!
//! Money is stored as TEXT and summed in Rust; SQLite's SUM would coerce
//! decimals to REAL. Timestamps are fixed-width RFC 3339 strings so they
//! order lexicographically.

use std::cell::Cell;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::ReentrantMutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde_json::{Map, Value};

use ledgerwatch_core::{
    signed_amount, AuditLog, AuditLogId, AuditQueueJob, AuditSnapshot, AuditStatus, AuditType,
    CorrectionRequest, CorrectionStatus, EntityType, Flow, JobId, Nature, NewAuditJob,
    NewAuditLog, NewSnapshot, SystemTransaction, SystemWallet, Transaction, Wallet, WalletId,
};

use crate::error::{StoreError, StoreResult};
use crate::repository::*;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS wallets (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    balance TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY,
    wallet_id INTEGER NOT NULL,
    amount TEXT NOT NULL,
    flow TEXT NOT NULL,
    nature TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_transactions_wallet ON transactions(wallet_id, created_at);
CREATE TABLE IF NOT EXISTS system_wallet (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    solde_marchand TEXT NOT NULL,
    engagement_users TEXT NOT NULL,
    plateforme_benefices TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS system_transactions (
    id INTEGER PRIMARY KEY,
    amount TEXT NOT NULL,
    flow TEXT NOT NULL,
    nature TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS financial_audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    audit_type TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    invariant_violated TEXT NOT NULL,
    expected_value TEXT NOT NULL,
    actual_value TEXT NOT NULL,
    difference TEXT NOT NULL,
    severity TEXT NOT NULL,
    description TEXT NOT NULL,
    status TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL,
    processed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_audit_logs_fingerprint ON financial_audit_logs(fingerprint);
CREATE INDEX IF NOT EXISTS idx_audit_logs_entity ON financial_audit_logs(entity_type, entity_id);
CREATE TABLE IF NOT EXISTS audit_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_name TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    audit_type TEXT NOT NULL,
    priority INTEGER NOT NULL,
    scheduled_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    reserved_until TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_queue_due ON audit_queue(queue_name, priority, scheduled_at);
CREATE TABLE IF NOT EXISTS audit_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_id INTEGER NOT NULL,
    balance TEXT NOT NULL,
    transaction_count INTEGER NOT NULL,
    snapshot_date TEXT NOT NULL,
    audit_type TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_snapshots_wallet ON audit_snapshots(wallet_id, snapshot_date);
CREATE TABLE IF NOT EXISTS correction_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    audit_log_id INTEGER NOT NULL,
    wallet_id INTEGER NOT NULL,
    current_balance TEXT NOT NULL,
    ledger_balance TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS audit_locks (
    key TEXT PRIMARY KEY,
    expires_at TEXT NOT NULL
);
";

const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

const LOG_COLUMNS: &str = "id, audit_type, entity_type, entity_id, invariant_violated, \
    expected_value, actual_value, difference, severity, description, status, fingerprint, \
    metadata, created_at, processed_at";

const JOB_COLUMNS: &str = "id, queue_name, entity_type, entity_id, audit_type, priority, \
    scheduled_at, attempts, max_attempts, reserved_until, last_error, created_at";

const SNAPSHOT_COLUMNS: &str =
    "id, wallet_id, balance, transaction_count, snapshot_date, audit_type";

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a TEXT column through `FromStr`
fn text<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_text<T>(row: &Row, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

fn wallet_from_row(row: &Row) -> rusqlite::Result<Wallet> {
    Ok(Wallet {
        id: row.get(0)?,
        user_id: row.get(1)?,
        balance: text(row, 2)?,
        updated_at: text(row, 3)?,
    })
}

fn transaction_from_row(row: &Row) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        wallet_id: row.get(1)?,
        amount: text(row, 2)?,
        flow: text(row, 3)?,
        nature: text(row, 4)?,
        status: text(row, 5)?,
        created_at: text(row, 6)?,
    })
}

fn log_from_row(row: &Row) -> rusqlite::Result<AuditLog> {
    let metadata: String = row.get(12)?;
    let metadata: Map<String, Value> = serde_json::from_str(&metadata)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(12, Type::Text, Box::new(e)))?;
    Ok(AuditLog {
        id: row.get(0)?,
        audit_type: text(row, 1)?,
        entity_type: text(row, 2)?,
        entity_id: row.get(3)?,
        invariant_violated: row.get(4)?,
        expected_value: text(row, 5)?,
        actual_value: text(row, 6)?,
        difference: text(row, 7)?,
        severity: text(row, 8)?,
        description: row.get(9)?,
        status: text(row, 10)?,
        fingerprint: row.get(11)?,
        metadata,
        created_at: text(row, 13)?,
        processed_at: optional_text(row, 14)?,
    })
}

fn job_from_row(row: &Row) -> rusqlite::Result<AuditQueueJob> {
    Ok(AuditQueueJob {
        id: row.get(0)?,
        queue_name: row.get(1)?,
        entity_type: text(row, 2)?,
        entity_id: row.get(3)?,
        audit_type: text(row, 4)?,
        priority: row.get(5)?,
        scheduled_at: text(row, 6)?,
        attempts: row.get(7)?,
        max_attempts: row.get(8)?,
        reserved_until: optional_text(row, 9)?,
        last_error: row.get(10)?,
        created_at: text(row, 11)?,
    })
}

fn snapshot_from_row(row: &Row) -> rusqlite::Result<AuditSnapshot> {
    Ok(AuditSnapshot {
        id: row.get(0)?,
        wallet_id: row.get(1)?,
        balance: text(row, 2)?,
        transaction_count: row.get::<_, i64>(3)? as u64,
        snapshot_date: text(row, 4)?,
        audit_type: text(row, 5)?,
    })
}

fn correction_from_row(row: &Row) -> rusqlite::Result<CorrectionRequest> {
    Ok(CorrectionRequest {
        id: row.get(0)?,
        audit_log_id: row.get(1)?,
        wallet_id: row.get(2)?,
        current_balance: text(row, 3)?,
        ledger_balance: text(row, 4)?,
        status: text(row, 5)?,
        created_at: text(row, 6)?,
    })
}

fn signed_sum(rows: Vec<(Decimal, Flow)>) -> Decimal {
    rows.into_iter()
        .map(|(amount, flow)| signed_amount(amount, flow))
        .sum()
}

struct Inner {
    conn: Connection,
    depth: Cell<u32>,
}

/// SQLite-backed [`AuditStore`](crate::AuditStore)
pub struct SqliteStore {
    inner: ReentrantMutex<Inner>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory database (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        // other worker processes may hold the write lock briefly
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            inner: ReentrantMutex::new(Inner {
                conn,
                depth: Cell::new(0),
            }),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> StoreResult<T> {
        let guard = self.inner.lock();
        Ok(f(&guard.conn)?)
    }

    // === Ledger seeding (owned by the business layer in production) ===

    pub fn insert_wallet(&self, wallet: &Wallet) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO wallets (id, user_id, balance, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    wallet.id,
                    wallet.user_id,
                    wallet.balance.to_string(),
                    ts(wallet.updated_at)
                ],
            )
        })?;
        Ok(())
    }

    pub fn insert_transaction(&self, tx: &Transaction) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO transactions (id, wallet_id, amount, flow, nature, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    tx.id,
                    tx.wallet_id,
                    tx.amount.to_string(),
                    tx.flow.as_ref(),
                    tx.nature.as_ref(),
                    tx.status.as_ref(),
                    ts(tx.created_at)
                ],
            )
        })?;
        Ok(())
    }

    pub fn set_system_wallet(&self, system: &SystemWallet) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO system_wallet
                 (id, solde_marchand, engagement_users, plateforme_benefices, updated_at)
                 VALUES (1, ?1, ?2, ?3, ?4)",
                params![
                    system.solde_marchand.to_string(),
                    system.engagement_users.to_string(),
                    system.plateforme_benefices.to_string(),
                    ts(system.updated_at)
                ],
            )
        })?;
        Ok(())
    }

    pub fn insert_system_transaction(&self, tx: &SystemTransaction) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO system_transactions (id, amount, flow, nature, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    tx.id,
                    tx.amount.to_string(),
                    tx.flow.as_ref(),
                    tx.nature.as_ref(),
                    tx.status.as_ref(),
                    ts(tx.created_at)
                ],
            )
        })?;
        Ok(())
    }
}

impl WalletRepository for SqliteStore {
    fn wallet(&self, id: WalletId) -> StoreResult<Option<Wallet>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_id, balance, updated_at FROM wallets WHERE id = ?1",
                params![id],
                wallet_from_row,
            )
            .optional()
        })
    }

    fn wallets_page(&self, after: Option<WalletId>, limit: usize) -> StoreResult<Vec<Wallet>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, balance, updated_at FROM wallets
                 WHERE ?1 IS NULL OR id > ?1 ORDER BY id LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![after, limit as i64], wallet_from_row)?;
            rows.collect()
        })
    }

    fn active_wallets(&self, since: DateTime<Utc>) -> StoreResult<Vec<Wallet>> {
        let rows: Vec<(Wallet, bool)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT w.id, w.user_id, w.balance, w.updated_at,
                        EXISTS (SELECT 1 FROM transactions t
                                WHERE t.wallet_id = w.id AND t.status = 'completed'
                                  AND t.created_at >= ?1)
                 FROM wallets w ORDER BY w.id",
            )?;
            let rows = stmt.query_map(params![ts(since)], |row| {
                Ok((wallet_from_row(row)?, row.get::<_, bool>(4)?))
            })?;
            rows.collect()
        })?;
        Ok(rows
            .into_iter()
            .filter(|(wallet, recent)| *recent || !wallet.balance.is_zero())
            .map(|(wallet, _)| wallet)
            .collect())
    }

    fn total_wallet_balance(&self) -> StoreResult<Decimal> {
        let balances: Vec<Decimal> = self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT balance FROM wallets")?;
            let rows = stmt.query_map([], |row| text::<Decimal>(row, 0))?;
            rows.collect()
        })?;
        Ok(balances.into_iter().sum())
    }

    fn set_wallet_balance(
        &self,
        id: WalletId,
        balance: Decimal,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let rows = self.with_conn(|conn| {
            conn.execute(
                "UPDATE wallets SET balance = ?1, updated_at = ?2 WHERE id = ?3",
                params![balance.to_string(), ts(at), id],
            )
        })?;
        if rows == 0 {
            return Err(StoreError::not_found("Wallet", id));
        }
        Ok(())
    }
}

impl LedgerRepository for SqliteStore {
    fn wallet_transactions(&self, wallet_id: WalletId) -> StoreResult<Vec<Transaction>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, wallet_id, amount, flow, nature, status, created_at
                 FROM transactions WHERE wallet_id = ?1 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map(params![wallet_id], transaction_from_row)?;
            rows.collect()
        })
    }

    fn completed_internal_sum(&self, wallet_id: WalletId) -> StoreResult<Decimal> {
        let rows: Vec<(Decimal, Flow)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT amount, flow FROM transactions
                 WHERE wallet_id = ?1 AND status = 'completed' AND nature = 'internal'",
            )?;
            let rows = stmt.query_map(params![wallet_id], |row| {
                Ok((text::<Decimal>(row, 0)?, text::<Flow>(row, 1)?))
            })?;
            rows.collect()
        })?;
        Ok(signed_sum(rows))
    }

    fn completed_internal_count(&self, wallet_id: WalletId) -> StoreResult<u64> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM transactions
                 WHERE wallet_id = ?1 AND status = 'completed' AND nature = 'internal'",
                params![wallet_id],
                |row| row.get(0),
            )
        })?;
        Ok(count as u64)
    }

    fn wallet_activity(
        &self,
        wallet_id: WalletId,
        since: DateTime<Utc>,
    ) -> StoreResult<WalletActivity> {
        let rows: Vec<(Decimal, DateTime<Utc>)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT amount, created_at FROM transactions
                 WHERE wallet_id = ?1 AND status = 'completed' AND created_at >= ?2",
            )?;
            let rows = stmt.query_map(params![wallet_id, ts(since)], |row| {
                Ok((text::<Decimal>(row, 0)?, text::<DateTime<Utc>>(row, 1)?))
            })?;
            rows.collect()
        })?;
        Ok(rows
            .into_iter()
            .fold(WalletActivity::default(), |mut acc, (amount, at)| {
                acc.transaction_count += 1;
                acc.volume += amount.abs();
                acc.last_transaction_at = acc.last_transaction_at.max(Some(at));
                acc
            }))
    }

    fn net_internal_wallet_flow(&self) -> StoreResult<Decimal> {
        let rows: Vec<(Decimal, Flow)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT amount, flow FROM transactions
                 WHERE status = 'completed' AND nature = 'internal'",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((text::<Decimal>(row, 0)?, text::<Flow>(row, 1)?))
            })?;
            rows.collect()
        })?;
        Ok(signed_sum(rows))
    }
}

impl SystemLedgerRepository for SqliteStore {
    fn system_wallet(&self) -> StoreResult<Option<SystemWallet>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT solde_marchand, engagement_users, plateforme_benefices, updated_at
                 FROM system_wallet WHERE id = 1",
                [],
                |row| {
                    Ok(SystemWallet {
                        solde_marchand: text(row, 0)?,
                        engagement_users: text(row, 1)?,
                        plateforme_benefices: text(row, 2)?,
                        updated_at: text(row, 3)?,
                    })
                },
            )
            .optional()
        })
    }

    fn system_net_flow(&self, nature: Option<Nature>) -> StoreResult<Decimal> {
        let rows: Vec<(Decimal, Flow, Nature)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT amount, flow, nature FROM system_transactions WHERE status = 'completed'",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    text::<Decimal>(row, 0)?,
                    text::<Flow>(row, 1)?,
                    text::<Nature>(row, 2)?,
                ))
            })?;
            rows.collect()
        })?;
        Ok(signed_sum(
            rows.into_iter()
                .filter(|(_, _, n)| nature.map_or(true, |wanted| *n == wanted))
                .map(|(amount, flow, _)| (amount, flow))
                .collect(),
        ))
    }
}

impl AuditLogRepository for SqliteStore {
    fn insert_audit_log(&self, log: NewAuditLog, at: DateTime<Utc>) -> StoreResult<AuditLog> {
        let metadata = serde_json::to_string(&log.metadata)?;
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO financial_audit_logs
                 (audit_type, entity_type, entity_id, invariant_violated, expected_value,
                  actual_value, difference, severity, description, status, fingerprint,
                  metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    log.audit_type.as_ref(),
                    log.entity_type.as_ref(),
                    log.entity_id,
                    log.invariant_violated,
                    log.expected_value.to_string(),
                    log.actual_value.to_string(),
                    log.difference.to_string(),
                    log.severity.as_ref(),
                    log.description,
                    log.status.as_ref(),
                    log.fingerprint,
                    metadata,
                    ts(at)
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        Ok(log.into_log(id, at))
    }

    fn audit_log(&self, id: AuditLogId) -> StoreResult<Option<AuditLog>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM financial_audit_logs WHERE id = ?1", LOG_COLUMNS),
                params![id],
                log_from_row,
            )
            .optional()
        })
    }

    fn find_by_fingerprint(&self, fingerprint: &str) -> StoreResult<Option<AuditLog>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM financial_audit_logs WHERE fingerprint = ?1 ORDER BY id LIMIT 1",
                    LOG_COLUMNS
                ),
                params![fingerprint],
                log_from_row,
            )
            .optional()
        })
    }

    fn update_audit_status(
        &self,
        id: AuditLogId,
        status: AuditStatus,
        processed_at: Option<DateTime<Utc>>,
        metadata: Option<Map<String, Value>>,
    ) -> StoreResult<()> {
        let metadata = metadata.map(|m| serde_json::to_string(&m)).transpose()?;
        let rows = self.with_conn(|conn| {
            conn.execute(
                "UPDATE financial_audit_logs
                 SET status = ?1,
                     processed_at = COALESCE(?2, processed_at),
                     metadata = COALESCE(?3, metadata)
                 WHERE id = ?4",
                params![status.as_ref(), processed_at.map(ts), metadata, id],
            )
        })?;
        if rows == 0 {
            return Err(StoreError::not_found("AuditLog", id));
        }
        Ok(())
    }

    fn recent_audit_logs(&self, limit: usize) -> StoreResult<Vec<AuditLog>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM financial_audit_logs ORDER BY created_at DESC, id DESC LIMIT ?1",
                LOG_COLUMNS
            ))?;
            let rows = stmt.query_map(params![limit as i64], log_from_row)?;
            rows.collect()
        })
    }

    fn entity_audit_logs(
        &self,
        entity_type: EntityType,
        entity_id: i64,
    ) -> StoreResult<Vec<AuditLog>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM financial_audit_logs
                 WHERE entity_type = ?1 AND entity_id = ?2
                 ORDER BY created_at DESC, id DESC",
                LOG_COLUMNS
            ))?;
            let rows = stmt.query_map(params![entity_type.as_ref(), entity_id], log_from_row)?;
            rows.collect()
        })
    }

    fn count_unresolved(&self, entity_type: EntityType, entity_id: i64) -> StoreResult<u64> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM financial_audit_logs
                 WHERE entity_type = ?1 AND entity_id = ?2 AND status != 'resolved'",
                params![entity_type.as_ref(), entity_id],
                |row| row.get(0),
            )
        })?;
        Ok(count as u64)
    }

    fn count_audit_logs_by(&self, grouping: LogGrouping) -> StoreResult<Vec<(String, u64)>> {
        let column = grouping.column();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {col}, COUNT(*) FROM financial_audit_logs GROUP BY {col} ORDER BY {col}",
                col = column
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            rows.collect()
        })
    }
}

impl AuditQueueRepository for SqliteStore {
    fn enqueue_unique(
        &self,
        job: NewAuditJob,
        at: DateTime<Utc>,
    ) -> StoreResult<(AuditQueueJob, bool)> {
        // the check and the insert share one write lock across processes
        transaction(self, || {
            if let Some(existing) =
                self.outstanding_job(job.entity_type, job.entity_id, job.audit_type)?
            {
                return Ok((existing, false));
            }
            let id = self.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO audit_queue
                     (queue_name, entity_type, entity_id, audit_type, priority, scheduled_at,
                      attempts, max_attempts, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)",
                    params![
                        job.queue_name,
                        job.entity_type.as_ref(),
                        job.entity_id,
                        job.audit_type.as_ref(),
                        job.priority,
                        ts(job.scheduled_at),
                        job.max_attempts,
                        ts(at)
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })?;
            Ok((job.into_job(id, at), true))
        })
    }

    fn job(&self, id: JobId) -> StoreResult<Option<AuditQueueJob>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM audit_queue WHERE id = ?1", JOB_COLUMNS),
                params![id],
                job_from_row,
            )
            .optional()
        })
    }

    fn outstanding_job(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        audit_type: AuditType,
    ) -> StoreResult<Option<AuditQueueJob>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM audit_queue
                     WHERE entity_type = ?1 AND entity_id = ?2 AND audit_type = ?3
                       AND attempts < max_attempts
                     ORDER BY id LIMIT 1",
                    JOB_COLUMNS
                ),
                params![entity_type.as_ref(), entity_id, audit_type.as_ref()],
                job_from_row,
            )
            .optional()
        })
    }

    fn claim_due(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<Option<AuditQueueJob>> {
        transaction(self, || {
            let next = self.with_conn(|conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM audit_queue
                         WHERE queue_name = ?1 AND scheduled_at <= ?2
                           AND attempts < max_attempts
                           AND (reserved_until IS NULL OR reserved_until <= ?2)
                         ORDER BY priority, scheduled_at, id LIMIT 1",
                        JOB_COLUMNS
                    ),
                    params![queue_name, ts(now)],
                    job_from_row,
                )
                .optional()
            })?;

            let Some(mut job) = next else {
                return Ok(None);
            };
            let until = now + lease;
            self.with_conn(|conn| {
                conn.execute(
                    "UPDATE audit_queue SET reserved_until = ?1 WHERE id = ?2",
                    params![ts(until), job.id],
                )
            })?;
            job.reserved_until = Some(until);
            Ok(Some(job))
        })
    }

    fn complete_job(&self, id: JobId) -> StoreResult<()> {
        let rows = self.with_conn(|conn| {
            conn.execute("DELETE FROM audit_queue WHERE id = ?1", params![id])
        })?;
        if rows == 0 {
            return Err(StoreError::not_found("AuditQueueJob", id));
        }
        Ok(())
    }

    fn defer_job(&self, id: JobId, until: DateTime<Utc>) -> StoreResult<()> {
        let rows = self.with_conn(|conn| {
            conn.execute(
                "UPDATE audit_queue SET reserved_until = NULL, scheduled_at = ?1 WHERE id = ?2",
                params![ts(until), id],
            )
        })?;
        if rows == 0 {
            return Err(StoreError::not_found("AuditQueueJob", id));
        }
        Ok(())
    }

    fn record_job_failure(
        &self,
        id: JobId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> StoreResult<AuditQueueJob> {
        let rows = self.with_conn(|conn| {
            conn.execute(
                "UPDATE audit_queue
                 SET attempts = attempts + 1, last_error = ?1,
                     reserved_until = NULL, scheduled_at = ?2
                 WHERE id = ?3",
                params![error, ts(retry_at), id],
            )
        })?;
        if rows == 0 {
            return Err(StoreError::not_found("AuditQueueJob", id));
        }
        self.job(id)?
            .ok_or_else(|| StoreError::not_found("AuditQueueJob", id))
    }

    fn queue_depth(&self) -> StoreResult<u64> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM audit_queue WHERE attempts < max_attempts",
                [],
                |row| row.get(0),
            )
        })?;
        Ok(count as u64)
    }

    fn failed_jobs(&self) -> StoreResult<Vec<AuditQueueJob>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM audit_queue WHERE attempts >= max_attempts ORDER BY id",
                JOB_COLUMNS
            ))?;
            let rows = stmt.query_map([], job_from_row)?;
            rows.collect()
        })
    }
}

impl SnapshotRepository for SqliteStore {
    fn insert_snapshot(&self, snapshot: NewSnapshot) -> StoreResult<AuditSnapshot> {
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_snapshots
                 (wallet_id, balance, transaction_count, snapshot_date, audit_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    snapshot.wallet_id,
                    snapshot.balance.to_string(),
                    snapshot.transaction_count as i64,
                    ts(snapshot.snapshot_date),
                    snapshot.audit_type.as_ref()
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        Ok(snapshot.into_snapshot(id))
    }

    fn latest_snapshot(
        &self,
        wallet_id: WalletId,
        audit_type: Option<AuditType>,
    ) -> StoreResult<Option<AuditSnapshot>> {
        let audit_type = audit_type.map(|t| t.as_ref().to_string());
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM audit_snapshots
                     WHERE wallet_id = ?1 AND (?2 IS NULL OR audit_type = ?2)
                     ORDER BY snapshot_date DESC, id DESC LIMIT 1",
                    SNAPSHOT_COLUMNS
                ),
                params![wallet_id, audit_type],
                snapshot_from_row,
            )
            .optional()
        })
    }

    fn snapshots_since(
        &self,
        wallet_id: WalletId,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<AuditSnapshot>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM audit_snapshots
                 WHERE wallet_id = ?1 AND snapshot_date >= ?2
                 ORDER BY snapshot_date, id",
                SNAPSHOT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![wallet_id, ts(since)], snapshot_from_row)?;
            rows.collect()
        })
    }
}

impl CorrectionRepository for SqliteStore {
    fn insert_correction_request(
        &self,
        audit_log_id: AuditLogId,
        wallet_id: WalletId,
        current_balance: Decimal,
        ledger_balance: Decimal,
        at: DateTime<Utc>,
    ) -> StoreResult<CorrectionRequest> {
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO correction_requests
                 (audit_log_id, wallet_id, current_balance, ledger_balance, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    audit_log_id,
                    wallet_id,
                    current_balance.to_string(),
                    ledger_balance.to_string(),
                    CorrectionStatus::Open.as_ref(),
                    ts(at)
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        Ok(CorrectionRequest {
            id,
            audit_log_id,
            wallet_id,
            current_balance,
            ledger_balance,
            status: CorrectionStatus::Open,
            created_at: at,
        })
    }

    fn open_correction_requests(&self) -> StoreResult<Vec<CorrectionRequest>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, audit_log_id, wallet_id, current_balance, ledger_balance, status,
                        created_at
                 FROM correction_requests WHERE status = 'open' ORDER BY id",
            )?;
            let rows = stmt.query_map([], correction_from_row)?;
            rows.collect()
        })
    }
}

impl TransactionRunner for SqliteStore {
    fn run_in_transaction(&self, work: &mut dyn FnMut() -> StoreResult<()>) -> StoreResult<()> {
        let guard = self.inner.lock();
        if guard.depth.get() > 0 {
            return work();
        }

        guard.conn.execute_batch("BEGIN IMMEDIATE")?;
        guard.depth.set(1);
        let result = work();
        guard.depth.set(0);

        let result = result.and_then(|()| Ok(guard.conn.execute_batch("COMMIT")?));
        if result.is_err() && !guard.conn.is_autocommit() {
            // also reached when COMMIT itself fails and leaves the transaction open
            if let Err(rollback) = guard.conn.execute_batch("ROLLBACK") {
                tracing::error!(error = %rollback, "SQLite rollback failed");
            }
        }
        result
    }
}

impl LeaseRepository for SqliteStore {
    fn acquire_lease(
        &self,
        key: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let changed = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_locks (key, expires_at) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at
                 WHERE audit_locks.expires_at <= ?3",
                params![key, ts(expires_at), ts(now)],
            )
        })?;
        Ok(changed == 1)
    }

    fn renew_lease(&self, key: &str, expires_at: DateTime<Utc>) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_locks (key, expires_at) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at",
                params![key, ts(expires_at)],
            )
        })?;
        Ok(())
    }

    fn lease_active(&self, key: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM audit_locks WHERE key = ?1 AND expires_at > ?2)",
                params![key, ts(now)],
                |row| row.get(0),
            )
        })
    }

    fn release_lease(&self, key: &str) -> StoreResult<()> {
        self.with_conn(|conn| conn.execute("DELETE FROM audit_locks WHERE key = ?1", params![key]))?;
        Ok(())
    }
}
