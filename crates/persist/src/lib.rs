//! Kairo persistence: SQLite history of finished sync attempts and their results.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use kairo_core::{HookPhase, OperationKind, OperationPhase, OperationResult, ResourceRef, ResultCode};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One finished sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: String,
    pub app: String,
    pub started: i64,
    pub finished: i64,
    pub phase: OperationPhase,
    pub message: String,
    pub results: Vec<OperationResult>,
}

pub trait LedgerStore: Send + Sync {
    fn put_attempt(&self, attempt: &AttemptRecord) -> Result<()>;
    /// Most recent attempts first.
    fn history(&self, app: &str, limit: Option<usize>) -> Result<Vec<AttemptRecord>>;
}

/// SQLite-backed store. Synchronous; attempts are written once when they finish.
pub struct SqliteLedgerStore {
    db: Mutex<rusqlite::Connection>,
    keep: usize,
}

impl SqliteLedgerStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KAIRO_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        Self::init(db)
    }

    pub fn open_in_memory() -> Result<Self> { Self::init(rusqlite::Connection::open_in_memory()?) }

    fn init(db: rusqlite::Connection) -> Result<Self> {
        let started = std::time::Instant::now();
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS attempts (
                id       TEXT PRIMARY KEY,
                app      TEXT NOT NULL,
                started  INTEGER NOT NULL,
                finished INTEGER NOT NULL,
                phase    TEXT NOT NULL,
                message  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attempts_app_started ON attempts(app, started DESC);
            CREATE TABLE IF NOT EXISTS results (
                attempt    TEXT NOT NULL REFERENCES attempts(id) ON DELETE CASCADE,
                seq        INTEGER NOT NULL,
                grp        TEXT NOT NULL,
                kind       TEXT NOT NULL,
                namespace  TEXT,
                name       TEXT NOT NULL,
                operation  TEXT NOT NULL,
                code       TEXT NOT NULL,
                message    TEXT NOT NULL,
                wave       INTEGER NOT NULL,
                hook_phase TEXT,
                tries      INTEGER NOT NULL,
                ts         INTEGER NOT NULL,
                PRIMARY KEY (attempt, seq)
            );",
        )
        .context("creating ledger tables")?;
        db.pragma_update(None, "foreign_keys", "ON").ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db), keep: history_limit() })
    }

    /// Attempts retained per application.
    pub fn with_retention(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("ledger store lock poisoned"))
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn put_attempt(&self, a: &AttemptRecord) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO attempts(id, app, started, finished, phase, message) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (&a.id, &a.app, a.started, a.finished, a.phase.as_str(), &a.message),
        )?;
        tx.execute("DELETE FROM results WHERE attempt = ?1", [&a.id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO results(attempt, seq, grp, kind, namespace, name, operation, code, message, wave, hook_phase, tries, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            for (seq, r) in a.results.iter().enumerate() {
                stmt.execute(rusqlite::params![
                    &a.id,
                    seq as i64,
                    &r.resource.group,
                    &r.resource.kind,
                    &r.resource.namespace,
                    &r.resource.name,
                    r.operation.as_str(),
                    r.code.as_str(),
                    &r.message,
                    r.wave,
                    r.hook_phase.map(|p| p.as_str()),
                    r.attempts,
                    r.ts,
                ])?;
            }
        }
        // Keep the latest N attempts per app
        let dropped = tx.execute(
            "DELETE FROM attempts
             WHERE app = ?1
               AND id NOT IN (
                   SELECT id FROM attempts WHERE app = ?1 ORDER BY started DESC, rowid DESC LIMIT ?2
               )",
            (&a.app, self.keep as i64),
        )?;
        tx.execute("DELETE FROM results WHERE attempt NOT IN (SELECT id FROM attempts)", [])?;
        tx.commit()?;
        debug!(app = %a.app, id = %a.id, results = a.results.len(), dropped, "attempt stored");
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn history(&self, app: &str, limit: Option<usize>) -> Result<Vec<AttemptRecord>> {
        let started = std::time::Instant::now();
        let cap = limit.unwrap_or(self.keep);
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT id, started, finished, phase, message FROM attempts WHERE app = ?1 ORDER BY started DESC, rowid DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query((app, cap as i64))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let phase: String = row.get(3)?;
            out.push(AttemptRecord {
                id: row.get(0)?,
                app: app.to_string(),
                started: row.get(1)?,
                finished: row.get(2)?,
                phase: OperationPhase::from_str(&phase).map_err(|e| anyhow!("stored phase: {}", e))?,
                message: row.get(4)?,
                results: Vec::new(),
            });
        }
        let mut stmt = db.prepare(
            "SELECT grp, kind, namespace, name, operation, code, message, wave, hook_phase, tries, ts
             FROM results WHERE attempt = ?1 ORDER BY seq",
        )?;
        for attempt in out.iter_mut() {
            let mut rows = stmt.query([&attempt.id])?;
            while let Some(row) = rows.next()? {
                let namespace: Option<String> = row.get(2)?;
                let operation: String = row.get(4)?;
                let code: String = row.get(5)?;
                let hook_phase: Option<String> = row.get(8)?;
                attempt.results.push(OperationResult {
                    resource: ResourceRef {
                        group: row.get(0)?,
                        kind: row.get(1)?,
                        namespace,
                        name: row.get(3)?,
                    },
                    operation: OperationKind::from_str(&operation).map_err(|e| anyhow!("stored operation: {}", e))?,
                    code: ResultCode::from_str(&code).map_err(|e| anyhow!("stored code: {}", e))?,
                    message: row.get(6)?,
                    wave: row.get(7)?,
                    hook_phase: hook_phase
                        .map(|p| HookPhase::from_str(&p))
                        .transpose()
                        .map_err(|e| anyhow!("stored hook phase: {}", e))?,
                    attempts: row.get(9)?,
                    ts: row.get(10)?,
                });
            }
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

fn history_limit() -> usize {
    std::env::var("KAIRO_HISTORY_LIMIT").ok().and_then(|s| s.parse::<usize>().ok()).filter(|n| *n > 0).unwrap_or(10)
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".kairo");
        let _ = std::fs::create_dir_all(&p);
        p.push("kairo.db");
        return p.to_string_lossy().to_string();
    }
    "kairo.db".to_string()
}

pub fn now_ts() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}
