//! The DB broker is the single path for state access.
//!
//! - Writes are serialized per database by an in-process mutex and run inside a
//!   `BEGIN IMMEDIATE` transaction, so concurrent writers in other processes
//!   wait on SQLite's busy timeout instead of interleaving.
//! - Reads open a fresh connection without the mutex; WAL lets them run
//!   alongside a writer.
//! - Every write appends one line to `broker.events.jsonl`.

use crate::core::db;
use crate::core::error;
use crate::core::time;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

/// Write connection busy_timeout in seconds.
const WRITE_BUSY_TIMEOUT_SECS: u64 = 30;
/// Read connection busy_timeout in seconds.
const READ_BUSY_TIMEOUT_SECS: u64 = 15;

pub const AUDIT_LOG_NAME: &str = "broker.events.jsonl";

pub struct DbBroker {
    audit_log_path: PathBuf,
    actor: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub db_id: String,
    pub status: String,
    pub duration_ms: u64,
}

/// Per-database write locks, shared by every broker in the process.
fn write_locks() -> &'static Mutex<FxHashMap<PathBuf, Arc<Mutex<()>>>> {
    static LOCKS: OnceLock<Mutex<FxHashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    LOCKS.get_or_init(|| Mutex::new(FxHashMap::default()))
}

fn write_lock_for(db_path: &Path) -> Result<Arc<Mutex<()>>, error::CairnError> {
    let mut locks = write_locks().lock().map_err(|_| {
        error::CairnError::DatabaseInitializationError("broker lock table poisoned".to_string())
    })?;
    Ok(locks
        .entry(db_path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone())
}

impl DbBroker {
    pub fn new(root: &Path) -> Self {
        Self {
            audit_log_path: root.join(AUDIT_LOG_NAME),
            actor: std::env::var("CAIRN_ACTOR").unwrap_or_else(|_| "cairn".to_string()),
        }
    }

    /// Run `f` inside a serialized write transaction; commits only when `f` succeeds.
    pub fn with_write<F, R>(&self, db_path: &Path, op_name: &str, f: F) -> Result<R, error::CairnError>
    where
        F: FnOnce(&Connection) -> Result<R, error::CairnError>,
    {
        let lock = write_lock_for(db_path)?;
        let _guard = lock.lock().map_err(|_| {
            error::CairnError::DatabaseInitializationError(format!(
                "write lock poisoned for {}",
                db_path.display()
            ))
        })?;

        let started = Instant::now();
        let conn = db::db_connect_with_timeout(&db_path.to_string_lossy(), WRITE_BUSY_TIMEOUT_SECS)?;
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;
        let result = f(&*tx);
        let result = match result {
            Ok(value) => tx.commit().map(|_| value).map_err(error::CairnError::from),
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        };

        let status = if result.is_ok() { "success" } else { "error" };
        self.log_event(op_name, db_path, status, started.elapsed().as_millis() as u64)?;
        if let Err(e) = &result {
            tracing::debug!(op = op_name, error = %e, "write rolled back");
        }
        result
    }

    /// Run `f` against a fresh read connection; no serialization.
    pub fn with_read<F, R>(&self, db_path: &Path, op_name: &str, f: F) -> Result<R, error::CairnError>
    where
        F: FnOnce(&Connection) -> Result<R, error::CairnError>,
    {
        if !db_path.exists() {
            return Err(error::CairnError::NotFound(format!(
                "database {} does not exist. Run `cairn init` first.",
                db_path.display()
            )));
        }
        let conn = db::db_connect_with_timeout(&db_path.to_string_lossy(), READ_BUSY_TIMEOUT_SECS)?;
        tracing::trace!(op = op_name, "read");
        f(&conn)
    }

    fn log_event(
        &self,
        op: &str,
        db_path: &Path,
        status: &str,
        duration_ms: u64,
    ) -> Result<(), error::CairnError> {
        let ev = BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: self.actor.clone(),
            op: op.to_string(),
            db_id: db_path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            status: status.to_string(),
            duration_ms,
        };
        let mut line = serde_json::to_string(&ev)?;
        line.push('\n');

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log_path)
            .map_err(error::CairnError::IoError)?;
        f.write_all(line.as_bytes())
            .map_err(error::CairnError::IoError)?;
        Ok(())
    }

    /// Read the audit log; lines that fail to parse are reported as malformed.
    pub fn read_audit(&self) -> Result<Vec<BrokerEvent>, error::CairnError> {
        if !self.audit_log_path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.audit_log_path)?;
        let mut out = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let ev: BrokerEvent = serde_json::from_str(&line).map_err(|e| {
                error::CairnError::MalformedRecord {
                    location: format!("{}:{}", AUDIT_LOG_NAME, idx + 1),
                    detail: e.to_string(),
                }
            })?;
            out.push(ev);
        }
        Ok(out)
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "broker",
        "version": "0.2.0",
        "description": "Serialized state mutation broker with append-only audit log",
        "commands": [
            { "name": "audit", "description": "Show the mutation audit log" }
        ],
        "storage": [AUDIT_LOG_NAME]
    })
}
