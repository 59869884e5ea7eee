//! Quorum sessions: bounded waiting on several independent workers.
//!
//! A session expects `expected` reports and is satisfied by `quorum` of them.
//! Waiting never blocks past the session deadline; a deadline reached with
//! fewer than `quorum` reports resolves as `degraded` with whatever arrived.

use crate::core::error::CairnError;
use crate::core::runtime::Runtime;
use crate::core::time;
use crate::plugins::scheduler;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumState {
    /// Every expected worker reported.
    Complete,
    /// At least `quorum` reported.
    Quorum,
    Pending,
    /// Deadline passed below quorum.
    Degraded,
}

impl QuorumState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuorumState::Complete => "complete",
            QuorumState::Quorum => "quorum",
            QuorumState::Pending => "pending",
            QuorumState::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuorumSession {
    pub id: String,
    pub label: String,
    pub expected: u32,
    pub quorum: u32,
    pub timeout_secs: u64,
    pub opened_at: String,
    pub resolved: bool,
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuorumReport {
    pub worker: String,
    pub payload: serde_json::Value,
    pub reported_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuorumStatus {
    pub session: QuorumSession,
    pub state: QuorumState,
    pub received: usize,
    pub reports: Vec<QuorumReport>,
}

/// Evaluate a session at `now` (epoch seconds).
pub fn evaluate(
    expected: u32,
    quorum: u32,
    timeout_secs: u64,
    opened_at: i64,
    received: usize,
    now: i64,
) -> QuorumState {
    if received >= expected as usize {
        QuorumState::Complete
    } else if received >= quorum as usize {
        QuorumState::Quorum
    } else if now >= opened_at.saturating_add(i64::try_from(timeout_secs).unwrap_or(i64::MAX)) {
        QuorumState::Degraded
    } else {
        QuorumState::Pending
    }
}

fn load_session(conn: &Connection, id: &str) -> Result<QuorumSession, CairnError> {
    conn.query_row(
        "SELECT id, label, expected, quorum, timeout_secs, opened_at, status, outcome
         FROM quorum_sessions WHERE id = ?1",
        params![id],
        |row| {
            let status: String = row.get(6)?;
            let expected: i64 = row.get(2)?;
            let quorum: i64 = row.get(3)?;
            let timeout: i64 = row.get(4)?;
            Ok(QuorumSession {
                id: row.get(0)?,
                label: row.get(1)?,
                expected: expected as u32,
                quorum: quorum as u32,
                timeout_secs: timeout as u64,
                opened_at: row.get(5)?,
                resolved: status == "resolved",
                outcome: row.get(7)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| CairnError::NotFound(format!("quorum session {} not found", id)))
}

fn load_reports(conn: &Connection, id: &str) -> Result<Vec<QuorumReport>, CairnError> {
    let mut stmt = conn.prepare(
        "SELECT worker, payload, reported_at FROM quorum_reports
         WHERE session_id = ?1 ORDER BY reported_at ASC, worker ASC",
    )?;
    let mut rows = stmt.query(params![id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let worker: String = row.get(0)?;
        let raw: String = row.get(1)?;
        let payload = crate::core::db::decode_json(
            &raw,
            &format!("quorum_reports[{}:{}].payload", id, worker),
        )?;
        out.push(QuorumReport {
            worker,
            payload,
            reported_at: row.get(2)?,
        });
    }
    Ok(out)
}

fn status_in(conn: &Connection, id: &str, now: i64) -> Result<QuorumStatus, CairnError> {
    let session = load_session(conn, id)?;
    let reports = load_reports(conn, id)?;
    let state = match session.outcome.as_deref() {
        Some("complete") if session.resolved => QuorumState::Complete,
        Some("quorum") if session.resolved => QuorumState::Quorum,
        Some("degraded") if session.resolved => QuorumState::Degraded,
        _ => evaluate(
            session.expected,
            session.quorum,
            session.timeout_secs,
            time::parse_epoch_z(&session.opened_at).unwrap_or(now),
            reports.len(),
            now,
        ),
    };
    Ok(QuorumStatus {
        received: reports.len(),
        session,
        state,
        reports,
    })
}

pub fn open(
    rt: &Runtime,
    label: &str,
    expected: u32,
    quorum: u32,
    timeout_secs: u64,
) -> Result<QuorumSession, CairnError> {
    if expected == 0 || quorum == 0 || quorum > expected {
        return Err(CairnError::ValidationError(format!(
            "quorum must satisfy 1 <= quorum <= expected (got quorum {} of {})",
            quorum, expected
        )));
    }
    let timeout = i64::try_from(timeout_secs).map_err(|_| {
        CairnError::ValidationError(format!(
            "quorum timeout must be at most {} seconds (got {})",
            i64::MAX,
            timeout_secs
        ))
    })?;
    let id = time::new_prefixed_id("Q");
    let session = rt
        .broker()
        .with_write(&rt.campaign_db(), "quorum.open", |conn| {
            conn.execute(
                "INSERT INTO quorum_sessions(id, label, expected, quorum, timeout_secs, opened_at, status)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, 'open')",
                params![
                    id,
                    label,
                    i64::from(expected),
                    i64::from(quorum),
                    timeout,
                    time::now_epoch_z()
                ],
            )?;
            scheduler::append_event(
                conn,
                "quorum.open",
                None,
                Some(&id),
                serde_json::json!({ "label": label, "expected": expected, "quorum": quorum }),
            )?;
            load_session(conn, &id)
        })?;
    tracing::info!(session = %session.id, expected, quorum, "quorum session opened");
    Ok(session)
}

pub fn report(
    rt: &Runtime,
    session_id: &str,
    worker: &str,
    payload: serde_json::Value,
) -> Result<QuorumStatus, CairnError> {
    if worker.trim().is_empty() {
        return Err(CairnError::ValidationError(
            "worker name must not be empty".to_string(),
        ));
    }
    rt.broker()
        .with_write(&rt.campaign_db(), "quorum.report", |conn| {
            let session = load_session(conn, session_id)?;
            if session.resolved {
                return Err(CairnError::InvalidTransition {
                    subject: format!("quorum session {}", session_id),
                    from: "resolved".to_string(),
                    to: "report".to_string(),
                });
            }
            let exists = conn
                .query_row(
                    "SELECT 1 FROM quorum_reports WHERE session_id = ?1 AND worker = ?2",
                    params![session_id, worker],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                return Err(CairnError::ValidationError(format!(
                    "worker {} already reported to session {}",
                    worker, session_id
                )));
            }
            conn.execute(
                "INSERT INTO quorum_reports(session_id, worker, payload, reported_at)
                 VALUES(?1, ?2, ?3, ?4)",
                params![
                    session_id,
                    worker,
                    serde_json::to_string(&payload)?,
                    time::now_epoch_z()
                ],
            )?;
            status_in(conn, session_id, time::now_secs())
        })
}

pub fn status(rt: &Runtime, session_id: &str) -> Result<QuorumStatus, CairnError> {
    rt.broker()
        .with_read(&rt.campaign_db(), "quorum.status", |conn| {
            status_in(conn, session_id, time::now_secs())
        })
}

/// Poll until the session is no longer pending, then resolve it.
pub fn wait(rt: &Runtime, session_id: &str, poll_ms: u64) -> Result<QuorumStatus, CairnError> {
    let poll = Duration::from_millis(poll_ms.max(10));
    loop {
        let current = status(rt, session_id)?;
        if current.session.resolved {
            return Ok(current);
        }
        if current.state != QuorumState::Pending {
            return resolve(rt, session_id, current.state);
        }
        thread::sleep(poll);
    }
}

fn resolve(rt: &Runtime, session_id: &str, state: QuorumState) -> Result<QuorumStatus, CairnError> {
    let resolved = rt
        .broker()
        .with_write(&rt.campaign_db(), "quorum.resolve", |conn| {
            conn.execute(
                "UPDATE quorum_sessions SET status = 'resolved', outcome = ?2
                 WHERE id = ?1 AND status = 'open'",
                params![session_id, state.as_str()],
            )?;
            scheduler::append_event(
                conn,
                "quorum.resolve",
                None,
                Some(session_id),
                serde_json::json!({ "outcome": state.as_str() }),
            )?;
            status_in(conn, session_id, time::now_secs())
        })?;
    if resolved.state == QuorumState::Degraded {
        tracing::warn!(
            session = session_id,
            received = resolved.received,
            quorum = resolved.session.quorum,
            "quorum deadline passed; proceeding with partial reports"
        );
    }
    Ok(resolved)
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "quorum",
        "version": "0.4.0",
        "description": "Bounded waiting for independent worker reports",
        "commands": [
            { "name": "open", "parameters": ["label", "expected", "quorum", "timeout_secs"] },
            { "name": "report", "parameters": ["session", "worker", "payload"] },
            { "name": "status", "parameters": ["session"] },
            { "name": "wait", "parameters": ["session", "poll_ms"] }
        ],
        "states": ["pending", "quorum", "complete", "degraded"],
        "storage": ["campaign.db"]
    })
}
