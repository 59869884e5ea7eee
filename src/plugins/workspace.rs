//! Workspaces: the execution contract for one dispatched task.
//!
//! A workspace is created when a ready task is dispatched. It snapshots what
//! the worker needs: objective, declared delta, verify command, prior
//! knowledge, and the deliveries of the tasks it depends on. Failures already
//! recorded by sibling workspaces are read at creation time, so a worker
//! started after a sibling blocked sees that failure first.
//!
//! A workspace ends exactly once, as `complete` (scope-checked against the
//! delta) or `blocked`. Blocking is a normal outcome: it records the failure
//! as knowledge and reports whether the campaign now needs a re-plan.

use crate::core::db;
use crate::core::error::CairnError;
use crate::core::runtime::Runtime;
use crate::core::time;
use crate::plugins::knowledge::{self, KnowledgeKind, NewEntry, StoreOutcome};
use crate::plugins::scheduler::{self, CascadeStatus, ReplanInput, TaskStatus};
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tiktoken_rs::{CoreBPE, cl100k_base};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Active,
    Complete,
    Blocked,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Active => "active",
            WorkspaceStatus::Complete => "complete",
            WorkspaceStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkspaceStatus {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(WorkspaceStatus::Active),
            "complete" => Ok(WorkspaceStatus::Complete),
            "blocked" => Ok(WorkspaceStatus::Blocked),
            other => Err(CairnError::ValidationError(format!(
                "unknown workspace status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeOrigin {
    /// Recalled from the knowledge store.
    Store,
    /// Block reason of another workspace in the same campaign.
    Sibling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PriorKnowledge {
    pub name: String,
    pub kind: KnowledgeKind,
    pub trigger: String,
    pub resolution: String,
    pub score: f64,
    pub origin: KnowledgeOrigin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LineageEntry {
    pub seq: String,
    pub slug: String,
    pub delivered: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Workspace {
    pub id: String,
    pub campaign_id: String,
    pub task_seq: String,
    pub task_revision: u32,
    pub objective: String,
    pub delta: Vec<String>,
    pub verify: String,
    pub prior_knowledge: Vec<PriorKnowledge>,
    pub lineage: Vec<LineageEntry>,
    pub delivered: Option<String>,
    pub utilized: Vec<String>,
    pub touched: Vec<String>,
    pub block_reason: Option<String>,
    pub status: WorkspaceStatus,
    pub created_at: String,
    pub closed_at: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateParams<'a> {
    pub campaign_id: &'a str,
    pub seq: &'a str,
    pub verify: Option<&'a str>,
    pub id: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockOutcome {
    pub outcome: WorkspaceStatus,
    pub workspace: Workspace,
    /// The failure entry written for this block; absent if the store write failed.
    pub knowledge: Option<StoreOutcome>,
    pub cascade: CascadeStatus,
    pub replan: ReplanInput,
}

// --- scope ---

fn clean_path(p: &str) -> &str {
    let mut p = p.trim();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    p
}

fn has_parent_component(p: &str) -> bool {
    p.split('/').any(|c| c == "..")
}

/// Whether `path` lies inside one delta pattern.
///
/// Patterns are exact paths, directory prefixes (`src/` or `src`), recursive
/// globs (`src/**`), or a trailing `*` matching within one directory.
pub fn path_in_pattern(path: &str, pattern: &str) -> bool {
    let path = clean_path(path);
    let pattern = clean_path(pattern);
    if path.is_empty() || pattern.is_empty() || has_parent_component(path) {
        return false;
    }
    if let Some(dir) = pattern.strip_suffix("/**") {
        return path == dir || path.starts_with(&format!("{}/", dir));
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return path
            .strip_prefix(prefix)
            .is_some_and(|rest| !rest.contains('/'));
    }
    let dir = pattern.trim_end_matches('/');
    path == dir || path.starts_with(&format!("{}/", dir))
}

/// Touched paths that fall outside every delta pattern.
pub fn out_of_scope(delta: &[String], touched: &[String]) -> Vec<String> {
    touched
        .iter()
        .filter(|t| !delta.iter().any(|d| path_in_pattern(t, d)))
        .cloned()
        .collect()
}

// --- knowledge budget ---

fn tokenizer() -> Result<CoreBPE, CairnError> {
    cl100k_base().map_err(|e| CairnError::ConfigError(format!("cl100k tokenizer unavailable: {}", e)))
}

fn item_tokens(bpe: &CoreBPE, item: &PriorKnowledge) -> usize {
    bpe.encode_with_special_tokens(&item.trigger).len()
        + bpe.encode_with_special_tokens(&item.resolution).len()
}

/// Keep every sibling failure, then store entries in rank order while the
/// running token count fits `budget`.
pub fn trim_to_budget(
    items: Vec<PriorKnowledge>,
    budget: Option<usize>,
) -> Result<Vec<PriorKnowledge>, CairnError> {
    let Some(budget) = budget else {
        return Ok(items);
    };
    let bpe = tokenizer()?;
    let mut used = 0usize;
    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        let cost = item_tokens(&bpe, &item);
        if item.origin == KnowledgeOrigin::Sibling {
            used += cost;
            kept.push(item);
        } else if used + cost <= budget {
            used += cost;
            kept.push(item);
        }
    }
    Ok(kept)
}

// --- storage ---

const WORKSPACE_COLUMNS: &str = "id, campaign_id, task_seq, task_revision, objective, delta, verify, prior_knowledge, lineage, delivered, utilized, touched, block_reason, status, created_at, closed_at";

fn read_workspace(row: &rusqlite::Row<'_>) -> Result<Workspace, CairnError> {
    let id: String = row.get(0)?;
    let location = |col: &str| format!("workspaces[{}].{}", id, col);
    let revision: i64 = row.get(3)?;
    let delta: String = row.get(5)?;
    let prior: String = row.get(7)?;
    let lineage: String = row.get(8)?;
    let utilized: String = row.get(10)?;
    let touched: String = row.get(11)?;
    let status_raw: String = row.get(13)?;
    let status: WorkspaceStatus = status_raw.parse().map_err(|_| CairnError::MalformedRecord {
        location: location("status"),
        detail: format!("unknown status '{}'", status_raw),
    })?;
    Ok(Workspace {
        campaign_id: row.get(1)?,
        task_seq: row.get(2)?,
        task_revision: revision as u32,
        objective: row.get(4)?,
        delta: db::decode_json(&delta, &location("delta"))?,
        verify: row.get(6)?,
        prior_knowledge: db::decode_json(&prior, &location("prior_knowledge"))?,
        lineage: db::decode_json(&lineage, &location("lineage"))?,
        delivered: row.get(9)?,
        utilized: db::decode_json(&utilized, &location("utilized"))?,
        touched: db::decode_json(&touched, &location("touched"))?,
        block_reason: row.get(12)?,
        status,
        created_at: row.get(14)?,
        closed_at: row.get(15)?,
        id,
    })
}

fn load_workspace(conn: &Connection, id: &str) -> Result<Workspace, CairnError> {
    let sql = format!("SELECT {} FROM workspaces WHERE id = ?1", WORKSPACE_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => read_workspace(row),
        None => Err(CairnError::NotFound(format!("workspace {} not found", id))),
    }
}

fn query_workspaces(
    conn: &Connection,
    campaign_id: Option<&str>,
    status: Option<WorkspaceStatus>,
) -> Result<Vec<Workspace>, CairnError> {
    let sql = format!(
        "SELECT {} FROM workspaces
         WHERE (?1 IS NULL OR campaign_id = ?1) AND (?2 IS NULL OR status = ?2)
         ORDER BY created_at ASC, id ASC",
        WORKSPACE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![campaign_id, status.map(|s| s.as_str())])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(read_workspace(row)?);
    }
    Ok(out)
}

/// Block reasons already recorded by other workspaces of the campaign.
fn sibling_failures(conn: &Connection, campaign_id: &str) -> Result<Vec<PriorKnowledge>, CairnError> {
    Ok(
        query_workspaces(conn, Some(campaign_id), Some(WorkspaceStatus::Blocked))?
            .into_iter()
            .map(|w| PriorKnowledge {
                name: format!("sibling:{}", w.id),
                kind: KnowledgeKind::Failure,
                trigger: w.block_reason.unwrap_or_default(),
                resolution: String::new(),
                score: 1.0,
                origin: KnowledgeOrigin::Sibling,
            })
            .collect(),
    )
}

fn validate_workspace_id(id: &str) -> Result<(), CairnError> {
    let re = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$")
        .map_err(|e| CairnError::ValidationError(e.to_string()))?;
    if !re.is_match(id) {
        return Err(CairnError::ValidationError(format!(
            "workspace id '{}' must be 1-128 characters of letters, digits, '_', '.', '-'",
            id
        )));
    }
    Ok(())
}

// --- operations ---

/// Dispatch a ready task into a new workspace.
pub fn create(rt: &Runtime, params: CreateParams<'_>) -> Result<Workspace, CairnError> {
    let id = match params.id {
        Some(id) => {
            validate_workspace_id(id)?;
            id.to_string()
        }
        None => time::new_prefixed_id("W"),
    };
    let dimension = rt.embedding_dimension();
    let (campaign, task) = rt
        .broker()
        .with_read(&rt.campaign_db(), "workspace.prepare", |conn| {
            Ok((
                scheduler::load_campaign(conn, params.campaign_id, dimension)?,
                scheduler::load_task(conn, params.campaign_id, params.seq)?,
            ))
        })?;
    if task.status != TaskStatus::Pending {
        return Err(CairnError::InvalidTransition {
            subject: format!("task {}:{}", task.campaign_id, task.seq),
            from: task.status.to_string(),
            to: TaskStatus::InProgress.to_string(),
        });
    }

    let focus = task.goal.clone().unwrap_or_else(|| task.slug.replace('-', " "));
    let objective = format!("{}\n\nCampaign objective: {}", focus, campaign.objective);
    let recalled = knowledge::recall(
        rt,
        &format!("{} {}", focus, campaign.objective),
        None,
        Some(rt.config.workspace.knowledge_limit),
        true,
    )?;
    let budget = task
        .budget
        .map(|b| (f64::from(b) * rt.config.workspace.knowledge_budget_share).floor() as usize);
    let verify = params
        .verify
        .unwrap_or(&rt.config.workspace.default_verify)
        .to_string();

    let workspace = rt
        .broker()
        .with_write(&rt.campaign_db(), "workspace.create", |conn| {
            let taken = conn
                .query_row("SELECT 1 FROM workspaces WHERE id = ?1", params![id], |_| Ok(()))
                .optional()?
                .is_some();
            if taken {
                return Err(CairnError::ValidationError(format!(
                    "workspace id {} already exists",
                    id
                )));
            }
            let task = scheduler::start_task_in(conn, params.campaign_id, params.seq)?;

            let mut prior = sibling_failures(conn, params.campaign_id)?;
            let mut seen: BTreeSet<String> = prior.iter().map(|p| p.name.clone()).collect();
            for hit in &recalled.results {
                if seen.insert(hit.name.clone()) {
                    prior.push(PriorKnowledge {
                        name: hit.name.clone(),
                        kind: hit.kind,
                        trigger: hit.trigger.clone(),
                        resolution: hit.resolution.clone(),
                        score: hit.score,
                        origin: KnowledgeOrigin::Store,
                    });
                }
            }
            let prior = trim_to_budget(prior, budget)?;

            let mut lineage = Vec::new();
            for dep in &task.depends {
                let parent = scheduler::load_task(conn, params.campaign_id, dep)?;
                lineage.push(LineageEntry {
                    seq: parent.seq,
                    slug: parent.slug,
                    delivered: parent.summary,
                });
            }

            conn.execute(
                "INSERT INTO workspaces(id, campaign_id, task_seq, task_revision, objective, delta,
                    verify, prior_knowledge, lineage, status, created_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'active', ?10)",
                params![
                    id,
                    params.campaign_id,
                    params.seq,
                    i64::from(task.revision),
                    objective,
                    serde_json::to_string(&task.delta)?,
                    verify,
                    serde_json::to_string(&prior)?,
                    serde_json::to_string(&lineage)?,
                    time::now_epoch_z()
                ],
            )?;
            scheduler::append_event(
                conn,
                "workspace.create",
                Some(params.campaign_id),
                Some(&id),
                serde_json::json!({
                    "seq": params.seq,
                    "prior_knowledge": prior.len(),
                    "siblings": prior.iter().filter(|p| p.origin == KnowledgeOrigin::Sibling).count(),
                }),
            )?;
            load_workspace(conn, &id)
        })?;
    tracing::info!(
        workspace = %workspace.id,
        campaign = %workspace.campaign_id,
        seq = %workspace.task_seq,
        prior = workspace.prior_knowledge.len(),
        "workspace created"
    );
    Ok(workspace)
}

fn require_active(ws: &Workspace, to: WorkspaceStatus) -> Result<(), CairnError> {
    if ws.status != WorkspaceStatus::Active {
        return Err(CairnError::InvalidTransition {
            subject: format!("workspace {}", ws.id),
            from: ws.status.to_string(),
            to: to.to_string(),
        });
    }
    Ok(())
}

/// Close a workspace as complete. Every touched path must lie inside the
/// delta and every utilized name must come from its prior knowledge.
pub fn complete(
    rt: &Runtime,
    workspace_id: &str,
    delivered: &str,
    utilized: &[String],
    touched: &[String],
) -> Result<Workspace, CairnError> {
    let workspace = rt
        .broker()
        .with_write(&rt.campaign_db(), "workspace.complete", |conn| {
            let ws = load_workspace(conn, workspace_id)?;
            require_active(&ws, WorkspaceStatus::Complete)?;

            let unknown: Vec<&String> = utilized
                .iter()
                .filter(|u| !ws.prior_knowledge.iter().any(|p| &p.name == *u))
                .collect();
            if !unknown.is_empty() {
                return Err(CairnError::ValidationError(format!(
                    "utilized entries are not in the workspace's prior knowledge: {}",
                    unknown
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
            let outside = out_of_scope(&ws.delta, touched);
            if !outside.is_empty() {
                return Err(CairnError::ScopeViolation {
                    workspace: ws.id.clone(),
                    outside,
                });
            }

            conn.execute(
                "UPDATE workspaces SET status = 'complete', delivered = ?2, utilized = ?3,
                    touched = ?4, closed_at = ?5
                 WHERE id = ?1",
                params![
                    workspace_id,
                    delivered,
                    serde_json::to_string(utilized)?,
                    serde_json::to_string(touched)?,
                    time::now_epoch_z()
                ],
            )?;
            scheduler::complete_task_in(conn, &ws.campaign_id, &ws.task_seq, delivered)?;
            scheduler::append_event(
                conn,
                "workspace.complete",
                Some(&ws.campaign_id),
                Some(workspace_id),
                serde_json::json!({ "utilized": utilized, "touched": touched.len() }),
            )?;
            load_workspace(conn, workspace_id)
        })?;
    tracing::info!(workspace = workspace_id, seq = %workspace.task_seq, "workspace complete");
    Ok(workspace)
}

/// Close a workspace as blocked and capture the failure.
pub fn block(rt: &Runtime, workspace_id: &str, reason: &str) -> Result<BlockOutcome, CairnError> {
    if reason.trim().is_empty() {
        return Err(CairnError::ValidationError(
            "a block reason is required".to_string(),
        ));
    }
    let dimension = rt.embedding_dimension();
    let threshold = rt.config.scheduler.replan_threshold;
    let (workspace, cascade, replan) = rt
        .broker()
        .with_write(&rt.campaign_db(), "workspace.block", |conn| {
            let ws = load_workspace(conn, workspace_id)?;
            require_active(&ws, WorkspaceStatus::Blocked)?;
            conn.execute(
                "UPDATE workspaces SET status = 'blocked', block_reason = ?2, closed_at = ?3
                 WHERE id = ?1",
                params![workspace_id, reason, time::now_epoch_z()],
            )?;
            scheduler::block_task_in(conn, &ws.campaign_id, &ws.task_seq, reason)?;
            scheduler::append_event(
                conn,
                "workspace.block",
                Some(&ws.campaign_id),
                Some(workspace_id),
                serde_json::json!({ "reason": reason }),
            )?;
            let campaign = scheduler::load_campaign(conn, &ws.campaign_id, dimension)?;
            let tasks = scheduler::load_tasks(conn, &ws.campaign_id)?;
            Ok((
                load_workspace(conn, workspace_id)?,
                scheduler::compute_cascade(&ws.campaign_id, &tasks),
                scheduler::replan_input_from(&campaign, &tasks, threshold),
            ))
        })?;

    let source = vec![format!("{}:{}", workspace.campaign_id, workspace.task_seq)];
    let knowledge = match knowledge::store(
        rt,
        NewEntry {
            trigger: reason,
            resolution: "",
            kind: KnowledgeKind::Failure,
            source: &source,
            cost_or_saved: 0,
        },
    ) {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            tracing::warn!(workspace = workspace_id, error = %e, "block recorded but failure entry was not stored");
            None
        }
    };

    tracing::info!(
        workspace = workspace_id,
        seq = %workspace.task_seq,
        stuck = !cascade.unreachable.is_empty(),
        replan = replan.triggered,
        "workspace blocked"
    );
    Ok(BlockOutcome {
        outcome: WorkspaceStatus::Blocked,
        workspace,
        knowledge,
        cascade,
        replan,
    })
}

pub fn get(rt: &Runtime, workspace_id: &str) -> Result<Workspace, CairnError> {
    rt.broker()
        .with_read(&rt.campaign_db(), "workspace.get", |conn| {
            load_workspace(conn, workspace_id)
        })
}

pub fn list(
    rt: &Runtime,
    campaign_id: Option<&str>,
    status: Option<WorkspaceStatus>,
) -> Result<Vec<Workspace>, CairnError> {
    rt.broker()
        .with_read(&rt.campaign_db(), "workspace.list", |conn| {
            query_workspaces(conn, campaign_id, status)
        })
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "workspace",
        "version": "0.4.0",
        "description": "Per-task execution contracts with scope-checked completion",
        "commands": [
            { "name": "create", "parameters": ["campaign", "seq", "verify", "id"] },
            { "name": "complete", "parameters": ["id", "delivered", "utilized", "touched"] },
            { "name": "block", "parameters": ["id", "reason"] },
            { "name": "get", "parameters": ["id"] },
            { "name": "list", "parameters": ["campaign", "status"] }
        ],
        "states": ["active", "complete", "blocked"],
        "storage": ["campaign.db"]
    })
}
