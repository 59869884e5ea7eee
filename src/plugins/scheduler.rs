//! Campaign task scheduler.
//!
//! A campaign is one objective broken into tasks keyed by a three-digit
//! `seq`. Tasks form a dependency DAG with AND semantics: a task is ready once
//! every dependency is complete. The scheduler never runs anything; it is a
//! read/decide/mutate surface polled by an external dispatch loop, and every
//! answer is recomputed from storage.
//!
//! Task lifecycle: `pending -> in_progress -> complete | blocked`. A blocked
//! task only returns to work through `merge_revised_plan`, which archives the
//! blocked revision and starts a new one.

use crate::core::db;
use crate::core::error::CairnError;
use crate::core::runtime::Runtime;
use crate::core::similarity::{self, Probe};
use crate::core::time;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Complete,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Complete => "complete",
            TaskStatus::Blocked => "blocked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Blocked)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "complete" => Ok(TaskStatus::Complete),
            "blocked" => Ok(TaskStatus::Blocked),
            other => Err(CairnError::ValidationError(format!(
                "unknown task status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Active,
    Complete,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Active => "active",
            CampaignStatus::Complete => "complete",
            CampaignStatus::Failed => "failed",
        }
    }
}

impl FromStr for CampaignStatus {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CampaignStatus::Active),
            "complete" => Ok(CampaignStatus::Complete),
            "failed" => Ok(CampaignStatus::Failed),
            other => Err(CairnError::ValidationError(format!(
                "unknown campaign status '{}'",
                other
            ))),
        }
    }
}

/// `depends` as submitted: absent/null, one seq, or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Depends {
    One(String),
    Many(Vec<String>),
}

impl Depends {
    pub fn seqs(&self) -> Vec<String> {
        let mut out = match self {
            Depends::One(s) => vec![s.clone()],
            Depends::Many(v) => v.clone(),
        };
        out.sort();
        out.dedup();
        out
    }
}

/// One task as submitted by a planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    pub seq: String,
    pub slug: String,
    pub kind: String,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub delta: Vec<String>,
    #[serde(default)]
    pub depends: Option<Depends>,
    #[serde(default)]
    pub budget: Option<u32>,
}

impl TaskSpec {
    pub fn depends_on(&self) -> Vec<String> {
        self.depends.as_ref().map(Depends::seqs).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub campaign_id: String,
    pub seq: String,
    pub slug: String,
    pub kind: String,
    pub goal: Option<String>,
    pub delta: Vec<String>,
    pub depends: Vec<String>,
    pub status: TaskStatus,
    pub budget: Option<u32>,
    pub revision: u32,
    pub blocked_by: Option<String>,
    pub block_reason: Option<String>,
    pub cascade: bool,
    pub summary: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Campaign {
    pub id: String,
    pub objective: String,
    pub status: CampaignStatus,
    pub fingerprint: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignDetail {
    pub campaign: Campaign,
    pub counts: StatusCounts,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignMatch {
    pub campaign: Campaign,
    pub similarity: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub complete: usize,
    pub blocked: usize,
}

impl StatusCounts {
    pub fn of(tasks: &[Task]) -> Self {
        let mut c = StatusCounts::default();
        for t in tasks {
            match t.status {
                TaskStatus::Pending => c.pending += 1,
                TaskStatus::InProgress => c.in_progress += 1,
                TaskStatus::Complete => c.complete += 1,
                TaskStatus::Blocked => c.blocked += 1,
            }
        }
        c
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.complete + self.blocked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeState {
    Progressing,
    Stuck,
}

#[derive(Debug, Clone, Serialize)]
pub struct CascadeStatus {
    pub campaign_id: String,
    pub state: CascadeState,
    /// Every blocked task, original or cascade.
    pub blocked: Vec<String>,
    pub unreachable: Vec<String>,
    /// For each unreachable task, the dependency that strands it.
    pub blocked_by: BTreeMap<String, String>,
    pub counts: StatusCounts,
    /// Nothing is pending or in progress.
    pub settled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddTasksOutcome {
    pub campaign_id: String,
    pub added: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PropagatedBlock {
    pub seq: String,
    pub blocked_by: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedTask {
    pub seq: String,
    pub slug: String,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockedTask {
    pub seq: String,
    pub slug: String,
    pub reason: Option<String>,
    pub blocked_by: Option<String>,
    pub cascade: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskBrief {
    pub seq: String,
    pub slug: String,
    pub kind: String,
    pub goal: Option<String>,
    pub depends: Vec<String>,
    pub delta: Vec<String>,
}

impl From<&Task> for TaskBrief {
    fn from(t: &Task) -> Self {
        TaskBrief {
            seq: t.seq.clone(),
            slug: t.slug.clone(),
            kind: t.kind.clone(),
            goal: t.goal.clone(),
            depends: t.depends.clone(),
            delta: t.delta.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplanBundle {
    pub objective: String,
    pub completed: Vec<CompletedTask>,
    pub blocked: Vec<BlockedTask>,
    pub in_progress: Vec<TaskBrief>,
    pub remaining: Vec<TaskBrief>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplanInput {
    pub campaign_id: String,
    pub triggered: bool,
    pub threshold: usize,
    /// Unreachable pending tasks plus cascade-blocked tasks.
    pub stranded: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle: Option<ReplanBundle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupersededTask {
    pub seq: String,
    pub revision: u32,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct MergeOutcome {
    pub campaign_id: String,
    /// Complete tasks named in the revision; left untouched.
    pub kept: Vec<String>,
    pub superseded: Vec<SupersededTask>,
    pub redefined: Vec<String>,
    pub inserted: Vec<String>,
}

// --- validation ---

/// Format checks on a batch, independent of stored state.
pub fn validate_specs(specs: &[TaskSpec]) -> Result<(), CairnError> {
    let seq_re = Regex::new(r"^\d{3}$").map_err(|e| CairnError::ValidationError(e.to_string()))?;
    let slug_re = Regex::new(r"^[a-z0-9][a-z0-9-]*$")
        .map_err(|e| CairnError::ValidationError(e.to_string()))?;
    let kind_re =
        Regex::new(r"^[a-z][a-z0-9_]*$").map_err(|e| CairnError::ValidationError(e.to_string()))?;

    if specs.is_empty() {
        return Err(CairnError::ValidationError(
            "task batch is empty".to_string(),
        ));
    }
    let mut seen = BTreeSet::new();
    for spec in specs {
        if !seq_re.is_match(&spec.seq) {
            return Err(CairnError::ValidationError(format!(
                "task seq '{}' must be three digits (e.g. 001)",
                spec.seq
            )));
        }
        if !seen.insert(spec.seq.as_str()) {
            return Err(CairnError::ValidationError(format!(
                "task seq {} appears more than once in the batch",
                spec.seq
            )));
        }
        if !slug_re.is_match(&spec.slug) {
            return Err(CairnError::ValidationError(format!(
                "task {} slug '{}' must be lowercase letters, digits, and dashes",
                spec.seq, spec.slug
            )));
        }
        if !kind_re.is_match(&spec.kind) {
            return Err(CairnError::ValidationError(format!(
                "task {} kind '{}' must be a lowercase identifier",
                spec.seq, spec.kind
            )));
        }
        for dep in spec.depends_on() {
            if !seq_re.is_match(&dep) {
                return Err(CairnError::ValidationError(format!(
                    "task {} depends on '{}', which is not a valid seq",
                    spec.seq, dep
                )));
            }
            if dep == spec.seq {
                return Err(CairnError::ValidationError(format!(
                    "task {} depends on itself",
                    spec.seq
                )));
            }
        }
        if spec.delta.iter().any(|p| p.trim().is_empty()) {
            return Err(CairnError::ValidationError(format!(
                "task {} declares an empty delta path",
                spec.seq
            )));
        }
    }
    Ok(())
}

/// Every dependency must name a task in the graph.
pub fn check_references(graph: &BTreeMap<String, Vec<String>>) -> Result<(), CairnError> {
    for (seq, deps) in graph {
        for dep in deps {
            if !graph.contains_key(dep) {
                return Err(CairnError::ValidationError(format!(
                    "task {} depends on {}, which does not exist in the campaign",
                    seq, dep
                )));
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Three-color DFS over `seq -> depends`. Returns the first cycle found as a
/// path that starts and ends on the same seq.
pub fn find_cycle(graph: &BTreeMap<String, Vec<String>>) -> Option<Vec<String>> {
    fn visit<'a>(
        node: &'a str,
        graph: &'a BTreeMap<String, Vec<String>>,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(node, Mark::Gray);
        stack.push(node);
        for dep in graph.get(node).into_iter().flatten() {
            match marks.get(dep.as_str()).copied().unwrap_or(Mark::White) {
                Mark::Gray => {
                    let start = stack.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[start..].iter().map(|s| s.to_string()).collect();
                    path.push(dep.clone());
                    return Some(path);
                }
                Mark::White if graph.contains_key(dep) => {
                    if let Some(path) = visit(dep, graph, marks, stack) {
                        return Some(path);
                    }
                }
                _ => {}
            }
        }
        stack.pop();
        marks.insert(node, Mark::Black);
        None
    }

    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    for node in graph.keys() {
        if marks.get(node.as_str()).copied().unwrap_or(Mark::White) == Mark::White {
            let mut stack = Vec::new();
            if let Some(path) = visit(node, graph, &mut marks, &mut stack) {
                return Some(path);
            }
        }
    }
    None
}

fn validate_graph(graph: &BTreeMap<String, Vec<String>>) -> Result<(), CairnError> {
    check_references(graph)?;
    if let Some(path) = find_cycle(graph) {
        return Err(CairnError::Cycle { path });
    }
    Ok(())
}

// --- pure decisions over a task snapshot ---

/// Pending tasks whose every dependency is complete, in seq order.
pub fn compute_ready(tasks: &[Task]) -> Vec<Task> {
    let complete: BTreeSet<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Complete)
        .map(|t| t.seq.as_str())
        .collect();
    let mut ready: Vec<Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| t.depends.iter().all(|d| complete.contains(d.as_str())))
        .cloned()
        .collect();
    ready.sort_by(|a, b| a.seq.cmp(&b.seq));
    ready
}

/// Pending tasks stranded behind a blocked task, in discovery order, each
/// with the dependency that strands it. A transitive task is discovered after
/// its parent, so its `blocked_by` is that direct parent.
pub fn compute_unreachable(tasks: &[Task]) -> Vec<(String, String)> {
    let mut stranded: BTreeSet<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Blocked)
        .map(|t| t.seq.as_str())
        .collect();
    let mut pending: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .collect();
    pending.sort_by(|a, b| a.seq.cmp(&b.seq));

    let mut found = Vec::new();
    loop {
        let mut changed = false;
        for t in &pending {
            if stranded.contains(t.seq.as_str()) {
                continue;
            }
            if let Some(dep) = t.depends.iter().find(|d| stranded.contains(d.as_str())) {
                stranded.insert(t.seq.as_str());
                found.push((t.seq.clone(), dep.clone()));
                changed = true;
            }
        }
        if !changed {
            return found;
        }
    }
}

/// Blocked and unreachable work. Tasks already blocked by `propagate_blocks`
/// stay listed as unreachable, with their persisted `blocked_by`.
pub fn compute_cascade(campaign_id: &str, tasks: &[Task]) -> CascadeStatus {
    let mut blocked: Vec<String> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Blocked)
        .map(|t| t.seq.clone())
        .collect();
    blocked.sort();
    let mut found: BTreeMap<String, String> = compute_unreachable(tasks).into_iter().collect();
    for t in tasks {
        if t.status == TaskStatus::Blocked && t.cascade {
            found.insert(t.seq.clone(), t.blocked_by.clone().unwrap_or_default());
        }
    }
    let unreachable: Vec<String> = found.keys().cloned().collect();
    let counts = StatusCounts::of(tasks);
    CascadeStatus {
        campaign_id: campaign_id.to_string(),
        state: if unreachable.is_empty() {
            CascadeState::Progressing
        } else {
            CascadeState::Stuck
        },
        blocked,
        unreachable,
        blocked_by: found,
        settled: counts.pending == 0 && counts.in_progress == 0,
        counts,
    }
}

/// Seqs that need a planner: unreachable pending work plus cascade blocks.
pub fn stranded_work(tasks: &[Task]) -> Vec<String> {
    let mut stranded: Vec<String> = compute_unreachable(tasks)
        .into_iter()
        .map(|(s, _)| s)
        .chain(
            tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Blocked && t.cascade)
                .map(|t| t.seq.clone()),
        )
        .collect();
    stranded.sort();
    stranded.dedup();
    stranded
}

pub fn build_bundle(objective: &str, tasks: &[Task]) -> ReplanBundle {
    let mut sorted: Vec<&Task> = tasks.iter().collect();
    sorted.sort_by(|a, b| a.seq.cmp(&b.seq));
    let mut bundle = ReplanBundle {
        objective: objective.to_string(),
        completed: Vec::new(),
        blocked: Vec::new(),
        in_progress: Vec::new(),
        remaining: Vec::new(),
    };
    for t in sorted {
        match t.status {
            TaskStatus::Complete => bundle.completed.push(CompletedTask {
                seq: t.seq.clone(),
                slug: t.slug.clone(),
                summary: t.summary.clone(),
            }),
            TaskStatus::Blocked => bundle.blocked.push(BlockedTask {
                seq: t.seq.clone(),
                slug: t.slug.clone(),
                reason: t.block_reason.clone(),
                blocked_by: t.blocked_by.clone(),
                cascade: t.cascade,
            }),
            TaskStatus::InProgress => bundle.in_progress.push(TaskBrief::from(t)),
            TaskStatus::Pending => bundle.remaining.push(TaskBrief::from(t)),
        }
    }
    bundle
}

fn campaign_status_for(counts: &StatusCounts) -> CampaignStatus {
    if counts.total() > 0 && counts.complete == counts.total() {
        CampaignStatus::Complete
    } else if counts.total() > 0 && counts.pending == 0 && counts.in_progress == 0 {
        CampaignStatus::Failed
    } else {
        CampaignStatus::Active
    }
}

/// sha256 over the sorted, deduplicated normalized tokens of an objective.
pub fn fingerprint(objective: &str) -> String {
    let normalized = similarity::normalize(objective);
    let tokens: BTreeSet<&str> = normalized.split_whitespace().collect();
    let joined = tokens.into_iter().collect::<Vec<_>>().join(" ");
    format!("{:x}", Sha256::digest(joined.as_bytes()))
}

// --- storage ---

const TASK_COLUMNS: &str = "campaign_id, seq, slug, kind, goal, delta, depends, status, budget, revision, blocked_by, block_reason, cascade, summary, created_at, updated_at";

fn read_task(row: &rusqlite::Row<'_>) -> Result<Task, CairnError> {
    let campaign_id: String = row.get(0)?;
    let seq: String = row.get(1)?;
    let location = |col: &str| format!("tasks[{}:{}].{}", campaign_id, seq, col);
    let delta_raw: String = row.get(5)?;
    let depends_raw: String = row.get(6)?;
    let status_raw: String = row.get(7)?;
    let status: TaskStatus = status_raw
        .parse()
        .map_err(|_| CairnError::MalformedRecord {
            location: location("status"),
            detail: format!("unknown status '{}'", status_raw),
        })?;
    let budget: Option<i64> = row.get(8)?;
    let revision: i64 = row.get(9)?;
    let cascade: i64 = row.get(12)?;
    Ok(Task {
        slug: row.get(2)?,
        kind: row.get(3)?,
        goal: row.get(4)?,
        delta: db::decode_json(&delta_raw, &location("delta"))?,
        depends: db::decode_json(&depends_raw, &location("depends"))?,
        status,
        budget: budget.map(|b| b as u32),
        revision: revision as u32,
        blocked_by: row.get(10)?,
        block_reason: row.get(11)?,
        cascade: cascade != 0,
        summary: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
        campaign_id,
        seq,
    })
}

pub(crate) fn load_tasks(conn: &Connection, campaign_id: &str) -> Result<Vec<Task>, CairnError> {
    let sql = format!(
        "SELECT {} FROM tasks WHERE campaign_id = ?1 ORDER BY seq ASC",
        TASK_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![campaign_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(read_task(row)?);
    }
    Ok(out)
}

pub(crate) fn load_task(conn: &Connection, campaign_id: &str, seq: &str) -> Result<Task, CairnError> {
    let sql = format!(
        "SELECT {} FROM tasks WHERE campaign_id = ?1 AND seq = ?2",
        TASK_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![campaign_id, seq])?;
    match rows.next()? {
        Some(row) => read_task(row),
        None => Err(CairnError::NotFound(format!(
            "task {} not found in campaign {}",
            seq, campaign_id
        ))),
    }
}

fn read_campaign(row: &rusqlite::Row<'_>, dimension: usize) -> Result<Campaign, CairnError> {
    let id: String = row.get(0)?;
    let status_raw: String = row.get(2)?;
    let status: CampaignStatus = status_raw
        .parse()
        .map_err(|_| CairnError::MalformedRecord {
            location: format!("campaigns[{}].status", id),
            detail: format!("unknown status '{}'", status_raw),
        })?;
    let blob: Option<Vec<u8>> = row.get(4)?;
    let embedding = match blob {
        Some(bytes) => Some(similarity::decode_embedding(
            &bytes,
            dimension,
            &format!("campaigns[{}].embedding", id),
        )?),
        None => None,
    };
    Ok(Campaign {
        objective: row.get(1)?,
        status,
        fingerprint: row.get(3)?,
        embedding,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        id,
    })
}

const CAMPAIGN_COLUMNS: &str = "id, objective, status, fingerprint, embedding, created_at, updated_at";

pub(crate) fn load_campaign(
    conn: &Connection,
    campaign_id: &str,
    dimension: usize,
) -> Result<Campaign, CairnError> {
    let sql = format!("SELECT {} FROM campaigns WHERE id = ?1", CAMPAIGN_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![campaign_id])?;
    match rows.next()? {
        Some(row) => read_campaign(row, dimension),
        None => Err(CairnError::NotFound(format!(
            "campaign {} not found",
            campaign_id
        ))),
    }
}

fn load_campaigns(conn: &Connection, dimension: usize) -> Result<Vec<Campaign>, CairnError> {
    let sql = format!(
        "SELECT {} FROM campaigns ORDER BY created_at DESC, id DESC",
        CAMPAIGN_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(read_campaign(row, dimension)?);
    }
    Ok(out)
}

fn campaign_exists(conn: &Connection, campaign_id: &str) -> Result<(), CairnError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM campaigns WHERE id = ?1",
            params![campaign_id],
            |_| Ok(()),
        )
        .optional()?;
    found.ok_or_else(|| CairnError::NotFound(format!("campaign {} not found", campaign_id)))
}

pub(crate) fn append_event(
    conn: &Connection,
    event_type: &str,
    campaign_id: Option<&str>,
    subject: Option<&str>,
    payload: serde_json::Value,
) -> Result<(), CairnError> {
    conn.execute(
        "INSERT INTO campaign_events(event_id, ts, event_type, campaign_id, subject, payload)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            time::new_event_id(),
            time::now_epoch_z(),
            event_type,
            campaign_id,
            subject,
            serde_json::to_string(&payload)?
        ],
    )?;
    Ok(())
}

/// Recompute and persist the campaign status from its tasks.
pub(crate) fn refresh_campaign_status(
    conn: &Connection,
    campaign_id: &str,
) -> Result<CampaignStatus, CairnError> {
    let counts = StatusCounts::of(&load_tasks(conn, campaign_id)?);
    let status = campaign_status_for(&counts);
    let previous: String = conn.query_row(
        "SELECT status FROM campaigns WHERE id = ?1",
        params![campaign_id],
        |r| r.get(0),
    )?;
    if previous != status.as_str() {
        conn.execute(
            "UPDATE campaigns SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![campaign_id, status.as_str(), time::now_epoch_z()],
        )?;
        append_event(
            conn,
            "campaign.status",
            Some(campaign_id),
            None,
            serde_json::json!({ "from": previous, "to": status.as_str() }),
        )?;
        tracing::info!(campaign = campaign_id, from = %previous, to = status.as_str(), "campaign status changed");
    }
    Ok(status)
}

fn insert_task(conn: &Connection, campaign_id: &str, spec: &TaskSpec, now: &str) -> Result<(), CairnError> {
    conn.execute(
        "INSERT INTO tasks(campaign_id, seq, slug, kind, goal, delta, depends, status, budget,
            revision, cascade, created_at, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, 1, 0, ?9, ?9)",
        params![
            campaign_id,
            spec.seq,
            spec.slug,
            spec.kind,
            spec.goal,
            serde_json::to_string(&spec.delta)?,
            serde_json::to_string(&spec.depends_on())?,
            spec.budget.map(i64::from),
            now
        ],
    )?;
    Ok(())
}

fn invalid_transition(task: &Task, to: TaskStatus) -> CairnError {
    CairnError::InvalidTransition {
        subject: format!("task {}:{}", task.campaign_id, task.seq),
        from: task.status.to_string(),
        to: to.to_string(),
    }
}

/// pending -> in_progress; the task must be ready.
pub(crate) fn start_task_in(conn: &Connection, campaign_id: &str, seq: &str) -> Result<Task, CairnError> {
    let task = load_task(conn, campaign_id, seq)?;
    if task.status != TaskStatus::Pending {
        return Err(invalid_transition(&task, TaskStatus::InProgress));
    }
    for dep in &task.depends {
        let parent = load_task(conn, campaign_id, dep)?;
        if parent.status != TaskStatus::Complete {
            return Err(CairnError::ValidationError(format!(
                "task {} is not ready: dependency {} is {}",
                seq, dep, parent.status
            )));
        }
    }
    let now = time::now_epoch_z();
    conn.execute(
        "UPDATE tasks SET status = 'in_progress', updated_at = ?3 WHERE campaign_id = ?1 AND seq = ?2",
        params![campaign_id, seq, now],
    )?;
    append_event(conn, "task.start", Some(campaign_id), Some(seq), serde_json::json!({ "revision": task.revision }))?;
    load_task(conn, campaign_id, seq)
}

/// in_progress -> complete, recording the delivered summary.
pub(crate) fn complete_task_in(
    conn: &Connection,
    campaign_id: &str,
    seq: &str,
    summary: &str,
) -> Result<Task, CairnError> {
    let task = load_task(conn, campaign_id, seq)?;
    if task.status != TaskStatus::InProgress {
        return Err(invalid_transition(&task, TaskStatus::Complete));
    }
    conn.execute(
        "UPDATE tasks SET status = 'complete', summary = ?3, updated_at = ?4
         WHERE campaign_id = ?1 AND seq = ?2",
        params![campaign_id, seq, summary, time::now_epoch_z()],
    )?;
    append_event(conn, "task.complete", Some(campaign_id), Some(seq), serde_json::json!({ "revision": task.revision }))?;
    refresh_campaign_status(conn, campaign_id)?;
    load_task(conn, campaign_id, seq)
}

/// in_progress -> blocked, as an original (non-cascade) block.
pub(crate) fn block_task_in(
    conn: &Connection,
    campaign_id: &str,
    seq: &str,
    reason: &str,
) -> Result<Task, CairnError> {
    if reason.trim().is_empty() {
        return Err(CairnError::ValidationError(
            "a block reason is required".to_string(),
        ));
    }
    let task = load_task(conn, campaign_id, seq)?;
    if task.status != TaskStatus::InProgress {
        return Err(invalid_transition(&task, TaskStatus::Blocked));
    }
    conn.execute(
        "UPDATE tasks SET status = 'blocked', block_reason = ?3, blocked_by = NULL, cascade = 0,
            updated_at = ?4
         WHERE campaign_id = ?1 AND seq = ?2",
        params![campaign_id, seq, reason, time::now_epoch_z()],
    )?;
    append_event(
        conn,
        "task.block",
        Some(campaign_id),
        Some(seq),
        serde_json::json!({ "revision": task.revision, "reason": reason }),
    )?;
    refresh_campaign_status(conn, campaign_id)?;
    load_task(conn, campaign_id, seq)
}

// --- operations ---

pub fn create_campaign(rt: &Runtime, objective: &str) -> Result<Campaign, CairnError> {
    if objective.trim().is_empty() {
        return Err(CairnError::ValidationError(
            "campaign objective must not be empty".to_string(),
        ));
    }
    let embedding = match rt.backend().embed(objective) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "objective embedding failed; campaign stored without one");
            None
        }
    };
    let id = time::new_prefixed_id("C");
    let fp = fingerprint(objective);
    let dimension = rt.embedding_dimension();
    let campaign = rt
        .broker()
        .with_write(&rt.campaign_db(), "campaign.create", |conn| {
            let now = time::now_epoch_z();
            conn.execute(
                "INSERT INTO campaigns(id, objective, status, fingerprint, embedding, created_at, updated_at)
                 VALUES(?1, ?2, 'active', ?3, ?4, ?5, ?5)",
                params![
                    id,
                    objective,
                    fp,
                    embedding.as_deref().map(similarity::encode_embedding),
                    now
                ],
            )?;
            append_event(conn, "campaign.create", Some(&id), None, serde_json::json!({ "objective": objective }))?;
            load_campaign(conn, &id, dimension)
        })?;
    tracing::info!(campaign = %campaign.id, "campaign created");
    Ok(campaign)
}

pub fn get_campaign(rt: &Runtime, campaign_id: &str) -> Result<CampaignDetail, CairnError> {
    let dimension = rt.embedding_dimension();
    rt.broker()
        .with_read(&rt.campaign_db(), "campaign.get", |conn| {
            let campaign = load_campaign(conn, campaign_id, dimension)?;
            let tasks = load_tasks(conn, campaign_id)?;
            Ok(CampaignDetail {
                counts: StatusCounts::of(&tasks),
                campaign,
                tasks,
            })
        })
}

pub fn list_campaigns(
    rt: &Runtime,
    status: Option<CampaignStatus>,
) -> Result<Vec<Campaign>, CairnError> {
    let dimension = rt.embedding_dimension();
    rt.broker()
        .with_read(&rt.campaign_db(), "campaign.list", |conn| {
            Ok(load_campaigns(conn, dimension)?
                .into_iter()
                .filter(|c| status.is_none_or(|s| c.status == s))
                .collect())
        })
}

/// Past campaigns ranked by objective similarity under the session backend.
pub fn similar_campaigns(
    rt: &Runtime,
    objective: &str,
    limit: usize,
) -> Result<Vec<CampaignMatch>, CairnError> {
    let backend = rt.backend();
    let probe = backend.probe(objective).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "objective embedding failed; comparing without embeddings");
        Probe {
            text: similarity::normalize(objective),
            embedding: None,
        }
    });
    let campaigns = list_campaigns(rt, None)?;
    let mut matches: Vec<CampaignMatch> = campaigns
        .into_iter()
        .map(|c| {
            let other = Probe {
                text: similarity::normalize(&c.objective),
                embedding: c
                    .embedding
                    .clone()
                    .or_else(|| backend.embed(&c.objective).ok().flatten()),
            };
            CampaignMatch {
                similarity: backend.similarity(&probe, &other),
                campaign: c,
            }
        })
        .filter(|m| m.similarity > 0.0)
        .collect();
    matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    matches.truncate(limit);
    Ok(matches)
}

/// Validate and insert a batch. Nothing is written unless the whole batch,
/// combined with the campaign's existing tasks, is a valid DAG.
pub fn add_tasks(
    rt: &Runtime,
    campaign_id: &str,
    specs: &[TaskSpec],
) -> Result<AddTasksOutcome, CairnError> {
    validate_specs(specs)?;
    let outcome = rt
        .broker()
        .with_write(&rt.campaign_db(), "scheduler.add_tasks", |conn| {
            campaign_exists(conn, campaign_id)?;
            let existing = load_tasks(conn, campaign_id)?;
            let mut graph: BTreeMap<String, Vec<String>> = existing
                .iter()
                .map(|t| (t.seq.clone(), t.depends.clone()))
                .collect();
            for spec in specs {
                if graph.contains_key(&spec.seq) {
                    return Err(CairnError::ValidationError(format!(
                        "task {} already exists in campaign {}",
                        spec.seq, campaign_id
                    )));
                }
                graph.insert(spec.seq.clone(), spec.depends_on());
            }
            validate_graph(&graph)?;

            let now = time::now_epoch_z();
            for spec in specs {
                insert_task(conn, campaign_id, spec, &now)?;
            }
            let added: Vec<String> = specs.iter().map(|s| s.seq.clone()).collect();
            append_event(conn, "tasks.add", Some(campaign_id), None, serde_json::json!({ "seqs": added }))?;
            refresh_campaign_status(conn, campaign_id)?;
            Ok(AddTasksOutcome {
                campaign_id: campaign_id.to_string(),
                added,
            })
        })?;
    tracing::info!(campaign = campaign_id, added = outcome.added.len(), "tasks added");
    Ok(outcome)
}

pub fn list_tasks(
    rt: &Runtime,
    campaign_id: &str,
    status: Option<TaskStatus>,
) -> Result<Vec<Task>, CairnError> {
    rt.broker()
        .with_read(&rt.campaign_db(), "scheduler.tasks", |conn| {
            campaign_exists(conn, campaign_id)?;
            Ok(load_tasks(conn, campaign_id)?
                .into_iter()
                .filter(|t| status.is_none_or(|s| t.status == s))
                .collect())
        })
}

pub fn ready_tasks(rt: &Runtime, campaign_id: &str) -> Result<Vec<Task>, CairnError> {
    rt.broker()
        .with_read(&rt.campaign_db(), "scheduler.ready", |conn| {
            campaign_exists(conn, campaign_id)?;
            Ok(compute_ready(&load_tasks(conn, campaign_id)?))
        })
}

pub fn start_task(rt: &Runtime, campaign_id: &str, seq: &str) -> Result<Task, CairnError> {
    rt.broker()
        .with_write(&rt.campaign_db(), "scheduler.start", |conn| {
            start_task_in(conn, campaign_id, seq)
        })
}

pub fn complete_task(
    rt: &Runtime,
    campaign_id: &str,
    seq: &str,
    summary: &str,
) -> Result<Task, CairnError> {
    rt.broker()
        .with_write(&rt.campaign_db(), "scheduler.complete", |conn| {
            complete_task_in(conn, campaign_id, seq, summary)
        })
}

pub fn block_task(rt: &Runtime, campaign_id: &str, seq: &str, reason: &str) -> Result<Task, CairnError> {
    rt.broker()
        .with_write(&rt.campaign_db(), "scheduler.block", |conn| {
            block_task_in(conn, campaign_id, seq, reason)
        })
}

pub fn cascade_status(rt: &Runtime, campaign_id: &str) -> Result<CascadeStatus, CairnError> {
    rt.broker()
        .with_read(&rt.campaign_db(), "scheduler.cascade", |conn| {
            campaign_exists(conn, campaign_id)?;
            Ok(compute_cascade(campaign_id, &load_tasks(conn, campaign_id)?))
        })
}

/// Block every unreachable task as a cascade of its stranding dependency.
pub fn propagate_blocks(rt: &Runtime, campaign_id: &str) -> Result<Vec<PropagatedBlock>, CairnError> {
    let propagated = rt
        .broker()
        .with_write(&rt.campaign_db(), "scheduler.propagate", |conn| {
            campaign_exists(conn, campaign_id)?;
            let tasks = load_tasks(conn, campaign_id)?;
            let now = time::now_epoch_z();
            let mut out = Vec::new();
            for (seq, dep) in compute_unreachable(&tasks) {
                conn.execute(
                    "UPDATE tasks SET status = 'blocked', cascade = 1, blocked_by = ?3,
                        block_reason = ?4, updated_at = ?5
                     WHERE campaign_id = ?1 AND seq = ?2 AND status = 'pending'",
                    params![
                        campaign_id,
                        seq,
                        dep,
                        format!("cascade: dependency {} is blocked", dep),
                        now
                    ],
                )?;
                append_event(
                    conn,
                    "task.cascade_block",
                    Some(campaign_id),
                    Some(&seq),
                    serde_json::json!({ "blocked_by": dep }),
                )?;
                out.push(PropagatedBlock { seq, blocked_by: dep });
            }
            refresh_campaign_status(conn, campaign_id)?;
            Ok(out)
        })?;
    if !propagated.is_empty() {
        tracing::info!(campaign = campaign_id, count = propagated.len(), "cascade blocks propagated");
    }
    Ok(propagated)
}

pub(crate) fn replan_input_from(
    campaign: &Campaign,
    tasks: &[Task],
    threshold: usize,
) -> ReplanInput {
    let stranded = stranded_work(tasks);
    let triggered = stranded.len() >= threshold;
    ReplanInput {
        campaign_id: campaign.id.clone(),
        triggered,
        threshold,
        bundle: triggered.then(|| build_bundle(&campaign.objective, tasks)),
        stranded,
    }
}

pub fn get_replan_input(
    rt: &Runtime,
    campaign_id: &str,
    threshold: Option<usize>,
) -> Result<ReplanInput, CairnError> {
    let threshold = threshold.unwrap_or(rt.config.scheduler.replan_threshold);
    if threshold == 0 {
        return Err(CairnError::ValidationError(
            "replan threshold must be at least 1".to_string(),
        ));
    }
    let dimension = rt.embedding_dimension();
    rt.broker()
        .with_read(&rt.campaign_db(), "scheduler.replan_input", |conn| {
            let campaign = load_campaign(conn, campaign_id, dimension)?;
            let tasks = load_tasks(conn, campaign_id)?;
            Ok(replan_input_from(&campaign, &tasks, threshold))
        })
}

/// Fold a planner's revised task set back into the campaign.
///
/// Complete tasks are kept as they are. In-progress tasks cannot be revised.
/// A blocked task in the revision is superseded: its row is archived into
/// `task_history` and it restarts as a new pending revision. Pending tasks
/// are redefined in place and unknown seqs are inserted.
pub fn merge_revised_plan(
    rt: &Runtime,
    campaign_id: &str,
    specs: &[TaskSpec],
) -> Result<MergeOutcome, CairnError> {
    validate_specs(specs)?;
    let outcome = rt
        .broker()
        .with_write(&rt.campaign_db(), "scheduler.merge_plan", |conn| {
            campaign_exists(conn, campaign_id)?;
            let existing: BTreeMap<String, Task> = load_tasks(conn, campaign_id)?
                .into_iter()
                .map(|t| (t.seq.clone(), t))
                .collect();

            let mut outcome = MergeOutcome {
                campaign_id: campaign_id.to_string(),
                ..MergeOutcome::default()
            };
            let mut graph: BTreeMap<String, Vec<String>> = existing
                .iter()
                .map(|(seq, t)| (seq.clone(), t.depends.clone()))
                .collect();
            let mut writes: Vec<&TaskSpec> = Vec::new();
            for spec in specs {
                match existing.get(&spec.seq) {
                    Some(t) if t.status == TaskStatus::Complete => outcome.kept.push(spec.seq.clone()),
                    Some(t) if t.status == TaskStatus::InProgress => {
                        return Err(CairnError::ValidationError(format!(
                            "task {} is in progress and cannot be revised",
                            spec.seq
                        )));
                    }
                    _ => {
                        graph.insert(spec.seq.clone(), spec.depends_on());
                        writes.push(spec);
                    }
                }
            }
            validate_graph(&graph)?;

            let now = time::now_epoch_z();
            for spec in writes {
                match existing.get(&spec.seq) {
                    Some(t) if t.status == TaskStatus::Blocked => {
                        conn.execute(
                            "INSERT INTO task_history(campaign_id, seq, revision, snapshot, superseded_at)
                             VALUES(?1, ?2, ?3, ?4, ?5)",
                            params![
                                campaign_id,
                                t.seq,
                                i64::from(t.revision),
                                serde_json::to_string(t)?,
                                now
                            ],
                        )?;
                        let revision = t.revision + 1;
                        update_definition(conn, campaign_id, spec, Some(revision), &now)?;
                        outcome.superseded.push(SupersededTask {
                            seq: spec.seq.clone(),
                            revision,
                        });
                    }
                    Some(_) => {
                        update_definition(conn, campaign_id, spec, None, &now)?;
                        outcome.redefined.push(spec.seq.clone());
                    }
                    None => {
                        insert_task(conn, campaign_id, spec, &now)?;
                        outcome.inserted.push(spec.seq.clone());
                    }
                }
            }
            append_event(
                conn,
                "plan.merge",
                Some(campaign_id),
                None,
                serde_json::to_value(&outcome)?,
            )?;
            refresh_campaign_status(conn, campaign_id)?;
            Ok(outcome)
        })?;
    tracing::info!(
        campaign = campaign_id,
        superseded = outcome.superseded.len(),
        redefined = outcome.redefined.len(),
        inserted = outcome.inserted.len(),
        "revised plan merged"
    );
    Ok(outcome)
}

/// Rewrite a task's definition and reset it to pending. `revision` is set
/// when the task is being superseded.
fn update_definition(
    conn: &Connection,
    campaign_id: &str,
    spec: &TaskSpec,
    revision: Option<u32>,
    now: &str,
) -> Result<(), CairnError> {
    conn.execute(
        "UPDATE tasks SET slug = ?3, kind = ?4, goal = ?5, delta = ?6, depends = ?7, budget = ?8,
            revision = COALESCE(?9, revision), status = 'pending', blocked_by = NULL,
            block_reason = NULL, cascade = 0, summary = NULL, updated_at = ?10
         WHERE campaign_id = ?1 AND seq = ?2",
        params![
            campaign_id,
            spec.seq,
            spec.slug,
            spec.kind,
            spec.goal,
            serde_json::to_string(&spec.delta)?,
            serde_json::to_string(&spec.depends_on())?,
            spec.budget.map(i64::from),
            revision.map(i64::from),
            now
        ],
    )?;
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "scheduler",
        "version": "0.4.0",
        "description": "Campaign task DAG: readiness, cascades, and re-planning",
        "commands": [
            { "name": "campaign create", "parameters": ["objective"] },
            { "name": "campaign get", "parameters": ["id"] },
            { "name": "campaign list", "parameters": ["status"] },
            { "name": "campaign similar", "parameters": ["objective", "limit"] },
            { "name": "add-tasks", "parameters": ["campaign", "file"] },
            { "name": "tasks", "parameters": ["campaign", "status"] },
            { "name": "ready", "parameters": ["campaign"] },
            { "name": "cascade", "parameters": ["campaign"] },
            { "name": "propagate", "parameters": ["campaign"] },
            { "name": "replan-input", "parameters": ["campaign", "threshold"] },
            { "name": "merge-plan", "parameters": ["campaign", "file"] }
        ],
        "task_states": ["pending", "in_progress", "complete", "blocked"],
        "storage": ["campaign.db"]
    })
}
