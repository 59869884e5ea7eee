//! cairn: local-first memory and scheduling for agent pipelines
//!
//! cairn backs an explore → plan → build → observe loop with two stores:
//!
//! - a **knowledge store** of scored entries (failures, patterns, facts,
//!   decisions, evolutions) joined by a typed relationship graph, and
//! - a **task scheduler** that holds each campaign's dependency graph,
//!   reports ready work, detects cascade blocks, and merges revised plans.
//!
//! Between them sits the **workspace manager**, which turns a ready task into
//! an execution contract (scope, verification command, prior knowledge,
//! lineage) and feeds failures back into the knowledge store.
//!
//! # Architecture
//!
//! All state lives under `<project>/.cairn/data/`:
//!
//! - `knowledge.db`: entries, edges, knowledge events
//! - `campaign.db`: campaigns, tasks, task history, workspaces, quorum sessions
//! - `broker.events.jsonl`: audit line per brokered mutation
//!
//! Every mutation routes through [`core::broker::DbBroker`], which serializes
//! writers per database and runs the mutation inside one SQLite transaction.
//!
//! # Examples
//!
//! ```bash
//! cairn init
//! cairn campaign create --objective "port the parser to streaming input"
//! cairn scheduler add-tasks --campaign C_... --file plan.json
//! cairn scheduler ready --campaign C_...
//! cairn workspace create --campaign C_... --seq 001
//! cairn knowledge recall --query "ImportError in build step" --expand
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: store, broker, config, similarity backends, errors
//! - [`plugins`]: knowledge, graph, scheduler, workspace, quorum

pub mod core;
pub mod plugins;

mod cli;

use crate::cli::{
    BrokerCommand, CampaignCommand, Cli, Command, KnowledgeCommand, QuorumCommand,
    SchedulerCommand, WorkspaceCommand,
};
use crate::core::{
    broker,
    config::{CONFIG_FILE_NAME, CairnConfig},
    error::CairnError,
    output::{self, OutputFormat},
    runtime::Runtime,
    store::{self, CAIRN_DIR, Store},
    time::command_envelope,
};
use crate::plugins::{graph, knowledge, quorum, scheduler, workspace};

use clap::Parser;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Parse the command line, run it, and print the result envelope.
///
/// Returns the output format alongside any error so the caller can render the
/// failure in the same shape.
pub fn run() -> Result<(), (OutputFormat, CairnError)> {
    let cli = Cli::parse();
    let format = cli.format;
    let envelope = dispatch(cli).map_err(|e| (format, e))?;
    output::emit(format, &envelope).map_err(|e| (format, CairnError::JsonError(e)))
}

/// Envelope printed for a failed command.
pub fn error_envelope(err: &CairnError) -> JsonValue {
    command_envelope(
        "cairn",
        "error",
        serde_json::json!({
            "error": {
                "kind": err.kind(),
                "message": err.to_string(),
                "details": err.details(),
            }
        }),
    )
}

fn dispatch(cli: Cli) -> Result<JsonValue, CairnError> {
    let current_dir = std::env::current_dir()?;
    let root = cli.root;
    match cli.command {
        Command::Init { dir, force } => {
            let target = dir.or(root).unwrap_or(current_dir);
            init_project(&target, force)
        }
        Command::Schema { subsystem } => Ok(schema_envelope(subsystem.as_deref())),
        Command::Knowledge(k) => run_knowledge(&open_runtime(root, &current_dir)?, k.command),
        Command::Campaign(c) => run_campaign(&open_runtime(root, &current_dir)?, c.command),
        Command::Scheduler(s) => run_scheduler(&open_runtime(root, &current_dir)?, s.command),
        Command::Workspace(w) => run_workspace(&open_runtime(root, &current_dir)?, w.command),
        Command::Quorum(q) => run_quorum(&open_runtime(root, &current_dir)?, q.command),
        Command::Broker(b) => run_broker(&open_runtime(root, &current_dir)?, b.command),
    }
}

fn open_runtime(root: Option<PathBuf>, current_dir: &Path) -> Result<Runtime, CairnError> {
    let project_root = match root {
        Some(root) => root,
        None => store::find_project_root(current_dir)?,
    };
    let rt = Runtime::open(Store::for_project(&project_root))?;
    if let Some(reason) = rt.fallback_reason() {
        tracing::warn!(reason, "running with lexical similarity");
    }
    Ok(rt)
}

fn ok<T: Serialize>(cmd: &str, key: &str, value: &T) -> Result<JsonValue, CairnError> {
    let mut extra = serde_json::Map::new();
    extra.insert(key.to_string(), serde_json::to_value(value)?);
    Ok(command_envelope(cmd, "ok", JsonValue::Object(extra)))
}

fn init_project(target: &Path, force: bool) -> Result<JsonValue, CairnError> {
    fs::create_dir_all(target)?;
    let target = fs::canonicalize(target)?;
    let store = Store::for_project(&target);
    store.ensure_dirs()?;

    let config_path = store.cairn_dir().join(CONFIG_FILE_NAME);
    let wrote_config = force || !config_path.exists();
    if wrote_config {
        fs::write(&config_path, CairnConfig::default_toml()?)?;
    }
    let rt = Runtime::open(store)?;
    tracing::info!(root = %target.display(), "initialized cairn project");
    Ok(command_envelope(
        "init",
        "ok",
        serde_json::json!({
            "root": target.join(CAIRN_DIR),
            "data": rt.store.root,
            "config": config_path,
            "wrote_config": wrote_config,
            "backend": rt.backend().name(),
        }),
    ))
}

fn schema_envelope(subsystem: Option<&str>) -> JsonValue {
    let all = [
        ("knowledge", knowledge::schema()),
        ("scheduler", scheduler::schema()),
        ("workspace", workspace::schema()),
        ("quorum", quorum::schema()),
        ("broker", broker::schema()),
    ];
    let schemas: serde_json::Map<String, JsonValue> = all
        .into_iter()
        .filter(|(name, _)| subsystem.is_none_or(|s| s == *name))
        .map(|(name, schema)| (name.to_string(), schema))
        .collect();
    command_envelope(
        "schema",
        if schemas.is_empty() { "not_found" } else { "ok" },
        serde_json::json!({ "schemas": schemas }),
    )
}

fn read_batch(file: &Path) -> Result<Vec<scheduler::TaskSpec>, CairnError> {
    let raw = if file.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        fs::read_to_string(file)?
    };
    serde_json::from_str(&raw).map_err(|e| {
        CairnError::ValidationError(format!("task batch {}: {}", file.display(), e))
    })
}

fn run_knowledge(rt: &Runtime, command: KnowledgeCommand) -> Result<JsonValue, CairnError> {
    match command {
        KnowledgeCommand::Store {
            trigger,
            resolution,
            kind,
            source,
            cost,
        } => {
            let kind: knowledge::KnowledgeKind = kind.parse()?;
            let outcome = knowledge::store(
                rt,
                knowledge::NewEntry {
                    trigger: &trigger,
                    resolution: &resolution,
                    kind,
                    source: &source,
                    cost_or_saved: cost,
                },
            )?;
            ok("knowledge.store", "entry", &outcome)
        }
        KnowledgeCommand::Recall {
            query,
            kind,
            limit,
            expand,
        } => {
            let kind = kind
                .map(|k| k.parse::<knowledge::KnowledgeKind>())
                .transpose()?;
            let result = knowledge::recall(rt, &query, kind, limit, expand)?;
            ok("knowledge.recall", "recall", &result)
        }
        KnowledgeCommand::RecallByType { query, limit } => {
            let result = knowledge::recall_by_type(rt, &query, limit)?;
            ok("knowledge.recall_by_type", "by_kind", &result)
        }
        KnowledgeCommand::Get { name } => {
            ok("knowledge.get", "entry", &knowledge::get(rt, &name)?)
        }
        KnowledgeCommand::Edge {
            from,
            to,
            rel_type,
            weight,
        } => {
            let rel: graph::RelType = rel_type.parse()?;
            ok("knowledge.edge", "edge", &graph::edge(rt, &from, &to, rel, weight)?)
        }
        KnowledgeCommand::Edges { name, rel_type } => {
            let rel = rel_type.map(|r| r.parse::<graph::RelType>()).transpose()?;
            ok("knowledge.edges", "edges", &graph::edges(rt, &name, rel)?)
        }
        KnowledgeCommand::Traverse {
            seeds,
            depth,
            floor,
        } => ok(
            "knowledge.traverse",
            "hits",
            &graph::traverse_from(rt, &seeds, depth, floor)?,
        ),
        KnowledgeCommand::Feedback { names, delta } => ok(
            "knowledge.feedback",
            "feedback",
            &knowledge::feedback(rt, &names, delta)?,
        ),
        KnowledgeCommand::Decay {
            unused_days,
            min_uses,
        } => ok(
            "knowledge.decay",
            "decayed",
            &knowledge::decay(rt, unused_days, min_uses)?,
        ),
        KnowledgeCommand::Prune {
            min_effectiveness,
            min_uses,
        } => ok(
            "knowledge.prune",
            "prune",
            &knowledge::prune(rt, min_effectiveness, min_uses)?,
        ),
        KnowledgeCommand::Consolidate { threshold } => ok(
            "knowledge.consolidate",
            "merged",
            &knowledge::consolidate(rt, threshold)?,
        ),
        KnowledgeCommand::Health => ok("knowledge.health", "health", &knowledge::health(rt)?),
    }
}

fn run_campaign(rt: &Runtime, command: CampaignCommand) -> Result<JsonValue, CairnError> {
    match command {
        CampaignCommand::Create { objective } => ok(
            "campaign.create",
            "campaign",
            &scheduler::create_campaign(rt, &objective)?,
        ),
        CampaignCommand::Get { id } => {
            ok("campaign.get", "campaign", &scheduler::get_campaign(rt, &id)?)
        }
        CampaignCommand::List { status } => {
            let status = status
                .map(|s| s.parse::<scheduler::CampaignStatus>())
                .transpose()?;
            ok(
                "campaign.list",
                "campaigns",
                &scheduler::list_campaigns(rt, status)?,
            )
        }
        CampaignCommand::Similar { objective, limit } => ok(
            "campaign.similar",
            "matches",
            &scheduler::similar_campaigns(rt, &objective, limit)?,
        ),
    }
}

fn run_scheduler(rt: &Runtime, command: SchedulerCommand) -> Result<JsonValue, CairnError> {
    match command {
        SchedulerCommand::AddTasks { campaign, file } => {
            let specs = read_batch(&file)?;
            ok(
                "scheduler.add_tasks",
                "added",
                &scheduler::add_tasks(rt, &campaign, &specs)?,
            )
        }
        SchedulerCommand::Tasks { campaign, status } => {
            let status = status
                .map(|s| s.parse::<scheduler::TaskStatus>())
                .transpose()?;
            ok(
                "scheduler.tasks",
                "tasks",
                &scheduler::list_tasks(rt, &campaign, status)?,
            )
        }
        SchedulerCommand::Ready { campaign } => ok(
            "scheduler.ready",
            "tasks",
            &scheduler::ready_tasks(rt, &campaign)?,
        ),
        SchedulerCommand::Cascade { campaign } => ok(
            "scheduler.cascade",
            "cascade",
            &scheduler::cascade_status(rt, &campaign)?,
        ),
        SchedulerCommand::Propagate { campaign } => ok(
            "scheduler.propagate",
            "propagated",
            &scheduler::propagate_blocks(rt, &campaign)?,
        ),
        SchedulerCommand::ReplanInput {
            campaign,
            threshold,
        } => ok(
            "scheduler.replan_input",
            "replan",
            &scheduler::get_replan_input(rt, &campaign, threshold)?,
        ),
        SchedulerCommand::MergePlan { campaign, file } => {
            let specs = read_batch(&file)?;
            ok(
                "scheduler.merge_plan",
                "merge",
                &scheduler::merge_revised_plan(rt, &campaign, &specs)?,
            )
        }
    }
}

fn run_workspace(rt: &Runtime, command: WorkspaceCommand) -> Result<JsonValue, CairnError> {
    match command {
        WorkspaceCommand::Create {
            campaign,
            seq,
            verify,
            id,
        } => {
            let ws = workspace::create(
                rt,
                workspace::CreateParams {
                    campaign_id: &campaign,
                    seq: &seq,
                    verify: verify.as_deref(),
                    id: id.as_deref(),
                },
            )?;
            ok("workspace.create", "workspace", &ws)
        }
        WorkspaceCommand::Complete {
            id,
            delivered,
            utilized,
            touched,
        } => ok(
            "workspace.complete",
            "workspace",
            &workspace::complete(rt, &id, &delivered, &utilized, &touched)?,
        ),
        WorkspaceCommand::Block { id, reason } => {
            ok("workspace.block", "block", &workspace::block(rt, &id, &reason)?)
        }
        WorkspaceCommand::Get { id } => {
            ok("workspace.get", "workspace", &workspace::get(rt, &id)?)
        }
        WorkspaceCommand::List { campaign, status } => {
            let status = status
                .map(|s| s.parse::<workspace::WorkspaceStatus>())
                .transpose()?;
            ok(
                "workspace.list",
                "workspaces",
                &workspace::list(rt, campaign.as_deref(), status)?,
            )
        }
    }
}

fn run_quorum(rt: &Runtime, command: QuorumCommand) -> Result<JsonValue, CairnError> {
    match command {
        QuorumCommand::Open {
            label,
            expected,
            quorum: needed,
            timeout_secs,
        } => ok(
            "quorum.open",
            "session",
            &quorum::open(rt, &label, expected, needed, timeout_secs)?,
        ),
        QuorumCommand::Report {
            session,
            worker,
            payload,
        } => {
            let payload: JsonValue = serde_json::from_str(&payload).map_err(|e| {
                CairnError::ValidationError(format!("report payload is not JSON: {}", e))
            })?;
            ok(
                "quorum.report",
                "quorum",
                &quorum::report(rt, &session, &worker, payload)?,
            )
        }
        QuorumCommand::Status { session } => {
            ok("quorum.status", "quorum", &quorum::status(rt, &session)?)
        }
        QuorumCommand::Wait { session, poll_ms } => {
            ok("quorum.wait", "quorum", &quorum::wait(rt, &session, poll_ms)?)
        }
    }
}

fn run_broker(rt: &Runtime, command: BrokerCommand) -> Result<JsonValue, CairnError> {
    match command {
        BrokerCommand::Audit { tail } => {
            let mut events = rt.broker().read_audit()?;
            if let Some(n) = tail {
                let skip = events.len().saturating_sub(n);
                events.drain(..skip);
            }
            ok("broker.audit", "events", &events)
        }
    }
}
