//! CLI struct definitions for the cairn command-line interface.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use crate::core::output::OutputFormat;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "cairn",
    version = env!("CARGO_PKG_VERSION"),
    about = "Local-first memory and scheduling core for explore/plan/build/observe agent pipelines."
)]
pub(crate) struct Cli {
    /// Project directory (defaults to the nearest ancestor containing `.cairn/`).
    #[clap(long, global = true)]
    pub root: Option<PathBuf>,
    /// Output format.
    #[clap(long, global = true, value_enum, default_value = "json")]
    pub format: OutputFormat,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create `.cairn/data` and a default config
    #[clap(name = "init")]
    Init {
        /// Directory to initialize (defaults to current working directory).
        #[clap(short, long)]
        dir: Option<PathBuf>,
        /// Rewrite config.toml even if it exists.
        #[clap(long)]
        force: bool,
    },

    /// Scored knowledge entries and their relationships
    #[clap(name = "knowledge", visible_alias = "k")]
    Knowledge(KnowledgeCli),

    /// Campaigns: objectives that own a task graph
    #[clap(name = "campaign", visible_alias = "c")]
    Campaign(CampaignCli),

    /// Dependency-aware task scheduling
    #[clap(name = "scheduler", visible_alias = "s")]
    Scheduler(SchedulerCli),

    /// Per-task execution contracts
    #[clap(name = "workspace", visible_alias = "w")]
    Workspace(WorkspaceCli),

    /// Bounded waiting on parallel workers
    #[clap(name = "quorum", visible_alias = "q")]
    Quorum(QuorumCli),

    /// Audit log access
    #[clap(name = "broker")]
    Broker(BrokerCli),

    /// Subsystem schemas
    #[clap(name = "schema")]
    Schema {
        /// Optional: filter by subsystem name
        #[clap(long)]
        subsystem: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct KnowledgeCli {
    #[clap(subcommand)]
    pub command: KnowledgeCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum KnowledgeCommand {
    /// Add an entry, merging into a near-duplicate of the same kind
    Store {
        #[clap(long)]
        trigger: String,
        #[clap(long, default_value = "")]
        resolution: String,
        /// failure | pattern | fact | decision | evolution
        #[clap(long)]
        kind: String,
        /// Source ids (repeatable).
        #[clap(long)]
        source: Vec<String>,
        /// Cost incurred (failures) or saved (patterns).
        #[clap(long, default_value_t = 0)]
        cost: i64,
    },
    /// Rank entries against a query
    Recall {
        #[clap(long)]
        query: String,
        #[clap(long)]
        kind: Option<String>,
        #[clap(long)]
        limit: Option<usize>,
        /// Add graph neighbours of the direct hits.
        #[clap(long)]
        expand: bool,
    },
    /// Recall once per kind
    RecallByType {
        #[clap(long)]
        query: String,
        #[clap(long)]
        limit: Option<usize>,
    },
    /// Show one entry with its edges
    Get {
        #[clap(long)]
        name: String,
    },
    /// Create or strengthen a relationship
    Edge {
        #[clap(long)]
        from: String,
        #[clap(long)]
        to: String,
        /// solves | causes | prevents | supersedes | related | co_occurs
        #[clap(long = "type")]
        rel_type: String,
        #[clap(long)]
        weight: Option<f64>,
    },
    /// List edges touching an entry
    Edges {
        #[clap(long)]
        name: String,
        #[clap(long = "type")]
        rel_type: Option<String>,
    },
    /// Walk the graph outward from seed entries
    Traverse {
        /// Seed entry names (repeatable).
        #[clap(long = "seed", required = true)]
        seeds: Vec<String>,
        #[clap(long)]
        depth: Option<usize>,
        #[clap(long)]
        floor: Option<f64>,
    },
    /// Record that entries helped (positive) or failed (negative)
    Feedback {
        /// Entry names (repeatable).
        #[clap(long = "name", required = true)]
        names: Vec<String>,
        #[clap(long, allow_hyphen_values = true)]
        delta: f64,
    },
    /// Halve importance of stale, rarely used entries
    Decay {
        #[clap(long, default_value_t = 30.0)]
        unused_days: f64,
        #[clap(long, default_value_t = 2.0)]
        min_uses: f64,
    },
    /// Remove ineffective or unimportant entries and enforce capacity
    Prune {
        #[clap(long, default_value_t = 0.3)]
        min_effectiveness: f64,
        #[clap(long, default_value_t = 3.0)]
        min_uses: f64,
    },
    /// Merge near-duplicate entries of the same kind
    Consolidate {
        #[clap(long)]
        threshold: Option<f64>,
    },
    /// Store statistics and backend status
    Health,
}

#[derive(clap::Args, Debug)]
pub(crate) struct CampaignCli {
    #[clap(subcommand)]
    pub command: CampaignCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CampaignCommand {
    /// Open a campaign for an objective
    Create {
        #[clap(long)]
        objective: String,
    },
    /// Show a campaign with its tasks
    Get {
        #[clap(long)]
        id: String,
    },
    /// List campaigns
    List {
        /// active | complete | failed
        #[clap(long)]
        status: Option<String>,
    },
    /// Rank previous campaigns by objective similarity
    Similar {
        #[clap(long)]
        objective: String,
        #[clap(long, default_value_t = 5)]
        limit: usize,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct SchedulerCli {
    #[clap(subcommand)]
    pub command: SchedulerCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum SchedulerCommand {
    /// Add a batch of task specs (JSON array) to a campaign
    AddTasks {
        #[clap(long)]
        campaign: String,
        /// Path to the JSON batch, or `-` for stdin.
        #[clap(long)]
        file: PathBuf,
    },
    /// List tasks of a campaign
    Tasks {
        #[clap(long)]
        campaign: String,
        /// pending | in_progress | complete | blocked
        #[clap(long)]
        status: Option<String>,
    },
    /// Pending tasks whose dependencies are all complete
    Ready {
        #[clap(long)]
        campaign: String,
    },
    /// Blocked and unreachable work
    Cascade {
        #[clap(long)]
        campaign: String,
    },
    /// Persist cascade blocks for unreachable tasks
    Propagate {
        #[clap(long)]
        campaign: String,
    },
    /// Bundle for the planner when stranded work crosses the threshold
    ReplanInput {
        #[clap(long)]
        campaign: String,
        #[clap(long)]
        threshold: Option<usize>,
    },
    /// Merge a revised plan (JSON array) into the campaign
    MergePlan {
        #[clap(long)]
        campaign: String,
        /// Path to the JSON batch, or `-` for stdin.
        #[clap(long)]
        file: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct WorkspaceCli {
    #[clap(subcommand)]
    pub command: WorkspaceCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum WorkspaceCommand {
    /// Start a task and record its execution contract
    Create {
        #[clap(long)]
        campaign: String,
        #[clap(long)]
        seq: String,
        /// Verification command the builder must run.
        #[clap(long)]
        verify: Option<String>,
        /// Explicit workspace id (generated when omitted).
        #[clap(long)]
        id: Option<String>,
    },
    /// Close a workspace as delivered
    Complete {
        #[clap(long)]
        id: String,
        #[clap(long)]
        delivered: String,
        /// Prior-knowledge names that were used (repeatable).
        #[clap(long)]
        utilized: Vec<String>,
        /// Paths the builder changed (repeatable).
        #[clap(long)]
        touched: Vec<String>,
    },
    /// Close a workspace as blocked and record the failure
    Block {
        #[clap(long)]
        id: String,
        #[clap(long)]
        reason: String,
    },
    /// Show one workspace
    Get {
        #[clap(long)]
        id: String,
    },
    /// List workspaces
    List {
        #[clap(long)]
        campaign: Option<String>,
        /// active | complete | blocked
        #[clap(long)]
        status: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct QuorumCli {
    #[clap(subcommand)]
    pub command: QuorumCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum QuorumCommand {
    /// Open a session expecting several worker reports
    Open {
        #[clap(long)]
        label: String,
        #[clap(long)]
        expected: u32,
        #[clap(long)]
        quorum: u32,
        #[clap(long, default_value_t = 600)]
        timeout_secs: u64,
    },
    /// Submit one worker's report
    Report {
        #[clap(long)]
        session: String,
        #[clap(long)]
        worker: String,
        /// JSON payload.
        #[clap(long, default_value = "{}")]
        payload: String,
    },
    /// Evaluate a session without waiting
    Status {
        #[clap(long)]
        session: String,
    },
    /// Block until quorum, completion, or the deadline
    Wait {
        #[clap(long)]
        session: String,
        #[clap(long, default_value_t = 500)]
        poll_ms: u64,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct BrokerCli {
    #[clap(subcommand)]
    pub command: BrokerCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum BrokerCommand {
    /// Show the audit log of brokered mutations.
    Audit {
        /// Only the last N events.
        #[clap(long)]
        tail: Option<usize>,
    },
}
