//! Centralized database schema definitions for cairn's SQLite bins.
//!
//! cairn keeps two bins under the store root:
//! 1. knowledge.db: scored knowledge entries, the relationship graph, and its event log.
//! 2. campaign.db: campaigns, tasks, workspaces, quorum sessions, and their event log.
//!
//! Both are append-audited through `broker.events.jsonl`.

pub const SCHEMA_META: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

// --- 1. Knowledge Bin ---
pub const KNOWLEDGE_DB_NAME: &str = "knowledge.db";
pub const KNOWLEDGE_SCHEMA_VERSION: u32 = 1;

pub const KNOWLEDGE_DB_SCHEMA_ENTRIES: &str = "
    CREATE TABLE IF NOT EXISTS entries (
        name TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        trigger_text TEXT NOT NULL,
        resolution TEXT NOT NULL DEFAULT '',
        cost_or_saved INTEGER NOT NULL DEFAULT 0,
        embedding BLOB,
        source TEXT NOT NULL DEFAULT '[]', -- JSON array of task ids
        created_at TEXT NOT NULL,
        last_used TEXT NOT NULL,
        helped REAL NOT NULL DEFAULT 0 CHECK (helped >= 0),
        failed REAL NOT NULL DEFAULT 0 CHECK (failed >= 0),
        importance REAL NOT NULL DEFAULT 1.0 CHECK (importance >= 0 AND importance <= 1)
    )
";
pub const KNOWLEDGE_DB_SCHEMA_INDEX_KIND: &str =
    "CREATE INDEX IF NOT EXISTS idx_entries_kind ON entries(kind)";

pub const KNOWLEDGE_DB_SCHEMA_EDGES: &str = "
    CREATE TABLE IF NOT EXISTS edges (
        from_name TEXT NOT NULL,
        to_name TEXT NOT NULL,
        rel_type TEXT NOT NULL,
        weight REAL NOT NULL CHECK (weight > 0 AND weight <= 1.5),
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (from_name, to_name, rel_type),
        FOREIGN KEY(from_name) REFERENCES entries(name) ON DELETE CASCADE,
        FOREIGN KEY(to_name) REFERENCES entries(name) ON DELETE CASCADE
    )
";
pub const KNOWLEDGE_DB_SCHEMA_INDEX_EDGES_TO: &str =
    "CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(to_name)";

pub const KNOWLEDGE_DB_SCHEMA_EVENTS: &str = "
    CREATE TABLE IF NOT EXISTS knowledge_events (
        event_id TEXT PRIMARY KEY,
        ts TEXT NOT NULL,
        op TEXT NOT NULL,
        name TEXT,
        payload TEXT NOT NULL
    )
";

// --- 2. Campaign Bin ---
pub const CAMPAIGN_DB_NAME: &str = "campaign.db";
pub const CAMPAIGN_SCHEMA_VERSION: u32 = 1;

pub const CAMPAIGN_DB_SCHEMA_CAMPAIGNS: &str = "
    CREATE TABLE IF NOT EXISTS campaigns (
        id TEXT PRIMARY KEY,
        objective TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        fingerprint TEXT NOT NULL,
        embedding BLOB,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

pub const CAMPAIGN_DB_SCHEMA_TASKS: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        campaign_id TEXT NOT NULL,
        seq TEXT NOT NULL,
        slug TEXT NOT NULL,
        kind TEXT NOT NULL,
        goal TEXT,
        delta TEXT NOT NULL DEFAULT '[]',   -- JSON array of resource paths
        depends TEXT NOT NULL DEFAULT '[]', -- JSON array of seqs (AND semantics)
        status TEXT NOT NULL DEFAULT 'pending',
        budget INTEGER,
        revision INTEGER NOT NULL DEFAULT 1,
        blocked_by TEXT,
        block_reason TEXT,
        cascade INTEGER NOT NULL DEFAULT 0,
        summary TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (campaign_id, seq),
        FOREIGN KEY(campaign_id) REFERENCES campaigns(id) ON DELETE CASCADE
    )
";
pub const CAMPAIGN_DB_SCHEMA_INDEX_TASK_STATUS: &str =
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(campaign_id, status)";

pub const CAMPAIGN_DB_SCHEMA_TASK_HISTORY: &str = "
    CREATE TABLE IF NOT EXISTS task_history (
        campaign_id TEXT NOT NULL,
        seq TEXT NOT NULL,
        revision INTEGER NOT NULL,
        snapshot TEXT NOT NULL, -- JSON of the superseded task row
        superseded_at TEXT NOT NULL,
        PRIMARY KEY (campaign_id, seq, revision)
    )
";

pub const CAMPAIGN_DB_SCHEMA_WORKSPACES: &str = "
    CREATE TABLE IF NOT EXISTS workspaces (
        id TEXT PRIMARY KEY,
        campaign_id TEXT NOT NULL,
        task_seq TEXT NOT NULL,
        task_revision INTEGER NOT NULL,
        objective TEXT NOT NULL,
        delta TEXT NOT NULL,
        verify TEXT NOT NULL,
        prior_knowledge TEXT NOT NULL DEFAULT '[]',
        lineage TEXT NOT NULL DEFAULT '[]',
        delivered TEXT,
        utilized TEXT NOT NULL DEFAULT '[]',
        touched TEXT NOT NULL DEFAULT '[]',
        block_reason TEXT,
        status TEXT NOT NULL DEFAULT 'active',
        created_at TEXT NOT NULL,
        closed_at TEXT,
        FOREIGN KEY(campaign_id, task_seq) REFERENCES tasks(campaign_id, seq)
    )
";
pub const CAMPAIGN_DB_SCHEMA_INDEX_WORKSPACE_CAMPAIGN: &str =
    "CREATE INDEX IF NOT EXISTS idx_workspaces_campaign ON workspaces(campaign_id, status)";

pub const CAMPAIGN_DB_SCHEMA_QUORUM_SESSIONS: &str = "
    CREATE TABLE IF NOT EXISTS quorum_sessions (
        id TEXT PRIMARY KEY,
        label TEXT NOT NULL,
        expected INTEGER NOT NULL,
        quorum INTEGER NOT NULL,
        timeout_secs INTEGER NOT NULL,
        opened_at TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'open',
        outcome TEXT
    )
";

pub const CAMPAIGN_DB_SCHEMA_QUORUM_REPORTS: &str = "
    CREATE TABLE IF NOT EXISTS quorum_reports (
        session_id TEXT NOT NULL,
        worker TEXT NOT NULL,
        payload TEXT NOT NULL,
        reported_at TEXT NOT NULL,
        PRIMARY KEY (session_id, worker),
        FOREIGN KEY(session_id) REFERENCES quorum_sessions(id) ON DELETE CASCADE
    )
";

pub const CAMPAIGN_DB_SCHEMA_EVENTS: &str = "
    CREATE TABLE IF NOT EXISTS campaign_events (
        event_id TEXT PRIMARY KEY,
        ts TEXT NOT NULL,
        event_type TEXT NOT NULL,
        campaign_id TEXT,
        subject TEXT,
        payload TEXT NOT NULL
    )
";
pub const CAMPAIGN_DB_SCHEMA_INDEX_EVENTS_CAMPAIGN: &str =
    "CREATE INDEX IF NOT EXISTS idx_campaign_events_campaign ON campaign_events(campaign_id)";
