use crate::core::broker::DbBroker;
use crate::core::error;
use crate::core::schemas;
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};

pub fn db_connect(db_path: &str) -> Result<Connection, error::CairnError> {
    db_connect_with_timeout(db_path, 5)
}

pub fn db_connect_with_timeout(
    db_path: &str,
    busy_timeout_secs: u64,
) -> Result<Connection, error::CairnError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(busy_timeout_secs))
        .map_err(error::CairnError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::CairnError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::CairnError::RusqliteError)?;
    Ok(conn)
}

pub fn knowledge_db_path(root: &Path) -> PathBuf {
    root.join(schemas::KNOWLEDGE_DB_NAME)
}

pub fn campaign_db_path(root: &Path) -> PathBuf {
    root.join(schemas::CAMPAIGN_DB_NAME)
}

pub fn schema_version(conn: &Connection) -> Result<u32, error::CairnError> {
    conn.execute(schemas::SCHEMA_META, [])?;
    let current: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(error::CairnError::RusqliteError)?;
    Ok(current
        .as_deref()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), error::CairnError> {
    conn.execute(
        "INSERT INTO meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [version.to_string()],
    )?;
    Ok(())
}

fn ensure_knowledge_schema(conn: &Connection) -> Result<(), error::CairnError> {
    if schema_version(conn)? >= schemas::KNOWLEDGE_SCHEMA_VERSION {
        return Ok(());
    }
    conn.execute(schemas::KNOWLEDGE_DB_SCHEMA_ENTRIES, [])?;
    conn.execute(schemas::KNOWLEDGE_DB_SCHEMA_INDEX_KIND, [])?;
    conn.execute(schemas::KNOWLEDGE_DB_SCHEMA_EDGES, [])?;
    conn.execute(schemas::KNOWLEDGE_DB_SCHEMA_INDEX_EDGES_TO, [])?;
    conn.execute(schemas::KNOWLEDGE_DB_SCHEMA_EVENTS, [])?;
    set_schema_version(conn, schemas::KNOWLEDGE_SCHEMA_VERSION)
}

fn ensure_campaign_schema(conn: &Connection) -> Result<(), error::CairnError> {
    if schema_version(conn)? >= schemas::CAMPAIGN_SCHEMA_VERSION {
        return Ok(());
    }
    conn.execute(schemas::CAMPAIGN_DB_SCHEMA_CAMPAIGNS, [])?;
    conn.execute(schemas::CAMPAIGN_DB_SCHEMA_TASKS, [])?;
    conn.execute(schemas::CAMPAIGN_DB_SCHEMA_INDEX_TASK_STATUS, [])?;
    conn.execute(schemas::CAMPAIGN_DB_SCHEMA_TASK_HISTORY, [])?;
    conn.execute(schemas::CAMPAIGN_DB_SCHEMA_WORKSPACES, [])?;
    conn.execute(schemas::CAMPAIGN_DB_SCHEMA_INDEX_WORKSPACE_CAMPAIGN, [])?;
    conn.execute(schemas::CAMPAIGN_DB_SCHEMA_QUORUM_SESSIONS, [])?;
    conn.execute(schemas::CAMPAIGN_DB_SCHEMA_QUORUM_REPORTS, [])?;
    conn.execute(schemas::CAMPAIGN_DB_SCHEMA_EVENTS, [])?;
    conn.execute(schemas::CAMPAIGN_DB_SCHEMA_INDEX_EVENTS_CAMPAIGN, [])?;
    set_schema_version(conn, schemas::CAMPAIGN_SCHEMA_VERSION)
}

pub fn initialize_knowledge_db(root: &Path) -> Result<(), error::CairnError> {
    std::fs::create_dir_all(root).map_err(error::CairnError::IoError)?;
    let db_path = knowledge_db_path(root);
    let broker = DbBroker::new(root);
    broker.with_write(&db_path, "knowledge.init", ensure_knowledge_schema)?;
    tracing::debug!(path = %db_path.display(), "knowledge database ready");
    Ok(())
}

pub fn initialize_campaign_db(root: &Path) -> Result<(), error::CairnError> {
    std::fs::create_dir_all(root).map_err(error::CairnError::IoError)?;
    let db_path = campaign_db_path(root);
    let broker = DbBroker::new(root);
    broker.with_write(&db_path, "campaign.init", ensure_campaign_schema)?;
    tracing::debug!(path = %db_path.display(), "campaign database ready");
    Ok(())
}

/// Initialize every bin under the store root.
pub fn initialize_all(root: &Path) -> Result<(), error::CairnError> {
    initialize_knowledge_db(root)?;
    initialize_campaign_db(root)
}

/// Decode a JSON payload column, naming the column on failure.
pub fn decode_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    location: &str,
) -> Result<T, error::CairnError> {
    serde_json::from_str(raw).map_err(|e| error::CairnError::MalformedRecord {
        location: location.to_string(),
        detail: e.to_string(),
    })
}
