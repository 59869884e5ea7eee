use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CairnError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Failed to initialize database: {0}")]
    DatabaseInitializationError(String),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("Scope violation in workspace {workspace}: outside delta: {}", outside.join(", "))]
    ScopeViolation {
        workspace: String,
        outside: Vec<String>,
    },
    #[error("Invalid transition for {subject}: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },
    #[error("Malformed stored data in {location}: {detail}")]
    MalformedRecord { location: String, detail: String },
    #[error("Similarity backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl CairnError {
    /// Stable machine-readable label used in error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            CairnError::RusqliteError(_) => "sqlite",
            CairnError::IoError(_) => "io",
            CairnError::JsonError(_) => "json",
            CairnError::DatabaseInitializationError(_) => "database_init",
            CairnError::ConfigError(_) => "config",
            CairnError::ValidationError(_) => "validation",
            CairnError::NotFound(_) => "not_found",
            CairnError::Cycle { .. } => "cycle",
            CairnError::ScopeViolation { .. } => "scope_violation",
            CairnError::InvalidTransition { .. } => "invalid_transition",
            CairnError::MalformedRecord { .. } => "malformed_record",
            CairnError::BackendUnavailable(_) => "backend_unavailable",
        }
    }

    /// Structural errors exit with 2, environment failures with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            CairnError::RusqliteError(_)
            | CairnError::IoError(_)
            | CairnError::DatabaseInitializationError(_)
            | CairnError::BackendUnavailable(_) => 1,
            _ => 2,
        }
    }

    pub fn details(&self) -> serde_json::Value {
        match self {
            CairnError::Cycle { path } => serde_json::json!({ "cycle": path }),
            CairnError::ScopeViolation { workspace, outside } => serde_json::json!({
                "workspace": workspace,
                "outside": outside,
            }),
            CairnError::InvalidTransition { subject, from, to } => serde_json::json!({
                "subject": subject,
                "from": from,
                "to": to,
            }),
            _ => serde_json::json!({}),
        }
    }
}
