//! Runtime configuration loaded from `.cairn/config.toml`.
//!
//! A missing file means defaults. Unknown keys are rejected so a typo never
//! silently falls back to a default threshold.

use crate::core::error::CairnError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const BACKEND_ENV: &str = "CAIRN_EMBEDDING_BACKEND";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Local character/word n-gram feature hashing.
    Ngram,
    /// External process: text on stdin, JSON float array on stdout.
    Command,
    /// Token-overlap similarity; no embeddings are stored.
    Lexical,
}

impl std::str::FromStr for BackendChoice {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ngram" => Ok(BackendChoice::Ngram),
            "command" => Ok(BackendChoice::Command),
            "lexical" => Ok(BackendChoice::Lexical),
            other => Err(CairnError::ConfigError(format!(
                "unknown embedding backend '{}' (expected ngram|command|lexical)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingConfig {
    pub backend: BackendChoice,
    pub dimension: usize,
    /// Program and arguments for the `command` backend.
    pub command: Vec<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: BackendChoice::Ngram,
            dimension: 256,
            command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KnowledgeConfig {
    pub dedup_threshold: f64,
    pub min_relevance: f64,
    pub recall_limit: usize,
    pub expand_depth: usize,
    pub expand_floor: f64,
    pub failure_capacity: usize,
    pub pattern_capacity: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            dedup_threshold: 0.85,
            min_relevance: 0.1,
            recall_limit: 5,
            expand_depth: 2,
            expand_floor: 0.5,
            failure_capacity: 500,
            pattern_capacity: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub replan_threshold: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { replan_threshold: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceConfig {
    pub default_verify: String,
    pub knowledge_limit: usize,
    /// Fraction of a task's token budget that injected knowledge may occupy.
    pub knowledge_budget_share: f64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            default_verify: "cargo test".to_string(),
            knowledge_limit: 8,
            knowledge_budget_share: 0.25,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CairnConfig {
    pub embedding: EmbeddingConfig,
    pub knowledge: KnowledgeConfig,
    pub scheduler: SchedulerConfig,
    pub workspace: WorkspaceConfig,
}

impl CairnConfig {
    /// Load `<cairn_dir>/config.toml`, then apply environment overrides.
    pub fn load(cairn_dir: &Path) -> Result<Self, CairnError> {
        let path = cairn_dir.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            let content = fs::read_to_string(&path).map_err(CairnError::IoError)?;
            Self::parse(&content)
                .map_err(|e| CairnError::ConfigError(format!("{}: {}", path.display(), e)))?
        } else {
            CairnConfig::default()
        };

        if let Ok(raw) = std::env::var(BACKEND_ENV) {
            config.embedding.backend = raw.parse()?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, CairnError> {
        let config: CairnConfig =
            toml::from_str(content).map_err(|e| CairnError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CairnError> {
        let k = &self.knowledge;
        if !(0.0..=1.0).contains(&k.dedup_threshold) {
            return Err(CairnError::ConfigError(format!(
                "knowledge.dedup_threshold must be within [0, 1], got {}",
                k.dedup_threshold
            )));
        }
        if !(0.0..=1.0).contains(&k.min_relevance) {
            return Err(CairnError::ConfigError(format!(
                "knowledge.min_relevance must be within [0, 1], got {}",
                k.min_relevance
            )));
        }
        if k.expand_floor <= 0.0 {
            return Err(CairnError::ConfigError(
                "knowledge.expand_floor must be positive".to_string(),
            ));
        }
        if self.embedding.dimension == 0 {
            return Err(CairnError::ConfigError(
                "embedding.dimension must be positive".to_string(),
            ));
        }
        if self.embedding.backend == BackendChoice::Command && self.embedding.command.is_empty() {
            return Err(CairnError::ConfigError(
                "embedding.backend = \"command\" requires embedding.command".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.workspace.knowledge_budget_share) {
            return Err(CairnError::ConfigError(format!(
                "workspace.knowledge_budget_share must be within [0, 1], got {}",
                self.workspace.knowledge_budget_share
            )));
        }
        if self.scheduler.replan_threshold == 0 {
            return Err(CairnError::ConfigError(
                "scheduler.replan_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Default file written by `cairn init`.
    pub fn default_toml() -> Result<String, CairnError> {
        toml::to_string_pretty(&CairnConfig::default())
            .map_err(|e| CairnError::ConfigError(e.to_string()))
    }
}
