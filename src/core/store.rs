//! Store handle for cairn's on-disk state.
//!
//! A store is the `.cairn/data` directory of a project. Every subsystem
//! (knowledge, campaigns, quorum sessions) keeps its databases and event logs
//! underneath it.

use crate::core::error::CairnError;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the project marker directory.
pub const CAIRN_DIR: &str = ".cairn";

/// Store handle representing a cairn state directory.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the store root directory (`<project>/.cairn/data`)
    pub root: PathBuf,
}

impl Store {
    /// Store rooted at `<project_root>/.cairn/data`.
    pub fn for_project(project_root: &Path) -> Self {
        Self {
            root: project_root.join(CAIRN_DIR).join("data"),
        }
    }

    /// Store rooted at an explicit data directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The `.cairn` directory holding config and data.
    pub fn cairn_dir(&self) -> PathBuf {
        self.root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone())
    }

    pub fn ensure_dirs(&self) -> Result<(), CairnError> {
        fs::create_dir_all(&self.root).map_err(CairnError::IoError)
    }
}

/// Walk up from `start_dir` to the nearest directory containing `.cairn/`.
pub fn find_project_root(start_dir: &Path) -> Result<PathBuf, CairnError> {
    let mut current_dir = PathBuf::from(start_dir);
    loop {
        if current_dir.join(CAIRN_DIR).exists() {
            return Ok(current_dir);
        }
        if !current_dir.pop() {
            return Err(CairnError::NotFound(
                "'.cairn' directory not found in current or parent directories. Run `cairn init` first.".to_string(),
            ));
        }
    }
}
