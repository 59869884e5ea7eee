//! Runtime handle threaded through every operation.
//!
//! Holds the store, the loaded configuration, and the similarity backend that
//! was selected once at startup. There is no ambient "current campaign":
//! campaign and workspace ids are passed explicitly to each call.

use crate::core::broker::DbBroker;
use crate::core::config::CairnConfig;
use crate::core::db;
use crate::core::error::CairnError;
use crate::core::similarity::{self, SimilarityBackend};
use crate::core::store::Store;
use std::path::PathBuf;

pub struct Runtime {
    pub store: Store,
    pub config: CairnConfig,
    backend: Box<dyn SimilarityBackend>,
    fallback_reason: Option<String>,
}

impl Runtime {
    /// Load config from the store's `.cairn` directory and open all bins.
    pub fn open(store: Store) -> Result<Self, CairnError> {
        let config = CairnConfig::load(&store.cairn_dir())?;
        Self::with_config(store, config)
    }

    pub fn with_config(store: Store, config: CairnConfig) -> Result<Self, CairnError> {
        config.validate()?;
        let selected = similarity::select_backend(&config.embedding);
        Self::assemble(store, config, selected.backend, selected.fallback_reason)
    }

    /// Open with an explicitly constructed backend (no warm-up probe).
    pub fn with_backend(
        store: Store,
        config: CairnConfig,
        backend: Box<dyn SimilarityBackend>,
    ) -> Result<Self, CairnError> {
        config.validate()?;
        Self::assemble(store, config, backend, None)
    }

    fn assemble(
        store: Store,
        config: CairnConfig,
        backend: Box<dyn SimilarityBackend>,
        fallback_reason: Option<String>,
    ) -> Result<Self, CairnError> {
        store.ensure_dirs()?;
        db::initialize_all(&store.root)?;
        tracing::debug!(
            root = %store.root.display(),
            backend = backend.name(),
            "runtime opened"
        );
        Ok(Self {
            store,
            config,
            backend,
            fallback_reason,
        })
    }

    pub fn backend(&self) -> &dyn SimilarityBackend {
        self.backend.as_ref()
    }

    /// Why the configured semantic backend was replaced, if it was.
    pub fn fallback_reason(&self) -> Option<&str> {
        self.fallback_reason.as_deref()
    }

    pub fn broker(&self) -> DbBroker {
        DbBroker::new(&self.store.root)
    }

    pub fn knowledge_db(&self) -> PathBuf {
        db::knowledge_db_path(&self.store.root)
    }

    pub fn campaign_db(&self) -> PathBuf {
        db::campaign_db_path(&self.store.root)
    }

    /// Deployment-wide embedding length used to validate stored blobs.
    pub fn embedding_dimension(&self) -> usize {
        self.config.embedding.dimension
    }
}
