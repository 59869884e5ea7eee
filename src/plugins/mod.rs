//! Subsystems built on the core store.
//!
//! - `knowledge`: scored entries, recall, feedback and lifecycle
//! - `graph`: typed relationships between knowledge entries
//! - `scheduler`: campaigns, task graphs, readiness, cascade and re-planning
//! - `workspace`: per-task execution contracts
//! - `quorum`: bounded waiting on parallel workers

pub mod graph;
pub mod knowledge;
pub mod quorum;
pub mod scheduler;
pub mod workspace;
