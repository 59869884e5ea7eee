//! Core modules shared by every cairn subsystem.
//!
//! Storage, the write broker, configuration, similarity backends, and the
//! runtime handle that ties them together.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod output;
pub mod runtime;
pub mod schemas;
pub mod similarity;
pub mod store;
pub mod time;
