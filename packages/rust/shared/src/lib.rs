//! Shared types, error model, and configuration for bibsync.
//!
//! This crate is the foundation depended on by all other bibsync crates.
//! It provides:
//! - [`BibsyncError`], the unified error type
//! - Domain types ([`ProvisionState`], [`RunId`], [`StepKind`], [`ScrapeMode`])
//! - Configuration ([`AppConfig`] and its sections, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CONFIG_FILE_NAME, EnvironmentConfig, OutputConfig, PathsConfig, ScraperConfig,
    UpdaterConfig, init_config, load_config, load_config_from,
};
pub use error::{BibsyncError, Result};
pub use types::{
    ProvisionState, RunId, STATE_SCHEMA_VERSION, ScrapeMode, StateRecord, StepKind,
};
