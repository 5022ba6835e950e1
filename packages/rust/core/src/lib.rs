//! Pipeline orchestration for bibsync.
//!
//! This crate provisions the dependency environment, runs the scraper and
//! updater as child processes with their output tee'd into transcript logs,
//! and ties them together into the `download` / `no-download` workflows.

pub mod pipeline;
pub mod provision;
pub mod runner;

pub use pipeline::{
    PipelinePlan, PipelineResult, ProgressReporter, SilentProgress, Step, StepReport,
    run_pipeline, scraper_command,
};
pub use provision::{ProvisionOptions, ProvisionOutcome, provision};
pub use runner::{CommandLine, Transcript, run_command};
