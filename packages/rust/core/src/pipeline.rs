//! End-to-end refresh pipeline: provision → scrape → update.
//!
//! A run is an ordered list of [`Step`]s, each with the paths it needs and
//! the paths it promises to produce. [`run_pipeline`] executes them in order
//! and stops at the first failure.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{info, instrument};

use bibsync_shared::{
    AppConfig, BibsyncError, EnvironmentConfig, Result, RunId, ScrapeMode, StepKind,
};

use crate::provision::{self, ProvisionOptions, ProvisionOutcome};
use crate::runner::{self, CommandLine, Transcript};

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One external process in the pipeline.
#[derive(Debug, Clone)]
pub struct Step {
    pub kind: StepKind,
    pub command: CommandLine,
    /// Must exist before the step starts.
    pub inputs: Vec<PathBuf>,
    /// Must exist after the step succeeds.
    pub outputs: Vec<PathBuf>,
    /// Transcript of stdout and stderr, truncated each run.
    pub log: PathBuf,
}

/// Everything needed to execute one refresh.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    /// Directory commands run in; relative paths resolve against it.
    pub root: PathBuf,
    pub environment: EnvironmentConfig,
    pub steps: Vec<Step>,
    /// Mirror child output on the terminal.
    pub echo: bool,
}

impl PipelinePlan {
    /// Build the scrape and update steps from `config`.
    ///
    /// `builtin_updater` is used when `[updater] command` is empty; it
    /// receives the same three positional paths as an external updater.
    pub fn from_config(
        config: &AppConfig,
        root: &Path,
        mode: ScrapeMode,
        builtin_updater: Option<CommandLine>,
    ) -> Result<Self> {
        let paths = &config.paths;

        let scrape = Step {
            kind: StepKind::Scrape,
            command: scraper_command(config, mode)?.resolved_in(root),
            inputs: Vec::new(),
            outputs: vec![root.join(&paths.scraped)],
            log: root.join(&paths.scraper_log),
        };

        let updater = match CommandLine::from_argv(&config.updater.command) {
            Some(command) => command,
            None => builtin_updater.ok_or_else(|| {
                BibsyncError::config("no updater configured and no built-in merge available")
            })?,
        };
        let update = Step {
            kind: StepKind::Update,
            command: updater
                .resolved_in(root)
                .arg(paths.bibliography.to_string_lossy())
                .arg(paths.destination().to_string_lossy())
                .arg(paths.scraped.to_string_lossy()),
            inputs: vec![root.join(&paths.bibliography), root.join(&paths.scraped)],
            outputs: vec![root.join(paths.destination())],
            log: root.join(&paths.updater_log),
        };

        Ok(Self {
            root: root.to_path_buf(),
            environment: config.environment.clone(),
            steps: vec![scrape, update],
            echo: config.output.echo,
        })
    }
}

/// Scraper argv for `mode`: the configured command, plus the download flag
/// when downloading.
pub fn scraper_command(config: &AppConfig, mode: ScrapeMode) -> Result<CommandLine> {
    let command = CommandLine::from_argv(&config.scraper.command)
        .ok_or_else(|| BibsyncError::config("[scraper] command must not be empty"))?;
    Ok(match mode {
        ScrapeMode::Local => command,
        ScrapeMode::Download => command.arg(config.scraper.download_flag.clone()),
    })
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when an external step exits successfully.
    fn step_finished(&self, kind: StepKind, elapsed: Duration);
    /// Called when the pipeline completes.
    fn done(&self, result: &PipelineResult);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn step_finished(&self, _kind: StepKind, _elapsed: Duration) {}
    fn done(&self, _result: &PipelineResult) {}
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Summary of one executed step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub kind: StepKind,
    pub log: PathBuf,
    pub output_bytes: u64,
    pub elapsed: Duration,
}

/// Result of a successful pipeline run.
#[derive(Debug)]
pub struct PipelineResult {
    pub run_id: RunId,
    pub provision: ProvisionOutcome,
    pub steps: Vec<StepReport>,
    pub elapsed: Duration,
}

/// Provision, then run every step of `plan` in order.
///
/// The first failing step aborts the run; later steps never start.
#[instrument(skip_all, fields(root = %plan.root.display(), steps = plan.steps.len()))]
pub async fn run_pipeline(
    plan: &PipelinePlan,
    progress: &dyn ProgressReporter,
) -> Result<PipelineResult> {
    let start = Instant::now();
    let run_id = RunId::new();
    info!(%run_id, "starting pipeline");

    progress.phase("Provisioning environment");
    let provision = provision::provision(
        &plan.environment,
        &plan.root,
        &ProvisionOptions {
            force: false,
            echo: plan.echo,
        },
        progress,
    )
    .await?;

    let mut steps = Vec::with_capacity(plan.steps.len());
    for step in &plan.steps {
        progress.phase(phase_name(step.kind));
        let report = run_step(step, &plan.root, plan.echo).await?;
        progress.step_finished(step.kind, report.elapsed);
        steps.push(report);
    }

    let result = PipelineResult {
        run_id,
        provision,
        steps,
        elapsed: start.elapsed(),
    };
    info!(
        run_id = %result.run_id,
        elapsed_ms = result.elapsed.as_millis(),
        "pipeline complete"
    );
    progress.done(&result);
    Ok(result)
}

/// Check inputs, run the command with its transcript, check outputs.
async fn run_step(step: &Step, root: &Path, echo: bool) -> Result<StepReport> {
    let name = step.kind.as_str();

    if let Some(missing) = step.inputs.iter().find(|p| !p.exists()) {
        return Err(BibsyncError::MissingInput {
            step: name.to_string(),
            path: missing.clone(),
        });
    }

    let transcript = Transcript {
        log: Some(step.log.clone()),
        echo,
    };
    let run = runner::run_command(name, &step.command, root, &transcript).await?;

    if let Some(missing) = step.outputs.iter().find(|p| !p.exists()) {
        return Err(BibsyncError::MissingOutput {
            step: name.to_string(),
            path: missing.clone(),
        });
    }

    Ok(StepReport {
        kind: step.kind,
        log: step.log.clone(),
        output_bytes: run.output_bytes,
        elapsed: run.elapsed,
    })
}

fn phase_name(kind: StepKind) -> &'static str {
    match kind {
        StepKind::Provision => "Provisioning environment",
        StepKind::Scrape => "Scraping bibliography",
        StepKind::Update => "Updating bibliography",
    }
}
