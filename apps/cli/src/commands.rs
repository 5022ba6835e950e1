//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bibsync_bibtex::MergeReport;
use bibsync_core::pipeline::{PipelinePlan, PipelineResult, ProgressReporter, SilentProgress};
use bibsync_core::provision::{ProvisionOptions, ProvisionOutcome};
use bibsync_core::runner::CommandLine;
use bibsync_shared::{
    AppConfig, BibsyncError, CONFIG_FILE_NAME, ScrapeMode, StepKind, init_config, load_config,
};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Report, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// bibsync: refresh a bibliography from scraped conference listings.
#[derive(Parser)]
#[command(
    name = "bibsync",
    version,
    about = "Provision, scrape, and merge scraped entries into a BibTeX bibliography.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Project config file.
    #[arg(long, default_value = CONFIG_FILE_NAME, global = true, env = "BIBSYNC_CONFIG")]
    pub config: PathBuf,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only write step output to the log files, showing a spinner instead.
    #[arg(long, global = true)]
    pub no_echo: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Provision, scrape from local data, and update the bibliography.
    NoDownload,

    /// Provision, scrape with fresh downloads, and update the bibliography.
    Download,

    /// Create the scraper environment and install its requirements.
    Provision {
        /// Reinstall even if the requirements are unchanged.
        #[arg(long)]
        force: bool,
    },

    /// Merge a scraped bibliography into an existing one.
    Merge {
        /// Bibliography to read.
        source: PathBuf,
        /// Bibliography to write (may equal the source).
        destination: PathBuf,
        /// Scraped entries to merge in.
        scraped: PathBuf,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "bibsync=info",
        1 => "bibsync=debug",
        _ => "bibsync=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::NoDownload => cmd_refresh(&cli.config, cli.no_echo, ScrapeMode::Local).await,
        Command::Download => cmd_refresh(&cli.config, cli.no_echo, ScrapeMode::Download).await,
        Command::Provision { force } => cmd_provision(&cli.config, cli.no_echo, force).await,
        Command::Merge {
            source,
            destination,
            scraped,
        } => cmd_merge(&source, &destination, &scraped),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(&cli.config),
            ConfigAction::Show => cmd_config_show(&cli.config),
        },
    }
}

/// Exit code for a failed step, or `None` for errors that should be
/// reported by `color-eyre`.
pub(crate) fn step_exit_code(report: &Report) -> Option<u8> {
    match report.downcast_ref::<BibsyncError>()? {
        err @ BibsyncError::StepFailed { .. } => Some(u8::try_from(err.exit_code()).unwrap_or(1)),
        _ => None,
    }
}

/// Load config and apply CLI overrides.
fn resolve_config(path: &Path, no_echo: bool) -> Result<AppConfig> {
    let mut config = load_config(path)?;
    if no_echo {
        config.output.echo = false;
    }
    Ok(config)
}

fn progress_for(config: &AppConfig) -> Box<dyn ProgressReporter> {
    if config.output.echo {
        Box::new(SilentProgress)
    } else {
        Box::new(CliProgress::new())
    }
}

async fn cmd_refresh(config_path: &Path, no_echo: bool, mode: ScrapeMode) -> Result<()> {
    let config = resolve_config(config_path, no_echo)?;
    let root = std::env::current_dir()?;

    // The built-in updater is this binary's `merge` command.
    let exe = std::env::current_exe()?;
    let builtin = CommandLine::new(exe.to_string_lossy(), ["merge"]);

    let plan = PipelinePlan::from_config(&config, &root, mode, Some(builtin))?;
    info!(?mode, root = %root.display(), "refreshing bibliography");

    let reporter = progress_for(&config);
    let result = bibsync_core::run_pipeline(&plan, reporter.as_ref()).await?;

    println!();
    println!("  Bibliography refreshed.");
    println!("  Run:        {}", result.run_id);
    println!("  Provision:  {}", describe_provision(&result.provision));
    for step in &result.steps {
        println!(
            "  {:<10}  {:.1}s, log in {}",
            step.kind.as_str(),
            step.elapsed.as_secs_f64(),
            step.log.display()
        );
    }
    println!("  Time:       {:.1}s", result.elapsed.as_secs_f64());
    println!();

    Ok(())
}

async fn cmd_provision(config_path: &Path, no_echo: bool, force: bool) -> Result<()> {
    let config = resolve_config(config_path, no_echo)?;
    let root = std::env::current_dir()?;
    let options = ProvisionOptions {
        force,
        echo: config.output.echo,
    };

    let reporter = progress_for(&config);
    let start = Instant::now();
    let outcome =
        bibsync_core::provision(&config.environment, &root, &options, reporter.as_ref()).await?;
    reporter.step_finished(StepKind::Provision, start.elapsed());

    println!("Environment {}", describe_provision(&outcome));
    Ok(())
}

fn describe_provision(outcome: &ProvisionOutcome) -> String {
    match outcome {
        ProvisionOutcome::AlreadyProvisioned { .. } => "up to date".to_string(),
        ProvisionOutcome::Provisioned { installs, .. } => {
            format!("provisioned ({installs} requirement files installed)")
        }
    }
}

fn cmd_merge(source: &Path, destination: &Path, scraped: &Path) -> Result<()> {
    let report = bibsync_bibtex::merge_files(source, destination, scraped)?;
    print!("{}", merge_transcript(&report));
    Ok(())
}

/// What `merge` prints: URL collisions, re-keyed entries, the changelog,
/// then the summary line.
fn merge_transcript(report: &MergeReport) -> String {
    let mut out = String::new();
    for url in &report.duplicate_urls {
        out.push_str(&format!("Duplicate URL, not used for matching: {url}\n"));
    }
    for (from, to) in &report.renamed {
        out.push_str(&format!("Re-keyed scraped entry {from} as {to} (same URL)\n"));
    }
    if !report.changelog.is_empty() {
        out.push_str(&report.changelog.render());
    }
    out.push_str(&report.summary());
    out.push('\n');
    out
}

fn cmd_config_init(path: &Path) -> Result<()> {
    init_config(path)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: &Path) -> Result<()> {
    let config: AppConfig = load_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner, for runs that do not
/// echo child output.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})")
                .expect("valid spinner template")
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn step_finished(&self, kind: StepKind, elapsed: Duration) {
        self.spinner
            .println(format!("  done: {kind} ({:.1}s)", elapsed.as_secs_f64()));
    }

    fn done(&self, _result: &PipelineResult) {
        self.spinner.finish_and_clear();
    }
}

impl Drop for CliProgress {
    fn drop(&mut self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}
