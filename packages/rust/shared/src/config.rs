//! Application configuration for bibsync.
//!
//! Project config lives at `./bibsync.toml`, next to the bibliography it
//! maintains. CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BibsyncError, Result};

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "bibsync.toml";

// ---------------------------------------------------------------------------
// Config structs (matching bibsync.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Files passed between the pipeline steps.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Dependency environment provisioning.
    #[serde(default)]
    pub environment: EnvironmentConfig,

    /// Scraper invocation.
    #[serde(default)]
    pub scraper: ScraperConfig,

    /// Updater invocation.
    #[serde(default)]
    pub updater: UpdaterConfig,

    /// Terminal output behaviour.
    #[serde(default)]
    pub output: OutputConfig,
}

/// `[paths]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Bibliography read by the updater.
    #[serde(default = "default_bibliography")]
    pub bibliography: PathBuf,

    /// Bibliography written by the updater. Unset means `bibliography`,
    /// updated in place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,

    /// Scraper output consumed by the updater.
    #[serde(default = "default_scraped")]
    pub scraped: PathBuf,

    /// Transcript of the scraper run.
    #[serde(default = "default_scraper_log")]
    pub scraper_log: PathBuf,

    /// Transcript of the updater run.
    #[serde(default = "default_updater_log")]
    pub updater_log: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            bibliography: default_bibliography(),
            destination: None,
            scraped: default_scraped(),
            scraper_log: default_scraper_log(),
            updater_log: default_updater_log(),
        }
    }
}

impl PathsConfig {
    /// Where the updater writes the merged bibliography.
    pub fn destination(&self) -> &Path {
        self.destination.as_deref().unwrap_or(self.bibliography.as_path())
    }
}

fn default_bibliography() -> PathBuf {
    "sec.bib".into()
}
fn default_scraped() -> PathBuf {
    "scraped/bibscraped.bib".into()
}
fn default_scraper_log() -> PathBuf {
    "bibscraper.log".into()
}
fn default_updater_log() -> PathBuf {
    "bibupdater.log".into()
}

/// `[environment]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Dependency declarations, installed in order.
    #[serde(default = "default_requirements")]
    pub requirements: Vec<PathBuf>,

    /// State record written once provisioning has succeeded.
    #[serde(default = "default_marker")]
    pub marker: PathBuf,

    /// Command creating the isolated environment.
    #[serde(default = "default_create")]
    pub create: Vec<String>,

    /// Install command prefix; each requirement path is appended.
    #[serde(default = "default_install")]
    pub install: Vec<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            requirements: default_requirements(),
            marker: default_marker(),
            create: default_create(),
            install: default_install(),
        }
    }
}

fn default_requirements() -> Vec<PathBuf> {
    vec!["requirements-dev.txt".into(), "requirements.txt".into()]
}
fn default_marker() -> PathBuf {
    ".venv/.bibsync-state.json".into()
}
fn default_create() -> Vec<String> {
    vec!["python3".into(), "-m".into(), "venv".into(), ".venv".into()]
}
fn default_install() -> Vec<String> {
    vec![".venv/bin/pip".into(), "install".into(), "-r".into()]
}

/// `[scraper]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// Scraper command line (program first).
    #[serde(default = "default_scraper_command")]
    pub command: Vec<String>,

    /// Flag appended in download mode.
    #[serde(default = "default_download_flag")]
    pub download_flag: String,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            command: default_scraper_command(),
            download_flag: default_download_flag(),
        }
    }
}

fn default_scraper_command() -> Vec<String> {
    vec![".venv/bin/python".into(), "bibscraper.py".into()]
}
fn default_download_flag() -> String {
    "-d".into()
}

/// `[updater]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// External updater command line. Empty selects the built-in merge.
    #[serde(default)]
    pub command: Vec<String>,
}

/// `[output]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Mirror child output on the terminal as well as in the logs.
    #[serde(default = "default_true")]
    pub echo: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { echo: true }
    }
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Reject configurations no pipeline could run with.
    pub fn validate(&self) -> Result<()> {
        if self.scraper.command.is_empty() {
            return Err(BibsyncError::config("[scraper] command must not be empty"));
        }
        if self.environment.create.is_empty() {
            return Err(BibsyncError::config(
                "[environment] create must not be empty",
            ));
        }
        if self.environment.install.is_empty() {
            return Err(BibsyncError::config(
                "[environment] install must not be empty",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Load the config from `path`. Returns defaults if the file does not exist.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| BibsyncError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        BibsyncError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Write a default config file at `path`, refusing to overwrite.
pub fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(BibsyncError::config(format!(
            "{} already exists",
            path.display()
        )));
    }

    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| BibsyncError::config(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| BibsyncError::io(path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("sec.bib"));
        assert!(toml_str.contains("download_flag"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.paths.scraped, PathBuf::from("scraped/bibscraped.bib"));
        assert_eq!(parsed.environment.requirements.len(), 2);
        assert!(parsed.updater.command.is_empty());
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let toml_str = r#"
[paths]
bibliography = "refs.bib"

[scraper]
command = ["./scrape.sh"]
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.paths.bibliography, PathBuf::from("refs.bib"));
        assert_eq!(config.paths.destination(), Path::new("refs.bib"));
        assert_eq!(config.scraper.command, vec!["./scrape.sh".to_string()]);
        assert_eq!(config.scraper.download_flag, "-d");
        assert!(config.output.echo);
    }

    #[test]
    fn explicit_destination_overrides_in_place_update() {
        let config: AppConfig = toml::from_str(
            "[paths]\nbibliography = \"refs.bib\"\ndestination = \"out.bib\"\n",
        )
        .expect("parse");
        assert_eq!(config.paths.bibliography, PathBuf::from("refs.bib"));
        assert_eq!(config.paths.destination(), Path::new("out.bib"));

        let defaults = AppConfig::default();
        assert_eq!(defaults.paths.destination(), Path::new("sec.bib"));
    }

    #[test]
    fn unknown_section_is_rejected() {
        let result: std::result::Result<AppConfig, _> = toml::from_str("[scrapper]\n");
        assert!(result.is_err());
    }

    #[test]
    fn empty_scraper_command_fails_validation() {
        let mut config = AppConfig::default();
        config.scraper.command.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("[scraper]"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir()
            .join(format!("bibsync_missing_{}.toml", uuid::Uuid::now_v7()));
        let config = load_config(&path).expect("defaults");
        assert_eq!(config.paths.scraper_log, PathBuf::from("bibscraper.log"));
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let path = std::env::temp_dir().join(format!("bibsync_init_{}.toml", uuid::Uuid::now_v7()));
        init_config(&path).expect("first init");
        let loaded = load_config_from(&path).expect("load written config");
        assert_eq!(loaded.scraper.download_flag, "-d");
        assert!(init_config(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
