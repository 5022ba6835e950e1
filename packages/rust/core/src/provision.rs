//! Dependency environment provisioning.
//!
//! The environment is (re)built only when the state record is missing, was
//! written for a different set of requirement files, or the caller forces
//! it. The record is written last, after every install command succeeded.

use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use bibsync_shared::{
    BibsyncError, EnvironmentConfig, ProvisionState, Result, StateRecord, StepKind,
};

use crate::pipeline::ProgressReporter;
use crate::runner::{self, CommandLine, Transcript};

/// Options for one provisioning pass.
#[derive(Debug, Clone, Default)]
pub struct ProvisionOptions {
    /// Rebuild even if the state record is current.
    pub force: bool,
    /// Mirror install output on the terminal.
    pub echo: bool,
}

/// What provisioning did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// State record matched; no command ran.
    AlreadyProvisioned { dependency_hash: String },
    /// The environment was created and every requirement installed.
    Provisioned { dependency_hash: String, installs: usize },
}

impl ProvisionOutcome {
    pub fn dependency_hash(&self) -> &str {
        match self {
            Self::AlreadyProvisioned { dependency_hash }
            | Self::Provisioned {
                dependency_hash, ..
            } => dependency_hash,
        }
    }
}

/// Make sure the environment described by `env` is ready, relative to `root`.
#[instrument(skip_all, fields(root = %root.display(), force = options.force))]
pub async fn provision(
    env: &EnvironmentConfig,
    root: &Path,
    options: &ProvisionOptions,
    progress: &dyn ProgressReporter,
) -> Result<ProvisionOutcome> {
    let step = StepKind::Provision.as_str();

    let requirements: Vec<PathBuf> = env.requirements.iter().map(|r| root.join(r)).collect();
    for path in &requirements {
        if !path.is_file() {
            return Err(BibsyncError::MissingInput {
                step: step.to_string(),
                path: path.clone(),
            });
        }
    }

    let dependency_hash = dependency_hash(&env.requirements, &requirements)?;
    let marker = root.join(&env.marker);
    let state = read_state(&marker);

    if !options.force && state.is_current(&dependency_hash) {
        info!(hash = %dependency_hash, "environment is up to date");
        return Ok(ProvisionOutcome::AlreadyProvisioned { dependency_hash });
    }
    debug!(?state, "provisioning required");

    // A stale record must not survive a partial rebuild.
    remove_state(&marker)?;

    let create = CommandLine::from_argv(&env.create)
        .ok_or_else(|| BibsyncError::config("[environment] create must not be empty"))?
        .resolved_in(root);
    let install = CommandLine::from_argv(&env.install)
        .ok_or_else(|| BibsyncError::config("[environment] install must not be empty"))?
        .resolved_in(root);
    let transcript = Transcript {
        log: None,
        echo: options.echo,
    };

    progress.phase("Creating environment");
    runner::run_command(step, &create, root, &transcript).await?;

    for requirement in &env.requirements {
        progress.phase(&format!("Installing {}", requirement.display()));
        let command = install.clone().arg(requirement.to_string_lossy());
        runner::run_command(step, &command, root, &transcript).await?;
    }

    write_state(
        &marker,
        &ProvisionState::Provisioned {
            provisioned_at: Utc::now(),
            dependency_hash: dependency_hash.clone(),
        },
    )?;

    info!(hash = %dependency_hash, installs = env.requirements.len(), "environment provisioned");
    Ok(ProvisionOutcome::Provisioned {
        dependency_hash,
        installs: env.requirements.len(),
    })
}

/// SHA-256 over each requirement's configured name and file contents, in order.
pub fn dependency_hash(names: &[PathBuf], paths: &[PathBuf]) -> Result<String> {
    let mut hasher = Sha256::new();
    for (name, path) in names.iter().zip(paths) {
        let contents = std::fs::read(path).map_err(|e| BibsyncError::io(path, e))?;
        hasher.update(name.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(&contents);
        hasher.update([0]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Load the state record. Anything missing or unreadable counts as
/// [`ProvisionState::NotProvisioned`].
pub fn read_state(marker: &Path) -> ProvisionState {
    let Ok(text) = std::fs::read_to_string(marker) else {
        return ProvisionState::NotProvisioned;
    };
    match serde_json::from_str::<StateRecord>(&text) {
        Ok(record) => record.state,
        Err(e) => {
            warn!(path = %marker.display(), error = %e, "ignoring unreadable state record");
            ProvisionState::NotProvisioned
        }
    }
}

/// Atomically persist `state` at `marker`.
fn write_state(marker: &Path, state: &ProvisionState) -> Result<()> {
    if let Some(parent) = marker.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BibsyncError::io(parent, e))?;
    }
    let json = serde_json::to_string_pretty(&StateRecord::new(state.clone()))
        .map_err(|e| BibsyncError::State(e.to_string()))?;

    let temp = marker.with_extension("json.tmp");
    std::fs::write(&temp, json).map_err(|e| BibsyncError::io(&temp, e))?;
    std::fs::rename(&temp, marker).map_err(|e| BibsyncError::io(marker, e))?;
    Ok(())
}

fn remove_state(marker: &Path) -> Result<()> {
    match std::fs::remove_file(marker) {
        Ok(()) => {
            debug!(path = %marker.display(), "removed previous state record");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BibsyncError::io(marker, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SilentProgress;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bibsync_provision_{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    /// Environment whose commands just append to `calls.log` in the root.
    fn fake_env(root: &Path) -> EnvironmentConfig {
        std::fs::write(root.join("requirements-dev.txt"), "pytest\n").unwrap();
        std::fs::write(root.join("requirements.txt"), "requests\n").unwrap();
        EnvironmentConfig {
            create: argv(&["sh", "-c", "mkdir -p .venv && echo create >> calls.log"]),
            install: argv(&["sh", "-c", "echo \"install $1\" >> calls.log", "pip"]),
            ..EnvironmentConfig::default()
        }
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    fn calls(root: &Path) -> Vec<String> {
        std::fs::read_to_string(root.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    async fn run(env: &EnvironmentConfig, root: &Path, force: bool) -> Result<ProvisionOutcome> {
        let options = ProvisionOptions { force, echo: false };
        provision(env, root, &options, &SilentProgress).await
    }

    #[tokio::test]
    async fn provisions_once_for_unchanged_requirements() {
        let root = temp_dir();
        let env = fake_env(&root);

        let first = run(&env, &root, false).await.expect("first provision");
        assert!(matches!(first, ProvisionOutcome::Provisioned { installs: 2, .. }));
        assert_eq!(
            calls(&root),
            vec!["create", "install requirements-dev.txt", "install requirements.txt"]
        );

        let second = run(&env, &root, false).await.expect("second provision");
        assert!(matches!(second, ProvisionOutcome::AlreadyProvisioned { .. }));
        assert_eq!(second.dependency_hash(), first.dependency_hash());
        assert_eq!(calls(&root).len(), 3);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn deleting_marker_forces_reprovision() {
        let root = temp_dir();
        let env = fake_env(&root);

        run(&env, &root, false).await.expect("provision");
        std::fs::remove_file(root.join(&env.marker)).unwrap();
        let again = run(&env, &root, false).await.expect("provision again");

        assert!(matches!(again, ProvisionOutcome::Provisioned { .. }));
        assert_eq!(calls(&root).iter().filter(|c| *c == "create").count(), 2);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn changed_requirements_reprovision() {
        let root = temp_dir();
        let env = fake_env(&root);

        let first = run(&env, &root, false).await.expect("provision");
        std::fs::write(root.join("requirements.txt"), "requests\nbibtexparser\n").unwrap();
        let second = run(&env, &root, false).await.expect("provision again");

        assert!(matches!(second, ProvisionOutcome::Provisioned { .. }));
        assert_ne!(first.dependency_hash(), second.dependency_hash());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn force_reprovisions() {
        let root = temp_dir();
        let env = fake_env(&root);

        run(&env, &root, false).await.expect("provision");
        let forced = run(&env, &root, true).await.expect("forced provision");
        assert!(matches!(forced, ProvisionOutcome::Provisioned { .. }));
        assert_eq!(calls(&root).len(), 6);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn failed_install_leaves_no_state() {
        let root = temp_dir();
        let mut env = fake_env(&root);

        run(&env, &root, false).await.expect("provision");
        std::fs::write(root.join("requirements.txt"), "changed\n").unwrap();
        env.install = vec!["sh".into(), "-c".into(), "exit 4".into()];

        let err = run(&env, &root, false).await.unwrap_err();
        assert!(matches!(err, BibsyncError::StepFailed { code: Some(4), .. }));
        assert_eq!(read_state(&root.join(&env.marker)), ProvisionState::NotProvisioned);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn missing_requirement_runs_nothing() {
        let root = temp_dir();
        let env = fake_env(&root);
        std::fs::remove_file(root.join("requirements.txt")).unwrap();

        let err = run(&env, &root, false).await.unwrap_err();
        match err {
            BibsyncError::MissingInput { step, path } => {
                assert_eq!(step, "provision");
                assert!(path.ends_with("requirements.txt"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(calls(&root).is_empty());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn state_record_round_trips_through_marker() {
        let root = temp_dir();
        let marker = root.join(".venv").join("state.json");
        assert_eq!(read_state(&marker), ProvisionState::NotProvisioned);

        let state = ProvisionState::Provisioned {
            provisioned_at: Utc::now(),
            dependency_hash: "abc".into(),
        };
        write_state(&marker, &state).expect("write state");
        assert!(read_state(&marker).is_current("abc"));
        assert!(!marker.with_extension("json.tmp").exists());

        std::fs::write(&marker, "not json").unwrap();
        assert_eq!(read_state(&marker), ProvisionState::NotProvisioned);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn hash_covers_names_and_contents() {
        let root = temp_dir();
        let a = root.join("a.txt");
        std::fs::write(&a, "x").unwrap();
        let names = vec![PathBuf::from("a.txt")];

        let one = dependency_hash(&names, std::slice::from_ref(&a)).unwrap();
        assert_eq!(one.len(), 64);

        let renamed = dependency_hash(&[PathBuf::from("b.txt")], std::slice::from_ref(&a)).unwrap();
        assert_ne!(one, renamed);

        std::fs::write(&a, "y").unwrap();
        assert_ne!(one, dependency_hash(&names, &[a]).unwrap());

        let _ = std::fs::remove_dir_all(&root);
    }
}
