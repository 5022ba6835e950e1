//! Error types for bibsync.
//!
//! Library crates use [`BibsyncError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all bibsync operations.
#[derive(Debug, thiserror::Error)]
pub enum BibsyncError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Bibliography syntax error.
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// An external step exited unsuccessfully.
    ///
    /// `code` is `None` when the child was terminated by a signal.
    #[error("step `{step}` failed with exit status {}", display_code(*code))]
    StepFailed { step: String, code: Option<i32> },

    /// An external step could not be started at all.
    #[error("failed to spawn `{program}` for step `{step}`: {source}")]
    Spawn {
        step: String,
        program: String,
        source: std::io::Error,
    },

    /// A path a step depends on does not exist before it runs.
    #[error("step `{step}` is missing its input {path:?}")]
    MissingInput { step: String, path: PathBuf },

    /// A step exited successfully without producing a declared output.
    #[error("step `{step}` did not produce {path:?}")]
    MissingOutput { step: String, path: PathBuf },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Provisioning state record could not be read or written.
    #[error("state error: {0}")]
    State(String),
}

fn display_code(code: Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, BibsyncError>;

impl BibsyncError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error at a 1-based line number.
    pub fn parse(line: usize, msg: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Exit status the process should surface for this error.
    ///
    /// A failed step propagates its own code; everything else maps to 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::StepFailed {
                code: Some(code), ..
            } if *code != 0 => *code,
            _ => 1,
        }
    }
}
