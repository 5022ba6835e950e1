//! External step runner.
//!
//! Spawns one child process, drains its stdout and stderr concurrently and
//! copies every line, as it arrives, to the step's log file and (optionally)
//! the terminal. The log therefore holds the full transcript up to the point
//! of failure even when the child dies midway.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use bibsync_shared::{BibsyncError, Result};

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a configured argv (program first). `None` when empty.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.iter().cloned()))
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Resolve a relative program path (one containing a separator) against
    /// `root`. Bare names are left for `PATH` lookup.
    pub fn resolved_in(mut self, root: &Path) -> Self {
        let program = Path::new(&self.program);
        if program.is_relative() && program.components().count() > 1 {
            self.program = root.join(program).to_string_lossy().into_owned();
        }
        self
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Where a step's output goes besides being consumed.
#[derive(Debug, Clone)]
pub struct Transcript {
    /// Log file, truncated at step start.
    pub log: Option<PathBuf>,
    /// Mirror output on the terminal.
    pub echo: bool,
}

/// A finished, successful step.
#[derive(Debug, Clone)]
pub struct StepRun {
    /// Bytes of output captured.
    pub output_bytes: u64,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Run `command` in `dir` to completion.
///
/// Fails with [`BibsyncError::StepFailed`] on a non-zero exit; the
/// transcript is complete either way.
#[instrument(skip_all, fields(step = step, command = %command))]
pub async fn run_command(
    step: &str,
    command: &CommandLine,
    dir: &Path,
    transcript: &Transcript,
) -> Result<StepRun> {
    let start = Instant::now();

    let mut log = match &transcript.log {
        Some(path) => Some(create_log(path).await?),
        None => None,
    };

    info!("starting step");
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .current_dir(dir)
        // Keep Python children line-buffered on pipes.
        .env("PYTHONUNBUFFERED", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| BibsyncError::Spawn {
            step: step.to_string(),
            program: command.program.clone(),
            source,
        })?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_lines(stdout, Stream::Stdout, tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_lines(stderr, Stream::Stderr, tx.clone())));
    }
    drop(tx);

    let log_path = transcript.log.as_deref().unwrap_or(Path::new("-"));
    let mut output_bytes = 0u64;
    while let Some((stream, chunk)) = rx.recv().await {
        output_bytes += chunk.len() as u64;
        if let Some(file) = log.as_mut() {
            file.write_all(&chunk)
                .await
                .map_err(|e| BibsyncError::io(log_path, e))?;
        }
        if transcript.echo {
            echo(stream, &chunk).await;
        }
    }

    for reader in readers {
        match reader.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "error reading step output"),
            Err(e) => warn!(error = %e, "output reader task failed"),
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| BibsyncError::io(&command.program, e))?;

    if let Some(mut file) = log {
        file.flush().await.map_err(|e| BibsyncError::io(log_path, e))?;
    }

    let elapsed = start.elapsed();
    if !status.success() {
        warn!(code = ?status.code(), elapsed_ms = elapsed.as_millis(), "step failed");
        return Err(BibsyncError::StepFailed {
            step: step.to_string(),
            code: status.code(),
        });
    }

    info!(output_bytes, elapsed_ms = elapsed.as_millis(), "step finished");
    Ok(StepRun {
        output_bytes,
        elapsed,
    })
}

async fn create_log(path: &Path) -> Result<tokio::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BibsyncError::io(parent, e))?;
    }
    debug!(?path, "writing transcript");
    tokio::fs::File::create(path)
        .await
        .map_err(|e| BibsyncError::io(path, e))
}

/// Send every line read from `reader` (newline included) down `tx`.
async fn forward_lines<R>(
    reader: R,
    stream: Stream,
    tx: mpsc::UnboundedSender<(Stream, Vec<u8>)>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }
        if tx.send((stream, line)).is_err() {
            return Ok(());
        }
    }
}

async fn echo(stream: Stream, chunk: &[u8]) {
    let result = match stream {
        Stream::Stdout => {
            let mut out = tokio::io::stdout();
            match out.write_all(chunk).await {
                Ok(()) => out.flush().await,
                Err(e) => Err(e),
            }
        }
        Stream::Stderr => {
            let mut err = tokio::io::stderr();
            match err.write_all(chunk).await {
                Ok(()) => err.flush().await,
                Err(e) => Err(e),
            }
        }
    };
    if let Err(e) = result {
        debug!(error = %e, "terminal echo failed");
    }
}
