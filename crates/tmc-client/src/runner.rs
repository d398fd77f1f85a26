//! [`ExerciseRunner`] backed by the external tmc-langs CLI.
//!
//! Every operation spawns the CLI once with `--exercise-path` and
//! `--output-path` and reads the result from the output path. Children are
//! killed when the run is cancelled or the future is dropped.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use tmc_core::{ExerciseRunner, Result, RunResult, TestRunOutcome, TmcError};

/// Runs tests and handles archives through tmc-langs.
#[derive(Debug)]
pub struct LangsRunner {
    program: PathBuf,
    prefix_args: Vec<OsString>,
    scratch_dir: PathBuf,
    counter: AtomicU64,
}

impl LangsRunner {
    /// Creates a runner for `program`, writing intermediate files to `scratch_dir`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            scratch_dir: scratch_dir.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// Arguments placed before the subcommand, e.g. `-jar tmc-langs.jar`.
    #[must_use]
    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    fn scratch_file(&self, stem: &str, extension: &str) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.scratch_dir
            .join(format!("{stem}-{}-{n}.{extension}", std::process::id()))
    }

    fn command(&self, action: &str, exercise_path: &Path, output_path: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.prefix_args)
            .arg(action)
            .arg("--exercise-path")
            .arg(exercise_path)
            .arg("--output-path")
            .arg(output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Runs one CLI action to completion.
    ///
    /// Returns `Ok(false)` if `cancel` fired first.
    async fn invoke(
        &self,
        action: &str,
        exercise_path: &Path,
        output_path: &Path,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let child = self
            .command(action, exercise_path, output_path)
            .spawn()
            .map_err(|e| {
                TmcError::runner(format!(
                    "Failed to start {}: {e}",
                    self.program.display()
                ))
            })?;
        debug!(action, pid = child.id(), "Spawned tmc-langs");

        let output = match cancel {
            Some(cancel) => tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(action, "tmc-langs run cancelled");
                    return Ok(false);
                }
                output = child.wait_with_output() => output?,
            },
            None => child.wait_with_output().await?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TmcError::runner(format!(
                "{action} failed ({}): {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(true)
    }
}

async fn remove_scratch(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
        }
    }
}

#[async_trait]
impl ExerciseRunner for LangsRunner {
    #[instrument(skip(self, cancel), fields(path = %exercise_path.display()))]
    async fn run_tests(
        &self,
        exercise_path: &Path,
        cancel: CancellationToken,
    ) -> Result<TestRunOutcome> {
        let output_path = self.scratch_file("test-output", "json");
        let finished = self
            .invoke("run-tests", exercise_path, &output_path, Some(&cancel))
            .await;
        let outcome = match finished {
            Ok(true) => {
                let raw = tokio::fs::read(&output_path).await?;
                let result: RunResult = serde_json::from_slice(&raw)
                    .map_err(|e| TmcError::runner(format!("Unreadable test results: {e}")))?;
                Ok(TestRunOutcome::Completed(result))
            }
            Ok(false) => Ok(TestRunOutcome::Interrupted),
            Err(e) => Err(e),
        };
        remove_scratch(&output_path).await;
        outcome
    }

    #[instrument(skip(self), fields(path = %exercise_path.display()))]
    async fn compress_project(&self, exercise_path: &Path) -> Result<Vec<u8>> {
        let output_path = self.scratch_file("submission", "zip");
        let result = match self
            .invoke("compress-project", exercise_path, &output_path, None)
            .await
        {
            Ok(_) => tokio::fs::read(&output_path).await.map_err(TmcError::from),
            Err(e) => Err(e),
        };
        remove_scratch(&output_path).await;
        result
    }

    #[instrument(skip(self, archive), fields(target = %target.display(), size = archive.len()))]
    async fn extract_project(&self, archive: &[u8], target: &Path) -> Result<()> {
        let archive_path = self.scratch_file("download", "zip");
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        tokio::fs::write(&archive_path, archive).await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let result = self
            .invoke("extract-project", &archive_path, target, None)
            .await
            .map(|_| ());
        remove_scratch(&archive_path).await;
        result
    }
}
