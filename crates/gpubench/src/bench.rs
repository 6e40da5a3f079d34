//! Background benchmark runner.
//!
//! The load generator runs detached under `sh -c` so its exit code lands in
//! `bench.exit` even after the CLI that started it has gone. Status is derived
//! from that file plus the PID file:
//!
//! | exit file | PID alive | status      |
//! |-----------|-----------|-------------|
//! | `0`       | -         | Succeeded   |
//! | `N != 0`  | -         | Failed      |
//! | missing   | yes       | Running     |
//! | missing   | no        | Lost        |
//! | missing   | no PID    | NotStarted  |

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use crate::config::BenchConfig;
use crate::error::Error;
use crate::exec::{shell_quote, Cmd, CommandRunner};
use crate::process::{self, BackgroundJob};
use crate::retry;

const JOB_NAME: &str = "bench";
const GRACE: Duration = Duration::from_secs(10);

/// Observed state of the benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchStatus {
    NotStarted,
    Running { pid: u32 },
    Succeeded,
    Failed { code: i32 },
    /// The process is gone without recording an exit code.
    Lost,
}

impl BenchStatus {
    /// Whether the status can no longer change on its own.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running { .. })
    }
}

impl std::fmt::Display for BenchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Running { pid } => write!(f, "running (pid {pid})"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { code } => write!(f, "failed (exit code {code})"),
            Self::Lost => write!(f, "lost (exited without a status)"),
        }
    }
}

pub struct BenchRunner<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a BenchConfig,
    job: BackgroundJob,
    exit_file: PathBuf,
}

impl<'a> BenchRunner<'a> {
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner, config: &'a BenchConfig) -> Self {
        let dir = config.work_dir();
        Self {
            runner,
            config,
            job: BackgroundJob::new(JOB_NAME, &dir),
            exit_file: dir.join(format!("{JOB_NAME}.exit")),
        }
    }

    #[must_use]
    pub fn job(&self) -> &BackgroundJob {
        &self.job
    }

    #[must_use]
    pub fn exit_file(&self) -> &Path {
        &self.exit_file
    }

    /// Load generator invocation against the forwarded endpoint.
    #[must_use]
    pub fn build_command(&self) -> Cmd {
        let bench = &self.config.benchmark;
        let mut cmd = Cmd::new(&bench.tool).args([
            "benchmark".to_string(),
            "--target".to_string(),
            self.config.serving_url(),
            "--model".to_string(),
            self.config.serving.model.clone(),
            "--rate-type".to_string(),
            bench.rate_type.clone(),
        ]);
        if let Some(rate) = &bench.rate {
            cmd = cmd.args(["--rate", rate.as_str()]);
        }
        cmd.args([
            "--max-seconds".to_string(),
            bench.max_seconds.to_string(),
            "--data".to_string(),
            bench.data.clone(),
            "--output-path".to_string(),
            self.config.results_path().to_string_lossy().into_owned(),
        ])
        .args(bench.extra_args.iter().cloned())
    }

    /// [`BenchRunner::build_command`] wrapped so the exit code is recorded.
    #[must_use]
    pub fn wrapped_command(&self) -> Cmd {
        let exit = shell_quote(&self.exit_file.to_string_lossy());
        let tmp = shell_quote(&format!("{}.tmp", self.exit_file.to_string_lossy()));
        let script = format!(
            "{}; echo $? > {tmp} && mv {tmp} {exit}",
            self.build_command().display()
        );
        Cmd::new("sh").args(["-c", &script])
    }

    /// Launch the benchmark in the background.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if a run is alive, or an error if the
    /// load generator is missing or cannot be spawned.
    pub fn start(&self) -> Result<u32> {
        if let Some(pid) = self.job.running_pid() {
            return Err(Error::AlreadyRunning {
                name: JOB_NAME.into(),
                pid,
            }
            .into());
        }
        let tool = &self.config.benchmark.tool;
        if self.runner.which(tool).is_none() {
            return Err(Error::ToolNotFound(tool.clone()).into());
        }

        process::remove_if_exists(&self.exit_file)?;
        self.job.pid_file().remove()?;

        let pid = self.job.start(self.runner, &self.wrapped_command())?;
        info!(pid, target = %self.config.serving_url(), "Benchmark started");
        Ok(pid)
    }

    #[must_use]
    pub fn status(&self) -> BenchStatus {
        if let Ok(content) = std::fs::read_to_string(&self.exit_file) {
            return match content.trim().parse::<i32>() {
                Ok(0) => BenchStatus::Succeeded,
                Ok(code) => BenchStatus::Failed { code },
                Err(_) => BenchStatus::Lost,
            };
        }
        match self.job.recorded_pid() {
            Some(pid) if process::is_alive(pid) => BenchStatus::Running { pid },
            Some(_) => BenchStatus::Lost,
            None => BenchStatus::NotStarted,
        }
    }

    /// Poll until the benchmark finishes; only success is `Ok`.
    ///
    /// # Errors
    ///
    /// Returns an error if the run failed, was lost, never started, or is
    /// still running after `timeout`.
    pub async fn wait(&self, timeout: Duration, interval: Duration) -> Result<()> {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg} [{elapsed}]") {
            spinner.set_style(style);
        }
        spinner.set_message("Waiting for benchmark...");
        spinner.enable_steady_tick(Duration::from_millis(100));

        let result = retry::poll_until("benchmark", timeout, interval, || {
            let status = self.status();
            debug!(%status, "Benchmark status");
            status.is_terminal().then_some(status)
        })
        .await;
        spinner.finish_and_clear();

        match result? {
            BenchStatus::Succeeded => Ok(()),
            BenchStatus::NotStarted => anyhow::bail!("No benchmark has been started"),
            status => {
                let tail = self.logs(10).unwrap_or_default().join("\n");
                anyhow::bail!("Benchmark {status}; last log lines:\n{tail}")
            }
        }
    }

    /// Last `lines` lines of the benchmark log.
    ///
    /// # Errors
    ///
    /// Returns an error if the log exists but cannot be read.
    pub fn logs(&self, lines: usize) -> Result<Vec<String>> {
        Ok(self.job.tail(lines)?)
    }

    /// Stop a running benchmark.
    ///
    /// # Errors
    ///
    /// Returns an error if the PID file cannot be removed.
    pub async fn stop(&self) -> Result<bool> {
        Ok(self.job.stop(GRACE).await?)
    }

    /// Results file, once the load generator has written it.
    #[must_use]
    pub fn results(&self) -> Option<PathBuf> {
        Some(self.config.results_path()).filter(|p| p.exists())
    }
}
