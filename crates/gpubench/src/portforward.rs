//! Background `kubectl port-forward` to the serving service.

use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::config::BenchConfig;
use crate::exec::{Cmd, CommandRunner};
use crate::ports;
use crate::process::BackgroundJob;
use crate::retry;

const GRACE: Duration = Duration::from_secs(5);

/// State of the tracked forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardStatus {
    /// Tracked process alive and the local port answers.
    Active { pid: u32 },
    /// Tracked process alive but nothing answers on the port yet.
    Starting { pid: u32 },
    Stopped,
}

pub struct PortForward<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a BenchConfig,
    job: BackgroundJob,
    ready_timeout: Duration,
}

impl<'a> PortForward<'a> {
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner, config: &'a BenchConfig) -> Self {
        Self {
            runner,
            config,
            job: BackgroundJob::new("port-forward", &config.work_dir()),
            ready_timeout: Duration::from_secs(30),
        }
    }

    /// How long [`PortForward::start`] waits for the port to answer.
    #[must_use]
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    #[must_use]
    pub fn job(&self) -> &BackgroundJob {
        &self.job
    }

    /// The forward command line.
    #[must_use]
    pub fn command(&self) -> Cmd {
        let serving = &self.config.serving;
        Cmd::new("kubectl")
            .arg("--kubeconfig")
            .arg(self.config.kubeconfig_path().to_string_lossy())
            .args([
                "port-forward",
                "--address",
                "127.0.0.1",
                &format!("svc/{}", serving.service),
                &format!("{}:{}", serving.local_port, serving.service_port),
                "-n",
                &serving.namespace,
            ])
    }

    /// Replace any previous forward and wait until the local port answers.
    ///
    /// Returns the forward's PID.
    ///
    /// # Errors
    ///
    /// Returns an error if the port cannot be reclaimed, kubectl cannot be
    /// spawned, or the port never starts answering.
    pub async fn start(&self) -> Result<u32> {
        let port = self.config.serving.local_port;
        self.job.stop(GRACE).await?;
        let reclaimed = ports::reclaim(self.runner, port, GRACE).await?;
        if !reclaimed.is_empty() {
            info!(port, pids = ?reclaimed, "Reclaimed local port");
        }

        let pid = self.job.start(self.runner, &self.command())?;
        let ready = retry::poll_until(
            "port-forward",
            self.ready_timeout,
            Duration::from_millis(250),
            || ports::accepts_connections(port).then_some(()),
        )
        .await;

        if let Err(e) = ready {
            let log = self.job.tail(5).unwrap_or_default().join("\n");
            self.job.stop(GRACE).await?;
            anyhow::bail!("{e}; port-forward log:\n{log}");
        }

        info!(port, pid, "Port-forward ready");
        Ok(pid)
    }

    /// Stop the tracked forward.
    ///
    /// # Errors
    ///
    /// Returns an error if the PID file cannot be removed.
    pub async fn stop(&self) -> Result<bool> {
        Ok(self.job.stop(GRACE).await?)
    }

    #[must_use]
    pub fn status(&self) -> ForwardStatus {
        match self.job.running_pid() {
            Some(pid) if ports::accepts_connections(self.config.serving.local_port) => {
                ForwardStatus::Active { pid }
            }
            Some(pid) => ForwardStatus::Starting { pid },
            None => ForwardStatus::Stopped,
        }
    }
}

impl std::fmt::Display for ForwardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active { pid } => write!(f, "active (pid {pid})"),
            Self::Starting { pid } => write!(f, "starting (pid {pid})"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
