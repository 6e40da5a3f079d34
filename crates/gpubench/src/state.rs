//! Bring-up state persistence.
//!
//! The `up` workflow records its progress in the work directory so an
//! interrupted or failed run resumes from the step that failed.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Ordered steps of the `up` workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpStep {
    /// Not yet started.
    NotStarted,
    /// Checking the host for required tools and resources.
    ValidatingEnvironment,
    /// Downloading missing CLIs.
    InstallingDependencies,
    /// Fixing host settings kind and the NVIDIA runtime need.
    RepairingHost,
    /// Creating the kind cluster.
    CreatingCluster,
    /// Fixing GPU mounts inside the node containers.
    RepairingNodes,
    /// Installing the GPU operator chart.
    InstallingGpuOperator,
    /// Waiting for GPUs to become allocatable.
    WaitingGpuCapacity,
    /// Installing the model-serving chart.
    DeployingServing,
    /// Forwarding the serving service to a local port.
    StartingPortForward,
    /// Waiting for the model endpoint to answer.
    WaitingModelReady,
    /// Launching the benchmark in the background.
    StartingBenchmark,
    /// Bring-up complete.
    Complete,
}

impl UpStep {
    /// Get the next step in the sequence.
    #[must_use]
    pub fn next(self) -> Self {
        match self {
            Self::NotStarted => Self::ValidatingEnvironment,
            Self::ValidatingEnvironment => Self::InstallingDependencies,
            Self::InstallingDependencies => Self::RepairingHost,
            Self::RepairingHost => Self::CreatingCluster,
            Self::CreatingCluster => Self::RepairingNodes,
            Self::RepairingNodes => Self::InstallingGpuOperator,
            Self::InstallingGpuOperator => Self::WaitingGpuCapacity,
            Self::WaitingGpuCapacity => Self::DeployingServing,
            Self::DeployingServing => Self::StartingPortForward,
            Self::StartingPortForward => Self::WaitingModelReady,
            Self::WaitingModelReady => Self::StartingBenchmark,
            Self::StartingBenchmark | Self::Complete => Self::Complete,
        }
    }

    /// Get a human-readable description of the step.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::ValidatingEnvironment => "Validating environment",
            Self::InstallingDependencies => "Installing dependencies",
            Self::RepairingHost => "Repairing host configuration",
            Self::CreatingCluster => "Creating kind cluster",
            Self::RepairingNodes => "Repairing node GPU mounts",
            Self::InstallingGpuOperator => "Installing GPU operator",
            Self::WaitingGpuCapacity => "Waiting for GPU capacity",
            Self::DeployingServing => "Deploying model-serving platform",
            Self::StartingPortForward => "Forwarding serving port",
            Self::WaitingModelReady => "Waiting for model endpoint",
            Self::StartingBenchmark => "Starting benchmark",
            Self::Complete => "Complete",
        }
    }

    /// Get the step number for progress display.
    #[must_use]
    pub fn step_number(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::ValidatingEnvironment => 1,
            Self::InstallingDependencies => 2,
            Self::RepairingHost => 3,
            Self::CreatingCluster => 4,
            Self::RepairingNodes => 5,
            Self::InstallingGpuOperator => 6,
            Self::WaitingGpuCapacity => 7,
            Self::DeployingServing => 8,
            Self::StartingPortForward => 9,
            Self::WaitingModelReady => 10,
            Self::StartingBenchmark => 11,
            Self::Complete => 12,
        }
    }

    /// Total number of steps.
    pub const TOTAL_STEPS: u8 = 12;
}

impl std::fmt::Display for UpStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Persisted progress of the `up` workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpState {
    /// Cluster the state belongs to.
    pub cluster_name: String,
    /// Current step.
    pub step: UpStep,
    /// Exported kubeconfig (once the cluster exists).
    #[serde(default)]
    pub kubeconfig_path: Option<PathBuf>,
    /// Allocatable GPUs observed after the operator came up.
    #[serde(default)]
    pub gpu_count: Option<u64>,
    /// PID of the launched benchmark.
    #[serde(default)]
    pub benchmark_pid: Option<u32>,
    /// Timestamp of last state update.
    pub updated_at: String,
    /// Number of retry attempts for current step.
    pub attempt_count: u32,
    /// Last error message (if any).
    pub last_error: Option<String>,

    #[serde(skip)]
    path: PathBuf,
}

impl UpState {
    /// Create a fresh state stored at `path`.
    #[must_use]
    pub fn new(cluster_name: &str, path: PathBuf) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            step: UpStep::NotStarted,
            kubeconfig_path: None,
            gpu_count: None,
            benchmark_pid: None,
            updated_at: chrono::Utc::now().to_rfc3339(),
            attempt_count: 0,
            last_error: None,
            path,
        }
    }

    /// Load state from file if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).context("Failed to read state file")?;
        let mut state: Self =
            serde_json::from_str(&content).context("Failed to parse state file")?;
        state.path = path.to_path_buf();

        info!(
            "Loaded bring-up state: step={:?}, attempt={}",
            state.step, state.attempt_count
        );
        Ok(Some(state))
    }

    /// Save state to file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&mut self) -> Result<()> {
        self.updated_at = chrono::Utc::now().to_rfc3339();

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).context("Failed to create work directory")?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize state")?;
        std::fs::write(&self.path, content).context("Failed to write state file")?;

        Ok(())
    }

    /// Remove the state file; missing files are fine.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(path: &Path) -> Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context("Failed to remove state file"),
        }
    }

    /// Update the current step and save.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn set_step(&mut self, step: UpStep) -> Result<()> {
        info!("Step: {} -> {}", self.step, step);
        self.step = step;
        self.attempt_count = 0;
        self.last_error = None;
        self.save()
    }

    /// Advance to the next step.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn advance(&mut self) -> Result<()> {
        self.set_step(self.step.next())
    }

    /// Record an error for the current step.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn record_error(&mut self, error: &str) -> Result<()> {
        self.last_error = Some(error.to_string());
        self.attempt_count += 1;
        self.save()
    }

    /// Clear the last error.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn clear_error(&mut self) -> Result<()> {
        self.last_error = None;
        self.save()
    }

    /// Set the kubeconfig path.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn set_kubeconfig(&mut self, path: PathBuf) -> Result<()> {
        self.kubeconfig_path = Some(path);
        self.save()
    }

    /// Record the observed GPU count.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn set_gpu_count(&mut self, count: u64) -> Result<()> {
        self.gpu_count = Some(count);
        self.save()
    }

    /// Record the benchmark PID.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn set_benchmark_pid(&mut self, pid: u32) -> Result<()> {
        self.benchmark_pid = Some(pid);
        self.save()
    }

    /// Start over for `cluster_name`, dropping everything recorded so far.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails.
    pub fn reset(&mut self, cluster_name: &str) -> Result<()> {
        let path = std::mem::take(&mut self.path);
        *self = Self::new(cluster_name, path);
        self.save()
    }

    /// Check if the bring-up is complete.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.step == UpStep::Complete
    }

    /// Check if we can resume from this state.
    #[must_use]
    pub fn can_resume(&self) -> bool {
        self.step != UpStep::NotStarted && self.step != UpStep::Complete
    }
}
