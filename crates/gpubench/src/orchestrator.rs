//! The `up` workflow.
//!
//! Drives every bring-up step in order, persisting progress after each one so
//! a failed or interrupted run resumes where it stopped.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::bench::{BenchRunner, BenchStatus};
use crate::cluster::ClusterProvisioner;
use crate::config::BenchConfig;
use crate::deps::DependencyInstaller;
use crate::error;
use crate::exec::CommandRunner;
use crate::gpu::GpuOperator;
use crate::portforward::PortForward;
use crate::repair;
use crate::retry::RetryConfig;
use crate::serving::{self, ServingDeployer};
use crate::state::{UpState, UpStep};
use crate::ui;
use crate::validator::PrerequisitesValidator;

/// Knobs for the `up` workflow.
#[derive(Debug, Clone, Default)]
pub struct UpOptions {
    /// Discard saved progress and start over.
    pub fresh: bool,
    /// Skip environment validation.
    pub skip_checks: bool,
    /// Skip downloading missing tools.
    pub skip_deps: bool,
    /// Stop after the model is ready.
    pub skip_benchmark: bool,
    /// Block until the benchmark finishes.
    pub wait_benchmark: bool,
    /// Delete an existing cluster instead of reusing it.
    pub recreate_cluster: bool,
    /// Override the NVIDIA runtime config location.
    pub runtime_config: Option<PathBuf>,
}

/// Runs the bring-up to completion.
pub struct Orchestrator<'a> {
    runner: &'a dyn CommandRunner,
    config: BenchConfig,
    options: UpOptions,
    state: UpState,
    retry_config: RetryConfig,
}

impl<'a> Orchestrator<'a> {
    /// Create an orchestrator, resuming saved progress unless `fresh`.
    ///
    /// # Errors
    ///
    /// Returns an error if the work directory or state file is unusable.
    pub fn new_or_resume(
        runner: &'a dyn CommandRunner,
        config: BenchConfig,
        options: UpOptions,
    ) -> Result<Self> {
        let work_dir = config.work_dir();
        std::fs::create_dir_all(&work_dir)
            .with_context(|| format!("Failed to create work directory {}", work_dir.display()))?;

        let path = config.state_file();
        if options.fresh && UpState::remove(&path)? {
            ui::print_info("Discarded previous bring-up state");
        }

        let state = match UpState::load(&path)? {
            Some(mut existing) if existing.cluster_name != config.cluster.name => {
                warn!(
                    saved = %existing.cluster_name,
                    requested = %config.cluster.name,
                    "State belongs to another cluster, starting over"
                );
                existing.reset(&config.cluster.name)?;
                existing
            }
            Some(existing) if existing.can_resume() => {
                ui::print_info(&format!("Resuming bring-up from: {}", existing.step));
                if let Some(ref err) = existing.last_error {
                    ui::print_warning(&format!("Previous error: {err}"));
                }
                existing
            }
            Some(existing) if existing.is_complete() => {
                ui::print_success("Bring-up already complete");
                existing
            }
            _ => UpState::new(&config.cluster.name, path),
        };

        Ok(Self {
            runner,
            config,
            options,
            state,
            retry_config: RetryConfig::default(),
        })
    }

    /// Override the retry policy for transient step failures.
    #[must_use]
    pub fn with_retry(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    #[must_use]
    pub fn state(&self) -> &UpState {
        &self.state
    }

    /// Run every remaining step, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the first hard failure; progress is saved for a later resume.
    pub async fn run_to_completion(&mut self) -> Result<()> {
        if self.state.is_complete() {
            self.finish().await?;
            return Ok(());
        }

        ui::print_section("Bringing up GPU benchmark environment");
        self.print_current_step();

        loop {
            match self.execute_current_step().await {
                Ok(()) => {
                    self.state.clear_error()?;

                    if self.state.is_complete() {
                        self.finish().await?;
                        return Ok(());
                    }

                    self.state.advance()?;
                    self.print_current_step();
                }
                Err(e) => {
                    self.state.record_error(&format!("{e:#}"))?;

                    if error::is_transient(&e)
                        && self.retry_config.should_retry(self.state.attempt_count)
                    {
                        let delay = self
                            .retry_config
                            .delay_for_attempt(self.state.attempt_count);
                        warn!(
                            attempt = self.state.attempt_count,
                            error = %e,
                            delay_secs = delay.as_secs(),
                            "Transient error, retrying"
                        );
                        ui::print_warning(&format!(
                            "Transient error (attempt {}): {e:#}",
                            self.state.attempt_count
                        ));
                        ui::print_info(&format!("Retrying in {} seconds...", delay.as_secs()));
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    error!(step = ?self.state.step, error = %e, "Bring-up failed");
                    ui::print_error(&format!(
                        "Bring-up failed at step '{}': {e:#}",
                        self.state.step
                    ));
                    ui::print_info("State has been saved. Re-run `gpubench up` to resume.");
                    return Err(e);
                }
            }
        }
    }

    fn print_current_step(&self) {
        if self.state.step != UpStep::NotStarted {
            ui::print_progress_step(
                self.state.step.step_number(),
                UpStep::TOTAL_STEPS,
                self.state.step.description(),
            );
        }
    }

    fn kubeconfig(&self) -> PathBuf {
        self.state
            .kubeconfig_path
            .clone()
            .unwrap_or_else(|| self.config.kubeconfig_path())
    }

    async fn execute_current_step(&mut self) -> Result<()> {
        info!(step = ?self.state.step, "Executing step");

        match self.state.step {
            UpStep::NotStarted | UpStep::Complete => {}
            UpStep::ValidatingEnvironment => self.validate_environment()?,
            UpStep::InstallingDependencies => self.install_dependencies().await?,
            UpStep::RepairingHost => self.repair_host().await?,
            UpStep::CreatingCluster => self.create_cluster().await?,
            UpStep::RepairingNodes => self.repair_nodes()?,
            UpStep::InstallingGpuOperator => {
                let kubeconfig = self.kubeconfig();
                GpuOperator::new(self.runner, &self.config, &kubeconfig).install()?;
            }
            UpStep::WaitingGpuCapacity => {
                let kubeconfig = self.kubeconfig();
                let count = GpuOperator::new(self.runner, &self.config, &kubeconfig)
                    .wait_for_capacity(self.config.required_gpus())
                    .await?;
                self.state.set_gpu_count(count)?;
            }
            UpStep::DeployingServing => {
                let kubeconfig = self.kubeconfig();
                ServingDeployer::new(self.runner, &self.config, &kubeconfig)
                    .deploy()
                    .await?;
            }
            UpStep::StartingPortForward => {
                let pid = PortForward::new(self.runner, &self.config).start().await?;
                ui::print_success(&format!(
                    "Forwarding {} (pid {pid})",
                    self.config.serving_url()
                ));
            }
            UpStep::WaitingModelReady => {
                serving::wait_model_ready(
                    &self.config.serving_url(),
                    &self.config.serving.model,
                    self.config.ready_timeout(),
                )
                .await?;
            }
            UpStep::StartingBenchmark => self.start_benchmark()?,
        }

        Ok(())
    }

    fn validate_environment(&self) -> Result<()> {
        if self.options.skip_checks {
            ui::print_info("Skipping environment checks");
            return Ok(());
        }
        PrerequisitesValidator::new(&self.config).validate(self.runner)?;
        Ok(())
    }

    async fn install_dependencies(&self) -> Result<()> {
        if self.options.skip_deps {
            ui::print_info("Skipping dependency installation");
            return Ok(());
        }
        DependencyInstaller::new(self.runner, &self.config)
            .install_all()
            .await?;
        Ok(())
    }

    async fn repair_host(&self) -> Result<()> {
        let changed = repair::ensure_inotify_limits(self.runner)?;
        if !changed.is_empty() {
            ui::print_success(&format!("Raised {}", changed.join(", ")));
        }

        let runtime_config = self
            .options
            .runtime_config
            .clone()
            .unwrap_or_else(|| PathBuf::from(repair::NVIDIA_RUNTIME_CONFIG));
        if repair::ensure_nvidia_runtime(self.runner, &runtime_config).await? {
            ui::print_success("NVIDIA runtime configured as docker default");
        }
        Ok(())
    }

    async fn create_cluster(&mut self) -> Result<()> {
        // Only the first attempt recreates, so retries do not loop forever.
        let recreate = self.options.recreate_cluster && self.state.attempt_count == 0;
        ClusterProvisioner::new(self.runner, &self.config)
            .create(recreate)
            .await?;
        self.state.set_kubeconfig(self.config.kubeconfig_path())?;
        Ok(())
    }

    fn repair_nodes(&self) -> Result<()> {
        let nodes = ClusterProvisioner::new(self.runner, &self.config).node_containers()?;
        let fixed = repair::fix_node_gpu_mounts(self.runner, &nodes)?;
        if !fixed.is_empty() {
            ui::print_success(&format!("Fixed GPU mounts on {}", fixed.join(", ")));
        }
        Ok(())
    }

    fn start_benchmark(&mut self) -> Result<()> {
        if self.options.skip_benchmark {
            ui::print_info("Skipping benchmark");
            return Ok(());
        }
        let bench = BenchRunner::new(self.runner, &self.config);
        let pid = match bench.status() {
            BenchStatus::Running { pid } => {
                ui::print_info(&format!("Benchmark already running (pid {pid})"));
                pid
            }
            _ => bench.start()?,
        };
        self.state.set_benchmark_pid(pid)?;
        Ok(())
    }

    /// Upper bound for a whole benchmark run; a sweep runs about ten
    /// constant-rate passes of `max_seconds` each.
    fn benchmark_timeout(&self) -> Duration {
        Duration::from_secs(self.config.benchmark.max_seconds.saturating_mul(12) + 600)
    }

    async fn finish(&self) -> Result<()> {
        self.print_success_summary();
        if self.options.wait_benchmark && !self.options.skip_benchmark {
            let bench = BenchRunner::new(self.runner, &self.config);
            bench
                .wait(self.benchmark_timeout(), Duration::from_secs(10))
                .await?;
            ui::print_success("Benchmark finished");
            if let Some(results) = bench.results() {
                ui::print_kv("Results", &results.display().to_string());
            }
        }
        Ok(())
    }

    fn print_success_summary(&self) {
        ui::print_section("Bring-up Complete!");
        ui::print_success("The model is serving on a GPU kind cluster.");

        ui::print_kv("Cluster", &self.config.cluster.name);
        ui::print_kv("Context", &self.config.kube_context());
        ui::print_kv("Kubeconfig", &self.kubeconfig().display().to_string());
        if let Some(gpus) = self.state.gpu_count {
            ui::print_kv("GPUs", &gpus.to_string());
        }
        ui::print_kv("Model", &self.config.serving.model);
        ui::print_kv("Endpoint", &format!("{}/v1", self.config.serving_url()));
        if let Some(pid) = self.state.benchmark_pid {
            ui::print_kv("Benchmark PID", &pid.to_string());
        }

        ui::print_section("Next Steps");
        ui::print_info("1. Follow the benchmark:");
        ui::print_info("   gpubench bench status");
        ui::print_info("   gpubench bench logs");
        ui::print_info("");
        ui::print_info("2. Block until it finishes:");
        ui::print_info("   gpubench bench wait");
        ui::print_info("");
        ui::print_info("3. Tear everything down:");
        ui::print_info("   gpubench down");
    }
}
