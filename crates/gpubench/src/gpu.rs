//! NVIDIA GPU operator installation and GPU capacity polling.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use crate::config::BenchConfig;
use crate::exec::CommandRunner;
use crate::kube::{self, Helm, HelmRelease};
use crate::retry;
use crate::ui;

pub struct GpuOperator<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a BenchConfig,
    kubeconfig: &'a Path,
}

impl<'a> GpuOperator<'a> {
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner, config: &'a BenchConfig, kubeconfig: &'a Path) -> Self {
        Self {
            runner,
            config,
            kubeconfig,
        }
    }

    /// The operator helm release.
    #[must_use]
    pub fn release(&self) -> HelmRelease {
        let op = &self.config.gpu_operator;
        let mut release = HelmRelease::new(&op.release, &op.chart, &op.namespace)
            .set("driver.enabled", op.driver_enabled)
            .set("toolkit.enabled", op.toolkit_enabled);
        release.version.clone_from(&op.version);
        release.wait = true;
        release.timeout = Some(self.config.capacity_timeout());
        release
    }

    /// Add the chart repo and install or upgrade the operator.
    ///
    /// # Errors
    ///
    /// Returns an error if helm fails.
    pub fn install(&self) -> Result<()> {
        let op = &self.config.gpu_operator;
        let helm = Helm::new(self.runner, self.kubeconfig);

        ui::print_progress("Adding NVIDIA helm repository...");
        helm.repo_add(&op.repo_name, &op.repo_url)?;

        ui::print_progress("Installing GPU operator (this can take several minutes)...");
        helm.upgrade_install(&self.release())?;
        ui::print_success("GPU operator installed");
        Ok(())
    }

    /// Uninstall the operator; missing release is fine.
    ///
    /// # Errors
    ///
    /// Returns an error if helm fails.
    pub fn uninstall(&self) -> Result<bool> {
        let op = &self.config.gpu_operator;
        Helm::new(self.runner, self.kubeconfig).uninstall(&op.release, &op.namespace)
    }

    /// Poll the API server until at least `min` GPUs are allocatable.
    ///
    /// Returns the allocatable count.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be built or the wait times out.
    pub async fn wait_for_capacity(&self, min: u64) -> Result<u64> {
        let client = &kube::client(self.kubeconfig).await?;
        info!(min, "Waiting for allocatable GPUs");

        let count = retry::poll_until_async(
            "allocatable GPUs",
            self.config.capacity_timeout(),
            Duration::from_secs(10),
            move || async move {
                match kube::cluster_gpus(client).await {
                    Ok(count) if count >= min => Some(count),
                    Ok(count) => {
                        debug!(count, min, "Not enough GPUs yet");
                        None
                    }
                    Err(e) => {
                        debug!(error = %e, "Failed to read node capacity");
                        None
                    }
                }
            },
        )
        .await?;

        ui::print_success(&format!("{count} GPU(s) allocatable"));
        Ok(count)
    }
}
