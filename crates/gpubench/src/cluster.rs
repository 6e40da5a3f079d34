//! kind cluster provisioning.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};

use crate::config::BenchConfig;
use crate::error;
use crate::exec::{run_checked, Cmd, CommandRunner};
use crate::kube::Kubectl;
use crate::repair;
use crate::retry::RetryConfig;
use crate::ui;

/// Where kind nodes see the GPUs the NVIDIA runtime should inject.
pub const GPU_DEVICES_MOUNT: &str = "/var/run/nvidia-container-devices/all";

/// Outcome of [`ClusterProvisioner::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Reused,
    Created,
}

/// Snapshot of the cluster for `cluster status`.
#[derive(Debug, Clone, Default)]
pub struct ClusterStatus {
    pub exists: bool,
    pub healthy: bool,
    pub nodes: Vec<String>,
}

pub struct ClusterProvisioner<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a BenchConfig,
    retry: RetryConfig,
}

impl<'a> ClusterProvisioner<'a> {
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner, config: &'a BenchConfig) -> Self {
        Self {
            runner,
            config,
            retry: RetryConfig::quick(3),
        }
    }

    /// Override the create retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn name(&self) -> &str {
        &self.config.cluster.name
    }

    /// Render the kind cluster config.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized.
    pub fn render_kind_config(&self) -> Result<String> {
        let mut nodes = vec![json!({ "role": "control-plane" })];
        for _ in 0..self.config.cluster.gpu_workers {
            nodes.push(json!({
                "role": "worker",
                "extraMounts": [{
                    "hostPath": "/dev/null",
                    "containerPath": GPU_DEVICES_MOUNT,
                }],
            }));
        }

        let config = json!({
            "kind": "Cluster",
            "apiVersion": "kind.x-k8s.io/v1alpha4",
            "name": self.name(),
            "nodes": nodes,
        });
        Ok(serde_yaml::to_string(&config)?)
    }

    /// Whether kind knows a cluster with this name.
    ///
    /// # Errors
    ///
    /// Returns an error if kind cannot be run.
    pub fn exists(&self) -> Result<bool> {
        let clusters = run_checked(self.runner, &Cmd::new("kind").args(["get", "clusters"]))
            .context("Failed to list kind clusters")?;
        Ok(clusters.lines().any(|line| line.trim() == self.name()))
    }

    /// Whether the API server answers through a freshly exported kubeconfig.
    ///
    /// Only the work-dir kubeconfig is written, so checking health never
    /// switches the user's current context.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        match repair::export_kubeconfig(self.runner, self.config) {
            Ok(kubeconfig) => Kubectl::new(self.runner, &kubeconfig)
                .succeeds(&["get", "nodes", "--request-timeout=10s"]),
            Err(_) => false,
        }
    }

    /// Node container names.
    ///
    /// # Errors
    ///
    /// Returns an error if kind fails.
    pub fn node_containers(&self) -> Result<Vec<String>> {
        let output = run_checked(
            self.runner,
            &Cmd::new("kind").args(["get", "nodes", "--name", self.name()]),
        )
        .context("Failed to list kind nodes")?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("No kind nodes"))
            .map(ToString::to_string)
            .collect())
    }

    /// Create the cluster, or reuse a healthy one.
    ///
    /// With `recreate`, an existing cluster is always deleted first. Either
    /// way the nodes are waited on and the GPU workers labelled, so a retry
    /// after a failure past creation finishes the job on the reused cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if creation keeps failing or nodes never become Ready.
    pub async fn create(&self, recreate: bool) -> Result<CreateOutcome> {
        let mut outcome = CreateOutcome::Created;
        if self.exists()? {
            if !recreate && self.is_healthy() {
                ui::print_info(&format!("kind cluster '{}' already exists", self.name()));
                outcome = CreateOutcome::Reused;
            } else {
                warn!(cluster = self.name(), recreate, "Deleting existing cluster");
                self.delete()?;
            }
        }

        if outcome == CreateOutcome::Created {
            let config_path = self.write_kind_config()?;
            ui::print_progress(&format!("Creating kind cluster '{}'...", self.name()));
            self.create_with_retries(&config_path).await?;
            ui::print_success("kind cluster created");
        }

        let kubeconfig = repair::ensure_kube_context(self.runner, self.config)?;
        let kubectl = Kubectl::new(self.runner, &kubeconfig);

        ui::print_progress("Waiting for nodes to be Ready...");
        kubectl.wait_nodes_ready(self.config.cluster_timeout()).await?;
        self.label_gpu_workers(&kubectl)?;
        ui::print_success("Cluster is ready");

        Ok(outcome)
    }

    fn write_kind_config(&self) -> Result<PathBuf> {
        let path = self.config.kind_config_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, self.render_kind_config()?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    async fn create_with_retries(&self, config_path: &std::path::Path) -> Result<()> {
        let cmd = Cmd::new("kind").args([
            "create",
            "cluster",
            "--name",
            self.name(),
            "--image",
            &self.config.cluster.node_image,
            "--config",
            &config_path.to_string_lossy(),
        ]);

        let mut attempt = 0;
        loop {
            let output = self.runner.run(&cmd)?;
            if output.success() {
                return Ok(());
            }
            attempt += 1;
            let stderr = output.stderr.trim();

            let network = is_network_failure(stderr);
            if !self.retry.should_retry(attempt) || !(network || error::is_transient_message(stderr)) {
                anyhow::bail!("kind cluster creation failed: {stderr}");
            }

            warn!(attempt, network, error = stderr, "kind create failed, cleaning up and retrying");
            // kind leaves half-created node containers behind.
            if let Err(e) = self.delete() {
                warn!(error = %format!("{e:#}"), "Failed to clean up partial cluster");
            }
            if network {
                repair::prune_kind_network(self.runner)?;
            }
            tokio::time::sleep(self.retry.delay_for_attempt(attempt - 1)).await;
        }
    }

    fn label_gpu_workers(&self, kubectl: &Kubectl<'_>) -> Result<()> {
        kubectl
            .run(&[
                "label",
                "nodes",
                "-l",
                "!node-role.kubernetes.io/control-plane",
                "nvidia.com/gpu.present=true",
                "--overwrite",
            ])
            .context("Failed to label GPU workers")?;
        Ok(())
    }

    /// Delete the cluster; a missing cluster is not an error.
    ///
    /// Returns whether a cluster was deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if kind fails to delete an existing cluster.
    pub fn delete(&self) -> Result<bool> {
        if !self.exists()? {
            return Ok(false);
        }
        run_checked(
            self.runner,
            &Cmd::new("kind").args(["delete", "cluster", "--name", self.name()]),
        )
        .with_context(|| format!("Failed to delete kind cluster {}", self.name()))?;
        info!(cluster = self.name(), "Deleted kind cluster");
        Ok(true)
    }

    /// Existence, health and nodes of the cluster.
    ///
    /// # Errors
    ///
    /// Returns an error if kind cannot be run.
    pub fn status(&self) -> Result<ClusterStatus> {
        if !self.exists()? {
            return Ok(ClusterStatus::default());
        }
        Ok(ClusterStatus {
            exists: true,
            healthy: self.is_healthy(),
            nodes: self.node_containers()?,
        })
    }
}

/// Whether kind failed while setting up its docker network.
#[must_use]
pub fn is_network_failure(stderr: &str) -> bool {
    let msg = stderr.to_lowercase();
    msg.contains("failed to create network")
        || msg.contains("network kind")
        || msg.contains("pool overlaps")
        || msg.contains("iptables")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::exec::scripted::ScriptedRunner;
    use crate::exec::CmdOutput;

    fn config(dir: &TempDir) -> BenchConfig {
        let mut config = BenchConfig::default();
        config.cluster.name = "lab".into();
        config.cluster.gpu_workers = 2;
        config.work_dir = Some(dir.path().to_path_buf());
        config
    }

    fn no_delay() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    #[test]
    fn test_render_kind_config() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let runner = ScriptedRunner::new();
        let yaml = ClusterProvisioner::new(&runner, &config)
            .render_kind_config()
            .unwrap();

        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed["name"], "lab");
        let nodes = parsed["nodes"].as_sequence().unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0]["role"], "control-plane");
        assert!(nodes[0].get("extraMounts").is_none());
        assert_eq!(nodes[2]["extraMounts"][0]["hostPath"], "/dev/null");
        assert_eq!(nodes[2]["extraMounts"][0]["containerPath"], GPU_DEVICES_MOUNT);
    }

    #[test]
    fn test_exists_matches_exact_name() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let runner = ScriptedRunner::new().on("get clusters", CmdOutput::ok("lab-old\nother\n"));
        assert!(!ClusterProvisioner::new(&runner, &config).exists().unwrap());

        let runner = ScriptedRunner::new().on("get clusters", CmdOutput::ok("other\nlab\n"));
        assert!(ClusterProvisioner::new(&runner, &config).exists().unwrap());
    }

    #[tokio::test]
    async fn test_create_reuses_healthy_cluster() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let runner = ScriptedRunner::new().on("get clusters", CmdOutput::ok("lab\n"));

        let outcome = ClusterProvisioner::new(&runner, &config)
            .create(false)
            .await
            .unwrap();
        assert_eq!(outcome, CreateOutcome::Reused);
        assert!(!runner.ran("create cluster"));
        assert!(!runner.ran("delete cluster"));
        assert!(runner.ran("wait --for=condition=Ready nodes"));
        assert!(runner.ran("nvidia.com/gpu.present=true --overwrite"));
    }

    #[tokio::test]
    async fn test_reused_cluster_is_labelled_after_failed_label() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let runner = ScriptedRunner::new()
            .on("get clusters", CmdOutput::ok(""))
            .on("get clusters", CmdOutput::ok("lab\n"))
            .on("label nodes", CmdOutput::failed(1, "connection refused"))
            .on("label nodes", CmdOutput::ok(""));
        let provisioner = ClusterProvisioner::new(&runner, &config).with_retry(no_delay());

        assert!(provisioner.create(false).await.is_err());
        let outcome = provisioner.create(false).await.unwrap();

        assert_eq!(outcome, CreateOutcome::Reused);
        let calls = runner.calls();
        assert_eq!(calls.iter().filter(|c| c.contains("create cluster")).count(), 1);
        assert_eq!(calls.iter().filter(|c| c.contains("label nodes")).count(), 2);
    }

    #[test]
    fn test_status_keeps_default_kube_context() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let runner = ScriptedRunner::new().on("get clusters", CmdOutput::ok("lab\n"));

        let status = ClusterProvisioner::new(&runner, &config).status().unwrap();
        assert!(status.exists);
        assert!(status.healthy);
        let exports: Vec<_> = runner
            .calls()
            .into_iter()
            .filter(|c| c.contains("export kubeconfig"))
            .collect();
        assert_eq!(exports.len(), 1);
        assert!(exports[0].contains("--kubeconfig"));
    }

    #[tokio::test]
    async fn test_create_retries_when_cleanup_fails() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let runner = ScriptedRunner::new()
            .on("get clusters", CmdOutput::ok(""))
            .on("get clusters", CmdOutput::failed(1, "Cannot connect to the Docker daemon"))
            .on("get clusters", CmdOutput::ok(""))
            .on("create cluster", CmdOutput::failed(1, "connection reset by peer"))
            .on("create cluster", CmdOutput::ok(""));

        let outcome = ClusterProvisioner::new(&runner, &config)
            .with_retry(no_delay())
            .create(false)
            .await
            .unwrap();

        assert_eq!(outcome, CreateOutcome::Created);
        assert_eq!(
            runner.calls().iter().filter(|c| c.contains("create cluster")).count(),
            2
        );
        assert!(!runner.ran("delete cluster"));
    }

    #[tokio::test]
    async fn test_create_replaces_unhealthy_cluster() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let runner = ScriptedRunner::new()
            .on("get clusters", CmdOutput::ok("lab\n"))
            .on("get clusters", CmdOutput::ok("lab\n"))
            .on("get clusters", CmdOutput::ok(""))
            .on("get nodes --request-timeout", CmdOutput::failed(1, "connection refused"));

        let outcome = ClusterProvisioner::new(&runner, &config)
            .with_retry(no_delay())
            .create(false)
            .await
            .unwrap();
        assert_eq!(outcome, CreateOutcome::Created);
        assert!(runner.ran("kind delete cluster --name lab"));
        assert!(runner.ran("kind create cluster --name lab --image kindest/node:v1.31.0"));
        assert!(runner.ran("nvidia.com/gpu.present=true --overwrite"));
        assert!(config.kind_config_path().exists());
    }

    #[tokio::test]
    async fn test_create_prunes_network_after_network_failure() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let runner = ScriptedRunner::new()
            .on("get clusters", CmdOutput::ok(""))
            .on(
                "create cluster",
                CmdOutput::failed(1, "ERROR: failed to create cluster: failed to create network kind"),
            )
            .on("create cluster", CmdOutput::ok(""))
            .on("network inspect", CmdOutput::ok("0"));

        ClusterProvisioner::new(&runner, &config)
            .with_retry(no_delay())
            .create(false)
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls.iter().filter(|c| c.contains("create cluster")).count(), 2);
        assert!(runner.ran("docker network rm kind"));
    }

    #[tokio::test]
    async fn test_create_gives_up_on_hard_failure() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let runner = ScriptedRunner::new()
            .on("get clusters", CmdOutput::ok(""))
            .on("create cluster", CmdOutput::failed(1, "ERROR: unknown image"));

        let err = ClusterProvisioner::new(&runner, &config)
            .with_retry(no_delay())
            .create(false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown image"));
        assert_eq!(
            runner.calls().iter().filter(|c| c.contains("create cluster")).count(),
            1
        );
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let runner = ScriptedRunner::new().on("get clusters", CmdOutput::ok("other\n"));
        assert!(!ClusterProvisioner::new(&runner, &config).delete().unwrap());
        assert!(!runner.ran("delete cluster"));
    }

    #[test]
    fn test_node_containers() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let runner = ScriptedRunner::new().on(
            "get nodes --name lab",
            CmdOutput::ok("lab-control-plane\nlab-worker\nlab-worker2\n"),
        );
        let nodes = ClusterProvisioner::new(&runner, &config)
            .node_containers()
            .unwrap();
        assert_eq!(nodes, vec!["lab-control-plane", "lab-worker", "lab-worker2"]);
    }

    #[test]
    fn test_is_network_failure() {
        assert!(is_network_failure("failed to create network kind: Error response from daemon"));
        assert!(is_network_failure("Pool overlaps with other one on this address space"));
        assert!(!is_network_failure("node image not found"));
    }
}
