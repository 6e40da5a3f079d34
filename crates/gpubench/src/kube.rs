//! kubectl / helm wrappers and Kubernetes API polling.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Namespace, Node, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client};
use tracing::{debug, info};

use crate::exec::{run_checked, Cmd, CommandRunner};
use crate::retry;

/// Extended resource name the NVIDIA device plugin advertises.
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// kubectl bound to one kubeconfig.
pub struct Kubectl<'a> {
    runner: &'a dyn CommandRunner,
    kubeconfig: PathBuf,
}

impl<'a> Kubectl<'a> {
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner, kubeconfig: &Path) -> Self {
        Self {
            runner,
            kubeconfig: kubeconfig.to_path_buf(),
        }
    }

    fn cmd(&self, args: &[&str]) -> Cmd {
        Cmd::new("kubectl")
            .arg("--kubeconfig")
            .arg(self.kubeconfig.to_string_lossy())
            .args(args.iter().copied())
    }

    /// Run a kubectl command, returning stdout.
    ///
    /// # Errors
    ///
    /// Returns an error if kubectl fails.
    pub fn run(&self, args: &[&str]) -> Result<String> {
        Ok(run_checked(self.runner, &self.cmd(args))?)
    }

    /// Whether a kubectl command succeeds.
    #[must_use]
    pub fn succeeds(&self, args: &[&str]) -> bool {
        self.runner
            .run(&self.cmd(args))
            .is_ok_and(|output| output.success())
    }

    /// Apply a manifest via stdin.
    ///
    /// # Errors
    ///
    /// Returns an error if kubectl apply fails.
    pub fn apply_yaml(&self, yaml: &str) -> Result<()> {
        let cmd = self.cmd(&["apply", "-f", "-"]).stdin(yaml.as_bytes().to_vec());
        run_checked(self.runner, &cmd).context("kubectl apply failed")?;
        Ok(())
    }

    /// Create a namespace if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be applied.
    pub fn ensure_namespace(&self, name: &str) -> Result<()> {
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };
        self.apply_yaml(&serde_yaml::to_string(&namespace)?)
            .with_context(|| format!("Failed to ensure namespace {name}"))
    }

    /// Create or update an opaque secret holding a single key.
    ///
    /// The value goes through stdin so it never shows up in a process list.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be applied.
    pub fn ensure_secret(&self, namespace: &str, name: &str, key: &str, value: &str) -> Result<()> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..ObjectMeta::default()
            },
            type_: Some("Opaque".into()),
            string_data: Some([(key.to_string(), value.to_string())].into()),
            ..Secret::default()
        };
        self.apply_yaml(&serde_yaml::to_string(&secret)?)
            .with_context(|| format!("Failed to apply secret {namespace}/{name}"))
    }

    /// Whether a rollout of `resource` (e.g. `deployment/foo`) is complete.
    #[must_use]
    pub fn rollout_complete(&self, namespace: &str, resource: &str) -> bool {
        self.succeeds(&[
            "rollout",
            "status",
            resource,
            "-n",
            namespace,
            "--timeout=10s",
        ])
    }

    /// Wait for a rollout to complete.
    ///
    /// # Errors
    ///
    /// Returns a timeout error if the rollout does not finish in time.
    pub async fn wait_for_rollout(
        &self,
        namespace: &str,
        resource: &str,
        timeout: Duration,
    ) -> Result<()> {
        info!(namespace, resource, "Waiting for rollout");
        retry::poll_until(
            &format!("rollout of {namespace}/{resource}"),
            timeout,
            Duration::from_secs(5),
            || self.rollout_complete(namespace, resource).then_some(()),
        )
        .await?;
        Ok(())
    }

    /// Wait for every node to report Ready.
    ///
    /// # Errors
    ///
    /// Returns a timeout error if nodes do not become Ready in time.
    pub async fn wait_nodes_ready(&self, timeout: Duration) -> Result<()> {
        retry::poll_until("nodes Ready", timeout, Duration::from_secs(5), || {
            self.succeeds(&[
                "wait",
                "--for=condition=Ready",
                "nodes",
                "--all",
                "--timeout=30s",
            ])
            .then_some(())
        })
        .await?;
        Ok(())
    }
}

/// A helm release to install or upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelmRelease {
    pub name: String,
    pub chart: String,
    pub namespace: String,
    pub version: Option<String>,
    pub values_file: Option<PathBuf>,
    pub set: Vec<(String, String)>,
    pub wait: bool,
    pub timeout: Option<Duration>,
}

impl HelmRelease {
    #[must_use]
    pub fn new(name: &str, chart: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            chart: chart.to_string(),
            namespace: namespace.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn set(mut self, key: &str, value: impl ToString) -> Self {
        self.set.push((key.to_string(), value.to_string()));
        self
    }

    /// Arguments for `helm upgrade --install`.
    #[must_use]
    pub fn upgrade_args(&self) -> Vec<String> {
        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            self.name.clone(),
            self.chart.clone(),
            "--namespace".to_string(),
            self.namespace.clone(),
            "--create-namespace".to_string(),
        ];
        if let Some(version) = &self.version {
            args.extend(["--version".to_string(), version.clone()]);
        }
        if let Some(values) = &self.values_file {
            args.extend(["--values".to_string(), values.to_string_lossy().into_owned()]);
        }
        for (key, value) in &self.set {
            args.extend(["--set".to_string(), format!("{key}={value}")]);
        }
        if self.wait {
            args.push("--wait".to_string());
        }
        if let Some(timeout) = self.timeout {
            args.push(format!("--timeout={}s", timeout.as_secs()));
        }
        args
    }
}

/// helm bound to one kubeconfig.
pub struct Helm<'a> {
    runner: &'a dyn CommandRunner,
    kubeconfig: PathBuf,
}

impl<'a> Helm<'a> {
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner, kubeconfig: &Path) -> Self {
        Self {
            runner,
            kubeconfig: kubeconfig.to_path_buf(),
        }
    }

    fn cmd<I, S>(&self, args: I) -> Cmd
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Cmd::new("helm")
            .env("KUBECONFIG", self.kubeconfig.to_string_lossy())
            .args(args)
    }

    /// Add (or refresh) a chart repository.
    ///
    /// # Errors
    ///
    /// Returns an error if helm fails.
    pub fn repo_add(&self, name: &str, url: &str) -> Result<()> {
        run_checked(
            self.runner,
            &self.cmd(["repo", "add", name, url, "--force-update"]),
        )
        .with_context(|| format!("Failed to add helm repo {name}"))?;
        run_checked(self.runner, &self.cmd(["repo", "update", name]))
            .with_context(|| format!("Failed to update helm repo {name}"))?;
        Ok(())
    }

    /// Install or upgrade a release.
    ///
    /// # Errors
    ///
    /// Returns an error if helm fails.
    pub fn upgrade_install(&self, release: &HelmRelease) -> Result<()> {
        info!(release = %release.name, chart = %release.chart, "Installing helm release");
        run_checked(self.runner, &self.cmd(release.upgrade_args()))
            .with_context(|| format!("Failed to install helm release {}", release.name))?;
        Ok(())
    }

    /// Uninstall a release; a missing release is not an error.
    ///
    /// Returns whether something was uninstalled.
    ///
    /// # Errors
    ///
    /// Returns an error if helm fails for another reason.
    pub fn uninstall(&self, name: &str, namespace: &str) -> Result<bool> {
        let output = self
            .runner
            .run(&self.cmd(["uninstall", name, "--namespace", namespace]))?;
        if output.success() {
            return Ok(true);
        }
        if output.stderr.contains("not found") {
            debug!(release = name, "Release already absent");
            return Ok(false);
        }
        anyhow::bail!(
            "Failed to uninstall helm release {name}: {}",
            output.stderr.trim()
        )
    }
}

/// Build an API client from an explicit kubeconfig file.
///
/// # Errors
///
/// Returns an error if the kubeconfig is unreadable or invalid.
pub async fn client(kubeconfig: &Path) -> Result<Client> {
    let kubeconfig_data = Kubeconfig::read_from(kubeconfig)
        .with_context(|| format!("Failed to read kubeconfig {}", kubeconfig.display()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig_data, &KubeConfigOptions::default())
        .await
        .context("Failed to load kubeconfig")?;
    Client::try_from(config).context("Failed to create Kubernetes client")
}

/// GPUs a node advertises as allocatable.
#[must_use]
pub fn node_gpus(node: &Node) -> u64 {
    node.status
        .as_ref()
        .and_then(|status| status.allocatable.as_ref())
        .and_then(|allocatable| allocatable.get(GPU_RESOURCE))
        .and_then(|quantity| quantity.0.trim().parse().ok())
        .unwrap_or(0)
}

/// Sum of allocatable GPUs across nodes.
#[must_use]
pub fn allocatable_gpus(nodes: &[Node]) -> u64 {
    nodes.iter().map(node_gpus).sum()
}

/// Allocatable GPUs across the cluster, via the API server.
///
/// # Errors
///
/// Returns an error if the node list cannot be fetched.
pub async fn cluster_gpus(client: &Client) -> Result<u64> {
    let nodes: Api<Node> = Api::all(client.clone());
    let list = nodes
        .list(&ListParams::default())
        .await
        .context("Failed to list nodes")?;
    Ok(allocatable_gpus(&list.items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::scripted::ScriptedRunner;
    use crate::exec::CmdOutput;

    fn node(gpus: Option<&str>) -> Node {
        let mut allocatable = serde_json::json!({ "cpu": "8", "memory": "32Gi" });
        if let Some(gpus) = gpus {
            allocatable[GPU_RESOURCE] = serde_json::json!(gpus);
        }
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": "n" },
            "status": { "allocatable": allocatable }
        }))
        .unwrap()
    }

    #[test]
    fn test_allocatable_gpus() {
        let nodes = vec![node(Some("2")), node(None), node(Some("1"))];
        assert_eq!(node_gpus(&nodes[0]), 2);
        assert_eq!(node_gpus(&nodes[1]), 0);
        assert_eq!(allocatable_gpus(&nodes), 3);
        assert_eq!(allocatable_gpus(&[]), 0);
        assert_eq!(node_gpus(&Node::default()), 0);
    }

    #[test]
    fn test_upgrade_args() {
        let mut release = HelmRelease::new("gpu-operator", "nvidia/gpu-operator", "gpu-operator")
            .set("driver.enabled", false);
        release.version = Some("v24.9.0".into());
        release.wait = true;
        release.timeout = Some(Duration::from_secs(600));

        assert_eq!(
            release.upgrade_args().join(" "),
            "upgrade --install gpu-operator nvidia/gpu-operator --namespace gpu-operator \
             --create-namespace --version v24.9.0 --set driver.enabled=false --wait --timeout=600s"
        );
    }

    #[test]
    fn test_ensure_secret_uses_stdin() {
        let runner = ScriptedRunner::new();
        let kubectl = Kubectl::new(&runner, Path::new("/tmp/kc"));
        kubectl
            .ensure_secret("default", "hf-token", "token", "hf_secret")
            .unwrap();

        let commands = runner.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(
            commands[0].display(),
            "kubectl --kubeconfig /tmp/kc apply -f -"
        );
        let body = String::from_utf8(commands[0].stdin.clone().unwrap()).unwrap();
        assert!(body.contains("kind: Secret"));
        assert!(body.contains("hf_secret"));
        assert!(!commands[0].display().contains("hf_secret"));
    }

    #[test]
    fn test_ensure_namespace_manifest() {
        let runner = ScriptedRunner::new();
        Kubectl::new(&runner, Path::new("/tmp/kc"))
            .ensure_namespace("bench")
            .unwrap();
        let body = String::from_utf8(runner.commands()[0].stdin.clone().unwrap()).unwrap();
        assert!(body.contains("kind: Namespace"));
        assert!(body.contains("name: bench"));
    }

    #[test]
    fn test_helm_uninstall_missing_release() {
        let runner = ScriptedRunner::new().on(
            "helm uninstall",
            CmdOutput::failed(1, "Error: uninstall: Release not loaded: vllm: release: not found"),
        );
        let helm = Helm::new(&runner, Path::new("/tmp/kc"));
        assert!(!helm.uninstall("vllm", "default").unwrap());
    }

    #[test]
    fn test_helm_uninstall_other_failure() {
        let runner = ScriptedRunner::new()
            .on("helm uninstall", CmdOutput::failed(1, "Kubernetes cluster unreachable"));
        let helm = Helm::new(&runner, Path::new("/tmp/kc"));
        assert!(helm.uninstall("vllm", "default").is_err());
    }

    #[test]
    fn test_helm_passes_kubeconfig_env() {
        let runner = ScriptedRunner::new();
        Helm::new(&runner, Path::new("/tmp/kc"))
            .repo_add("nvidia", "https://helm.ngc.nvidia.com/nvidia")
            .unwrap();

        let commands = runner.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands
            .iter()
            .all(|c| c.env.contains(&("KUBECONFIG".into(), "/tmp/kc".into()))));
        assert!(runner.ran("helm repo add nvidia"));
        assert!(runner.ran("helm repo update nvidia"));
    }

    #[tokio::test]
    async fn test_wait_nodes_ready_polls() {
        let runner = ScriptedRunner::new()
            .on("wait --for=condition=Ready", CmdOutput::ok("node/ready condition met"));
        Kubectl::new(&runner, Path::new("/tmp/kc"))
            .wait_nodes_ready(Duration::from_secs(1))
            .await
            .unwrap();
        assert!(runner.ran("wait --for=condition=Ready nodes --all"));
    }
}
