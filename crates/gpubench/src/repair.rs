//! Host and node repair helpers.
//!
//! kind on a GPU host trips over a handful of well-known problems: low
//! inotify limits, a container runtime that ignores device volume mounts, a
//! stale `kind` docker network, and the driver procfs mount that kind nodes
//! inherit. Each helper checks first and only changes what is wrong.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::BenchConfig;
use crate::exec::{run_checked, Cmd, CommandRunner};
use crate::retry;

/// NVIDIA container runtime config file.
pub const NVIDIA_RUNTIME_CONFIG: &str = "/etc/nvidia-container-runtime/config.toml";

/// Key that lets kind pass GPUs through `/var/run/nvidia-container-devices`.
pub const VOLUME_MOUNTS_KEY: &str = "accept-nvidia-visible-devices-as-volume-mounts";

/// Minimum inotify limits for a multi-node kind cluster.
pub const INOTIFY_LIMITS: [(&str, u64); 2] = [
    ("fs.inotify.max_user_watches", 524_288),
    ("fs.inotify.max_user_instances", 512),
];

/// Raise inotify limits that are below [`INOTIFY_LIMITS`].
///
/// Returns the keys that were changed.
///
/// # Errors
///
/// Returns an error if a limit cannot be raised.
pub fn ensure_inotify_limits(runner: &dyn CommandRunner) -> Result<Vec<String>> {
    let mut changed = Vec::new();
    for (key, minimum) in INOTIFY_LIMITS {
        let current = run_checked(runner, &Cmd::new("sysctl").args(["-n", key]))
            .ok()
            .and_then(|out| out.trim().parse::<u64>().ok());

        if current.is_some_and(|value| value >= minimum) {
            debug!(key, ?current, "inotify limit already sufficient");
            continue;
        }

        info!(key, ?current, minimum, "Raising inotify limit");
        run_checked(
            runner,
            &Cmd::new("sudo").args(["sysctl", "-w", &format!("{key}={minimum}")]),
        )
        .with_context(|| format!("Failed to raise {key}"))?;
        changed.push(key.to_string());
    }
    Ok(changed)
}

/// Whether the NVIDIA runtime needs (re)configuring for kind.
///
/// `config_toml` is the runtime config file (empty if missing) and
/// `default_runtime` is docker's current default runtime.
///
/// # Errors
///
/// Returns an error if the config file is not valid TOML.
pub fn nvidia_runtime_needs_config(config_toml: &str, default_runtime: &str) -> Result<bool> {
    let table: toml::Table = config_toml
        .parse()
        .context("Failed to parse NVIDIA runtime config")?;
    let accepts_mounts = table
        .get(VOLUME_MOUNTS_KEY)
        .and_then(toml::Value::as_bool)
        .unwrap_or(false);
    Ok(!accepts_mounts || default_runtime.trim() != "nvidia")
}

/// Make docker default to the NVIDIA runtime with volume-mount device
/// selection enabled, restarting docker if anything changed.
///
/// Returns whether docker was reconfigured.
///
/// # Errors
///
/// Returns an error if `nvidia-ctk` fails or docker does not come back.
pub async fn ensure_nvidia_runtime(runner: &dyn CommandRunner, config_path: &Path) -> Result<bool> {
    let config_toml = match std::fs::read_to_string(config_path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", config_path.display()))
        }
    };
    let default_runtime = run_checked(
        runner,
        &Cmd::new("docker").args(["info", "--format", "{{.DefaultRuntime}}"]),
    )
    .context("Failed to query docker default runtime")?;

    if !nvidia_runtime_needs_config(&config_toml, &default_runtime)? {
        debug!("NVIDIA runtime already configured");
        return Ok(false);
    }

    info!(runtime = default_runtime.trim(), "Configuring NVIDIA container runtime");
    run_checked(
        runner,
        &Cmd::new("sudo").args([
            "nvidia-ctk",
            "runtime",
            "configure",
            "--runtime=docker",
            "--set-as-default",
        ]),
    )
    .context("nvidia-ctk runtime configure failed")?;
    run_checked(
        runner,
        &Cmd::new("sudo").args([
            "nvidia-ctk",
            "config",
            "--set",
            &format!("{VOLUME_MOUNTS_KEY}=true"),
            "--in-place",
        ]),
    )
    .context("nvidia-ctk config failed")?;

    restart_docker(runner).await?;
    Ok(true)
}

async fn restart_docker(runner: &dyn CommandRunner) -> Result<()> {
    info!("Restarting docker");
    run_checked(runner, &Cmd::new("sudo").args(["systemctl", "restart", "docker"]))
        .context("Failed to restart docker")?;

    retry::poll_until(
        "docker daemon",
        Duration::from_secs(60),
        Duration::from_secs(2),
        || {
            runner
                .run(&Cmd::new("docker").arg("info"))
                .is_ok_and(|output| output.success())
                .then_some(())
        },
    )
    .await?;
    Ok(())
}

/// Remove the `kind` docker network when no container is attached.
///
/// Returns whether the network was removed.
///
/// # Errors
///
/// Returns an error if docker refuses to remove an unused network.
pub fn prune_kind_network(runner: &dyn CommandRunner) -> Result<bool> {
    let inspect = runner.run(&Cmd::new("docker").args([
        "network",
        "inspect",
        "kind",
        "--format",
        "{{len .Containers}}",
    ]))?;
    if !inspect.success() {
        debug!("No kind network to prune");
        return Ok(false);
    }

    let attached: usize = inspect.stdout.trim().parse().unwrap_or(usize::MAX);
    if attached > 0 {
        warn!(attached, "kind network still has containers, leaving it");
        return Ok(false);
    }

    run_checked(runner, &Cmd::new("docker").args(["network", "rm", "kind"]))
        .context("Failed to remove kind network")?;
    info!("Removed stale kind network");
    Ok(true)
}

/// Unmount the host driver procfs inside each kind node.
///
/// Returns the nodes where something was unmounted.
///
/// # Errors
///
/// Returns an error if an unmount fails for a reason other than the path not
/// being mounted.
pub fn fix_node_gpu_mounts(runner: &dyn CommandRunner, nodes: &[String]) -> Result<Vec<String>> {
    let mut fixed = Vec::new();
    for node in nodes {
        let output = runner.run(&Cmd::new("docker").args([
            "exec",
            node,
            "umount",
            "-R",
            "/proc/driver/nvidia",
        ]))?;

        if output.success() {
            info!(node = %node, "Unmounted /proc/driver/nvidia");
            fixed.push(node.clone());
        } else if output.stderr.contains("not mounted")
            || output.stderr.contains("No such file")
            || output.stderr.contains("no mount point")
        {
            debug!(node = %node, "Driver procfs not mounted");
        } else {
            anyhow::bail!(
                "Failed to unmount /proc/driver/nvidia in {node}: {}",
                output.stderr.trim()
            );
        }
    }
    Ok(fixed)
}

/// Export the cluster kubeconfig into the work dir only.
///
/// The user's default kubeconfig and current context are left alone.
///
/// # Errors
///
/// Returns an error if kind cannot export the kubeconfig.
pub fn export_kubeconfig(runner: &dyn CommandRunner, config: &BenchConfig) -> Result<PathBuf> {
    let kubeconfig = config.kubeconfig_path();
    if let Some(dir) = kubeconfig.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    run_checked(
        runner,
        &Cmd::new("kind").args([
            "export",
            "kubeconfig",
            "--name",
            config.cluster.name.as_str(),
            "--kubeconfig",
            &kubeconfig.to_string_lossy(),
        ]),
    )
    .context("Failed to export kubeconfig")?;
    Ok(kubeconfig)
}

/// Export the cluster kubeconfig into the work dir and make `kind-<name>`
/// the default context.
///
/// # Errors
///
/// Returns an error if kind cannot export the kubeconfig.
pub fn ensure_kube_context(runner: &dyn CommandRunner, config: &BenchConfig) -> Result<PathBuf> {
    let kubeconfig = export_kubeconfig(runner, config)?;

    // Also merge into the user's default kubeconfig so plain kubectl works.
    if let Err(e) = run_checked(
        runner,
        &Cmd::new("kind").args(["export", "kubeconfig", "--name", config.cluster.name.as_str()]),
    ) {
        warn!(error = %e, "Failed to update default kubeconfig");
    }

    info!(context = %config.kube_context(), path = %kubeconfig.display(), "Kube context ready");
    Ok(kubeconfig)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::exec::scripted::ScriptedRunner;
    use crate::exec::CmdOutput;

    #[test]
    fn test_inotify_only_raises_low_limits() {
        let runner = ScriptedRunner::new()
            .on("-n fs.inotify.max_user_watches", CmdOutput::ok("8192\n"))
            .on("-n fs.inotify.max_user_instances", CmdOutput::ok("1024\n"));

        let changed = ensure_inotify_limits(&runner).unwrap();
        assert_eq!(changed, vec!["fs.inotify.max_user_watches"]);
        assert!(runner.ran("sudo sysctl -w fs.inotify.max_user_watches=524288"));
        assert!(!runner.ran("sysctl -w fs.inotify.max_user_instances"));
    }

    #[test]
    fn test_nvidia_runtime_needs_config() {
        let good = format!("{VOLUME_MOUNTS_KEY} = true\n[nvidia-container-cli]\nldconfig = \"@/sbin/ldconfig\"\n");
        assert!(!nvidia_runtime_needs_config(&good, "nvidia\n").unwrap());
        assert!(nvidia_runtime_needs_config(&good, "runc").unwrap());

        let off = format!("{VOLUME_MOUNTS_KEY} = false\n");
        assert!(nvidia_runtime_needs_config(&off, "nvidia").unwrap());
        assert!(nvidia_runtime_needs_config("", "nvidia").unwrap());
        assert!(nvidia_runtime_needs_config("not = [valid", "nvidia").is_err());
    }

    #[tokio::test]
    async fn test_nvidia_runtime_left_alone_when_configured() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, format!("{VOLUME_MOUNTS_KEY} = true\n")).unwrap();
        let runner = ScriptedRunner::new().on("DefaultRuntime", CmdOutput::ok("nvidia\n"));

        assert!(!ensure_nvidia_runtime(&runner, &path).await.unwrap());
        assert!(!runner.ran("nvidia-ctk"));
    }

    #[tokio::test]
    async fn test_nvidia_runtime_configured_and_docker_restarted() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new().on("DefaultRuntime", CmdOutput::ok("runc\n"));

        let changed = ensure_nvidia_runtime(&runner, &dir.path().join("missing.toml"))
            .await
            .unwrap();
        assert!(changed);
        assert!(runner.ran("sudo nvidia-ctk runtime configure --runtime=docker --set-as-default"));
        assert!(runner.ran(
            "sudo nvidia-ctk config --set accept-nvidia-visible-devices-as-volume-mounts=true --in-place"
        ));
        assert!(runner.ran("sudo systemctl restart docker"));
    }

    #[test]
    fn test_prune_kind_network() {
        let runner = ScriptedRunner::new().on("network inspect", CmdOutput::ok("0\n"));
        assert!(prune_kind_network(&runner).unwrap());
        assert!(runner.ran("docker network rm kind"));

        let runner = ScriptedRunner::new().on("network inspect", CmdOutput::ok("3\n"));
        assert!(!prune_kind_network(&runner).unwrap());
        assert!(!runner.ran("network rm"));

        let runner = ScriptedRunner::new()
            .on("network inspect", CmdOutput::failed(1, "Error: No such network: kind"));
        assert!(!prune_kind_network(&runner).unwrap());
    }

    #[test]
    fn test_fix_node_gpu_mounts() {
        let runner = ScriptedRunner::new()
            .on(
                "exec lab-control-plane",
                CmdOutput::failed(32, "umount: /proc/driver/nvidia: not mounted."),
            )
            .on("exec lab-worker", CmdOutput::ok(""));

        let nodes = vec!["lab-control-plane".to_string(), "lab-worker".to_string()];
        let fixed = fix_node_gpu_mounts(&runner, &nodes).unwrap();
        assert_eq!(fixed, vec!["lab-worker"]);

        let runner = ScriptedRunner::new()
            .on("umount", CmdOutput::failed(1, "Error response from daemon: container is not running"));
        assert!(fix_node_gpu_mounts(&runner, &nodes).is_err());
    }

    #[test]
    fn test_ensure_kube_context() {
        let dir = TempDir::new().unwrap();
        let mut config = BenchConfig::default();
        config.work_dir = Some(dir.path().to_path_buf());
        let runner = ScriptedRunner::new();

        let path = ensure_kube_context(&runner, &config).unwrap();
        assert_eq!(path, dir.path().join("kubeconfig"));
        assert!(runner.ran(&format!(
            "kind export kubeconfig --name gpubench --kubeconfig {}",
            path.display()
        )));
        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn test_export_kubeconfig_leaves_default_context_alone() {
        let dir = TempDir::new().unwrap();
        let mut config = BenchConfig::default();
        config.work_dir = Some(dir.path().to_path_buf());
        let runner = ScriptedRunner::new();

        let path = export_kubeconfig(&runner, &config).unwrap();
        assert_eq!(path, dir.path().join("kubeconfig"));
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("--kubeconfig"));
    }
}
