use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use gpubench::cluster::ClusterProvisioner;
use gpubench::repair;
use gpubench::ui;

use super::Context;

/// Fix host and node settings kind needs for GPUs.
#[derive(Args)]
pub struct RepairCommand {
    /// Also remove the kind docker network if nothing uses it.
    #[arg(long)]
    prune_network: bool,

    /// NVIDIA container runtime config file.
    #[arg(long, value_name = "FILE", default_value = repair::NVIDIA_RUNTIME_CONFIG)]
    runtime_config: PathBuf,
}

impl RepairCommand {
    /// Run the repair command.
    ///
    /// # Errors
    ///
    /// Returns an error if a repair step fails.
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        ui::print_section("Repair");

        let raised = repair::ensure_inotify_limits(&ctx.runner)?;
        let detail = if raised.is_empty() {
            "already sufficient".to_string()
        } else {
            format!("raised {}", raised.join(", "))
        };
        ui::print_check_result("inotify limits", true, Some(detail.as_str()));

        let reconfigured = repair::ensure_nvidia_runtime(&ctx.runner, &self.runtime_config).await?;
        ui::print_check_result(
            "NVIDIA runtime",
            true,
            Some(if reconfigured { "configured, docker restarted" } else { "already configured" }),
        );

        if self.prune_network {
            let pruned = repair::prune_kind_network(&ctx.runner)?;
            ui::print_check_result(
                "kind network",
                true,
                Some(if pruned { "removed" } else { "left in place" }),
            );
        }

        let cluster = ClusterProvisioner::new(&ctx.runner, &ctx.config);
        if cluster.exists()? {
            let nodes = cluster.node_containers()?;
            let fixed = repair::fix_node_gpu_mounts(&ctx.runner, &nodes)?;
            ui::print_check_result(
                "node GPU mounts",
                true,
                Some(format!("{} of {} nodes fixed", fixed.len(), nodes.len()).as_str()),
            );

            let kubeconfig = repair::ensure_kube_context(&ctx.runner, &ctx.config)?;
            ui::print_check_result(
                "kube context",
                true,
                Some(format!("{} ({})", ctx.config.kube_context(), kubeconfig.display()).as_str()),
            );
        } else {
            ui::print_info("No cluster yet, skipping node repairs");
        }

        ui::print_success("Repair complete");
        Ok(())
    }
}
