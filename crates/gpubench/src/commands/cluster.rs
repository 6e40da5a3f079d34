use anyhow::Result;
use clap::{Args, Subcommand};

use gpubench::cluster::{ClusterProvisioner, CreateOutcome};
use gpubench::repair;
use gpubench::ui;

use super::Context;

/// Manage the kind cluster.
#[derive(Args)]
pub struct ClusterCommand {
    #[command(subcommand)]
    action: ClusterAction,
}

#[derive(Subcommand)]
enum ClusterAction {
    /// Create the cluster, reusing a healthy one.
    Create {
        /// Delete and recreate an existing cluster.
        #[arg(long)]
        recreate: bool,
    },
    /// Delete the cluster.
    Delete,
    /// Show whether the cluster exists and answers.
    Status,
}

impl ClusterCommand {
    /// Run the cluster command.
    ///
    /// # Errors
    ///
    /// Returns an error if kind or kubectl fail.
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let cluster = ClusterProvisioner::new(&ctx.runner, &ctx.config);
        let name = &ctx.config.cluster.name;

        match self.action {
            ClusterAction::Create { recreate } => {
                if cluster.create(recreate).await? == CreateOutcome::Created {
                    let nodes = cluster.node_containers()?;
                    repair::fix_node_gpu_mounts(&ctx.runner, &nodes)?;
                }
                ui::print_kv("Context", &ctx.config.kube_context());
                ui::print_kv("Kubeconfig", &ctx.config.kubeconfig_path().display().to_string());
            }
            ClusterAction::Delete => {
                if cluster.delete()? {
                    ui::print_success(&format!("Deleted kind cluster '{name}'"));
                } else {
                    ui::print_info(&format!("kind cluster '{name}' does not exist"));
                }
            }
            ClusterAction::Status => {
                let status = cluster.status()?;
                ui::print_check_result(name, status.exists, Some(if status.exists { "exists" } else { "not found" }));
                if status.exists {
                    ui::print_check_result("API server", status.healthy, None);
                    for node in &status.nodes {
                        ui::print_kv("Node", node);
                    }
                }
            }
        }
        Ok(())
    }
}
