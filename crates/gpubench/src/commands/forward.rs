use anyhow::Result;
use clap::{Args, Subcommand};

use gpubench::portforward::{ForwardStatus, PortForward};
use gpubench::ui;

use super::Context;

/// Manage the background port-forward.
#[derive(Args)]
pub struct ForwardCommand {
    #[command(subcommand)]
    action: ForwardAction,
}

#[derive(Subcommand)]
enum ForwardAction {
    /// Start (or restart) the forward, reclaiming the local port.
    Start,
    /// Stop the forward.
    Stop,
    /// Show whether the forward is running.
    Status,
}

impl ForwardCommand {
    /// Run the forward command.
    ///
    /// # Errors
    ///
    /// Returns an error if the forward cannot be started or stopped.
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let forward = PortForward::new(&ctx.runner, &ctx.config);

        match self.action {
            ForwardAction::Start => {
                let pid = forward.start().await?;
                ui::print_success(&format!(
                    "Forwarding {} (pid {pid})",
                    ctx.config.serving_url()
                ));
                ui::print_kv("Log", &forward.job().log_file().display().to_string());
            }
            ForwardAction::Stop => {
                if forward.stop().await? {
                    ui::print_success("Port-forward stopped");
                } else {
                    ui::print_info("No port-forward running");
                }
            }
            ForwardAction::Status => {
                let status = forward.status();
                ui::print_check_result(
                    "port-forward",
                    matches!(status, ForwardStatus::Active { .. }),
                    Some(status.to_string().as_str()),
                );
                ui::print_kv("Endpoint", &ctx.config.serving_url());
            }
        }
        Ok(())
    }
}
