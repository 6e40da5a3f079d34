use anyhow::Result;
use clap::Args;

use gpubench::gpu::GpuOperator;
use gpubench::ui;

use super::Context;

/// Install the GPU operator and wait for GPU capacity.
#[derive(Args)]
pub struct GpuCommand {
    /// Only wait for capacity, do not (re)install the operator.
    #[arg(long)]
    wait_only: bool,

    /// Minimum allocatable GPUs to wait for (default: what serving needs).
    #[arg(long, value_name = "N")]
    min: Option<u64>,

    /// Uninstall the operator instead.
    #[arg(long, conflicts_with_all = ["wait_only", "min"])]
    uninstall: bool,
}

impl GpuCommand {
    /// Run the gpu command.
    ///
    /// # Errors
    ///
    /// Returns an error if helm fails or capacity never shows up.
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let kubeconfig = ctx.config.kubeconfig_path();
        let operator = GpuOperator::new(&ctx.runner, &ctx.config, &kubeconfig);

        if self.uninstall {
            if operator.uninstall()? {
                ui::print_success("GPU operator uninstalled");
            } else {
                ui::print_info("GPU operator was not installed");
            }
            return Ok(());
        }

        ui::print_section("GPU Operator");
        if !self.wait_only {
            operator.install()?;
        }
        let min = self.min.unwrap_or_else(|| ctx.config.required_gpus());
        operator.wait_for_capacity(min).await?;
        Ok(())
    }
}
