use anyhow::Result;
use clap::Args;

use gpubench::serving::ServingDeployer;
use gpubench::ui;

use super::Context;

/// Deploy the model-serving stack.
#[derive(Args)]
pub struct DeployCommand {
    /// Uninstall the serving release instead.
    #[arg(long)]
    uninstall: bool,
}

impl DeployCommand {
    /// Run the deploy command.
    ///
    /// # Errors
    ///
    /// Returns an error if helm/kubectl fail or the rollout times out.
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let kubeconfig = ctx.config.kubeconfig_path();
        let deployer = ServingDeployer::new(&ctx.runner, &ctx.config, &kubeconfig);

        if self.uninstall {
            if deployer.uninstall()? {
                ui::print_success("Serving stack uninstalled");
            } else {
                ui::print_info("Serving stack was not installed");
            }
            return Ok(());
        }

        ui::print_section("Model Serving");
        deployer.deploy().await?;
        ui::print_info("Run `gpubench forward start` to reach it locally");
        Ok(())
    }
}
