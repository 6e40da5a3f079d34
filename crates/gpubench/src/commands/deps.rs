use anyhow::Result;
use clap::Args;

use gpubench::deps::{DependencyInstaller, InstallAction};
use gpubench::ui;

use super::Context;

/// Install missing CLIs and the load generator.
#[derive(Args)]
pub struct DepsCommand {}

impl DepsCommand {
    /// Run the deps command.
    ///
    /// # Errors
    ///
    /// Returns an error if a download or install fails.
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        ui::print_section("Dependencies");
        let actions = DependencyInstaller::new(&ctx.runner, &ctx.config)
            .install_all()
            .await?;

        let installed = actions
            .iter()
            .filter(|(_, action)| matches!(action, InstallAction::Installed(_)))
            .count();
        if installed == 0 {
            ui::print_success("All dependencies already present");
        } else {
            ui::print_success(&format!("Installed {installed} dependencies"));
            ui::print_info(&format!(
                "Make sure {} is on your PATH",
                ctx.config.bin_dir().display()
            ));
        }
        Ok(())
    }
}
