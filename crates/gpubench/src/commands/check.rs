use anyhow::Result;
use clap::Args;

use gpubench::ui;
use gpubench::validator::PrerequisitesValidator;

use super::Context;

/// Check the host for required tools and resources.
#[derive(Args)]
pub struct CheckCommand {}

impl CheckCommand {
    /// Run the check command.
    ///
    /// # Errors
    ///
    /// Returns an error if a critical requirement is missing.
    pub fn run(&self, ctx: &Context) -> Result<()> {
        ui::print_section("Environment Check");
        PrerequisitesValidator::new(&ctx.config).validate(&ctx.runner)?;
        ui::print_success("Environment is ready");
        Ok(())
    }
}
