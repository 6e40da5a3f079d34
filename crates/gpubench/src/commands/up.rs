use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use gpubench::orchestrator::{Orchestrator, UpOptions};
use gpubench::ui;

use super::Context;

/// Run the full bring-up.
#[derive(Args)]
pub struct UpCommand {
    /// Discard saved progress and start from the first step.
    #[arg(long)]
    fresh: bool,

    /// Skip environment checks.
    #[arg(long)]
    skip_checks: bool,

    /// Do not download missing tools.
    #[arg(long)]
    skip_deps: bool,

    /// Stop once the model is serving.
    #[arg(long)]
    skip_benchmark: bool,

    /// Block until the benchmark finishes.
    #[arg(long, conflicts_with = "skip_benchmark")]
    wait: bool,

    /// Delete and recreate an existing cluster.
    #[arg(long)]
    recreate_cluster: bool,

    /// NVIDIA container runtime config file to check and fix.
    #[arg(long, value_name = "FILE")]
    runtime_config: Option<PathBuf>,
}

impl UpCommand {
    /// Run the up command.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails for good.
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        ui::print_banner();

        let options = UpOptions {
            fresh: self.fresh,
            skip_checks: self.skip_checks,
            skip_deps: self.skip_deps,
            skip_benchmark: self.skip_benchmark,
            wait_benchmark: self.wait,
            recreate_cluster: self.recreate_cluster,
            runtime_config: self.runtime_config.clone(),
        };
        let mut orchestrator = Orchestrator::new_or_resume(&ctx.runner, ctx.config.clone(), options)?;
        orchestrator.run_to_completion().await
    }
}
