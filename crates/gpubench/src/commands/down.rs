use anyhow::Result;
use clap::Args;
use colored::Colorize;
use dialoguer::{theme::ColorfulTheme, Confirm};

use gpubench::teardown::{teardown, TeardownOptions};
use gpubench::ui;

use super::Context;

/// Tear everything down.
#[derive(Args)]
pub struct DownCommand {
    /// Keep the kind cluster.
    #[arg(long)]
    keep_cluster: bool,

    /// Leave a running benchmark alone.
    #[arg(long)]
    keep_benchmark: bool,

    /// Uninstall the serving stack from a kept cluster.
    #[arg(long, requires = "keep_cluster")]
    uninstall_serving: bool,

    /// Also delete the work directory (logs, results, state).
    #[arg(long)]
    purge: bool,

    /// Do not ask for confirmation.
    #[arg(short, long)]
    yes: bool,
}

impl DownCommand {
    /// Run the down command.
    ///
    /// # Errors
    ///
    /// Returns an error if any teardown step failed.
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        if !self.yes && !self.keep_cluster {
            let proceed = Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(format!(
                    "Delete kind cluster '{}' and stop background jobs?",
                    ctx.config.cluster.name
                ))
                .default(false)
                .interact()?;

            if !proceed {
                println!("{}", "Teardown cancelled.".yellow());
                return Ok(());
            }
        }

        ui::print_section("Teardown");
        let report = teardown(
            &ctx.runner,
            &ctx.config,
            TeardownOptions {
                keep_cluster: self.keep_cluster,
                keep_benchmark: self.keep_benchmark,
                uninstall_serving: self.uninstall_serving,
                purge: self.purge,
            },
        )
        .await;
        report.print();

        let failures = report.failures();
        if failures.is_empty() {
            ui::print_success("Teardown complete");
            Ok(())
        } else {
            anyhow::bail!("{} teardown step(s) failed", failures.len())
        }
    }
}
