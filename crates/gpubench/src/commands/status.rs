use anyhow::Result;
use clap::Args;

use gpubench::bench::BenchRunner;
use gpubench::cluster::ClusterProvisioner;
use gpubench::portforward::{ForwardStatus, PortForward};
use gpubench::state::{UpState, UpStep};
use gpubench::ui;

use super::Context;

/// Show the state of every component.
#[derive(Args)]
pub struct StatusCommand {}

impl StatusCommand {
    /// Run the status command.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file is corrupt or kind cannot be run.
    pub fn run(&self, ctx: &Context) -> Result<()> {
        let config = &ctx.config;
        ui::print_section(&format!("gpubench: {}", config.cluster.name));

        match UpState::load(&config.state_file())? {
            Some(state) => {
                ui::print_kv(
                    "Bring-up",
                    &format!(
                        "[{}/{}] {}",
                        state.step.step_number(),
                        UpStep::TOTAL_STEPS,
                        state.step
                    ),
                );
                if let Some(err) = &state.last_error {
                    ui::print_warning(&format!("Last error: {err}"));
                }
                if let Some(gpus) = state.gpu_count {
                    ui::print_kv("GPUs", &gpus.to_string());
                }
            }
            None => ui::print_kv("Bring-up", "not started"),
        }

        let cluster = ClusterProvisioner::new(&ctx.runner, config).status()?;
        ui::print_check_result(
            "cluster",
            cluster.exists && cluster.healthy,
            Some(match (cluster.exists, cluster.healthy) {
                (false, _) => "not found",
                (true, false) => "unreachable",
                (true, true) => "ready",
            }),
        );

        let forward = PortForward::new(&ctx.runner, config).status();
        ui::print_check_result(
            "port-forward",
            matches!(forward, ForwardStatus::Active { .. }),
            Some(forward.to_string().as_str()),
        );

        let bench = BenchRunner::new(&ctx.runner, config).status();
        ui::print_kv("Benchmark", &bench.to_string());
        ui::print_kv("Endpoint", &config.serving_url());
        ui::print_kv("Work dir", &config.work_dir().display().to_string());
        Ok(())
    }
}
