use std::time::Duration;

use anyhow::Result;
use clap::{Args, Subcommand};

use gpubench::bench::{BenchRunner, BenchStatus};
use gpubench::ui;

use super::Context;

/// Manage the background benchmark.
#[derive(Args)]
pub struct BenchCommand {
    #[command(subcommand)]
    action: BenchAction,
}

#[derive(Subcommand)]
enum BenchAction {
    /// Launch the benchmark in the background.
    Start,
    /// Show the benchmark status.
    Status,
    /// Block until the benchmark finishes; fails unless it succeeded.
    Wait {
        /// Give up after this many seconds.
        #[arg(long, default_value_t = 3600)]
        timeout: u64,

        /// Seconds between status checks.
        #[arg(long, default_value_t = 10)]
        interval: u64,
    },
    /// Print the tail of the benchmark log.
    Logs {
        /// Number of lines.
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
    /// Stop a running benchmark.
    Stop,
}

impl BenchCommand {
    /// Run the bench command.
    ///
    /// # Errors
    ///
    /// Returns an error if the benchmark cannot be started, failed, or the
    /// wait timed out.
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let bench = BenchRunner::new(&ctx.runner, &ctx.config);

        match self.action {
            BenchAction::Start => {
                let pid = bench.start()?;
                ui::print_success(&format!("Benchmark started (pid {pid})"));
                ui::print_kv("Log", &bench.job().log_file().display().to_string());
                ui::print_info("Follow with `gpubench bench status` or `gpubench bench wait`");
            }
            BenchAction::Status => {
                let status = bench.status();
                ui::print_check_result(
                    "benchmark",
                    !matches!(status, BenchStatus::Failed { .. } | BenchStatus::Lost),
                    Some(status.to_string().as_str()),
                );
                if let Some(results) = bench.results() {
                    ui::print_kv("Results", &results.display().to_string());
                }
            }
            BenchAction::Wait { timeout, interval } => {
                bench
                    .wait(Duration::from_secs(timeout), Duration::from_secs(interval.max(1)))
                    .await?;
                ui::print_success("Benchmark succeeded");
                if let Some(results) = bench.results() {
                    ui::print_kv("Results", &results.display().to_string());
                }
            }
            BenchAction::Logs { lines } => {
                let tail = bench.logs(lines)?;
                if tail.is_empty() {
                    ui::print_info("No benchmark log yet");
                } else {
                    ui::print_log_lines(&tail);
                }
            }
            BenchAction::Stop => {
                if bench.stop().await? {
                    ui::print_success("Benchmark stopped");
                } else {
                    ui::print_info("No benchmark running");
                }
            }
        }
        Ok(())
    }
}
