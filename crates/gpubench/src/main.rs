//! gpubench CLI.
//!
//! Brings up a GPU kind cluster, deploys a model-serving stack and runs a
//! load-generation benchmark against it.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gpubench::config::{BenchConfig, ConfigOverrides, CONFIG_ENV};

mod commands;

use commands::{
    BenchCommand, CheckCommand, ClusterCommand, Context, DeployCommand, DepsCommand, DownCommand,
    ForwardCommand, GpuCommand, RepairCommand, StatusCommand, UpCommand,
};

/// gpubench - GPU kind cluster bring-up and LLM serving benchmark.
#[derive(Parser)]
#[command(
    name = "gpubench",
    version,
    about = "GPU kind cluster bring-up and LLM serving benchmark",
    long_about = "Bring up a GPU-enabled kind cluster on this workstation, deploy a\n\
                  model-serving stack and benchmark it with a load generator.\n\n\
                  `up` is resumable - re-running it continues from the step that\n\
                  failed. Every other command is safe to repeat."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// YAML configuration file.
    #[arg(short, long, global = true, env = CONFIG_ENV, value_name = "FILE")]
    config: Option<PathBuf>,

    /// kind cluster name.
    #[arg(long, global = true, value_name = "NAME")]
    cluster_name: Option<String>,

    /// Model to serve (e.g. a Hugging Face repo id).
    #[arg(long, global = true, value_name = "MODEL")]
    model: Option<String>,

    /// Local port the serving endpoint is forwarded to.
    #[arg(long, global = true, value_name = "PORT")]
    local_port: Option<u16>,

    /// Directory for state, PID files and logs.
    #[arg(long, global = true, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the whole bring-up: checks, tools, cluster, GPU operator,
    /// serving stack, port-forward and benchmark.
    Up(UpCommand),

    /// Check the host for required tools and resources.
    Check(CheckCommand),

    /// Install missing CLIs and the load generator.
    Deps(DepsCommand),

    /// Fix host and node settings kind needs for GPUs.
    Repair(RepairCommand),

    /// Manage the kind cluster.
    Cluster(ClusterCommand),

    /// Install the GPU operator and wait for GPU capacity.
    Gpu(GpuCommand),

    /// Deploy the model-serving stack.
    Deploy(DeployCommand),

    /// Manage the background port-forward.
    Forward(ForwardCommand),

    /// Manage the background benchmark.
    Bench(BenchCommand),

    /// Show the state of every component.
    Status(StatusCommand),

    /// Tear everything down.
    Down(DownCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("info,gpubench=debug")
        } else {
            EnvFilter::new("warn,gpubench=info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = BenchConfig::load(cli.config.as_deref())?.with_overrides(ConfigOverrides {
        cluster_name: cli.cluster_name,
        model: cli.model,
        local_port: cli.local_port,
        work_dir: cli.work_dir,
    });
    config.validate()?;
    let ctx = Context::new(config);

    match cli.command {
        Commands::Up(cmd) => cmd.run(&ctx).await,
        Commands::Check(cmd) => cmd.run(&ctx),
        Commands::Deps(cmd) => cmd.run(&ctx).await,
        Commands::Repair(cmd) => cmd.run(&ctx).await,
        Commands::Cluster(cmd) => cmd.run(&ctx).await,
        Commands::Gpu(cmd) => cmd.run(&ctx).await,
        Commands::Deploy(cmd) => cmd.run(&ctx).await,
        Commands::Forward(cmd) => cmd.run(&ctx).await,
        Commands::Bench(cmd) => cmd.run(&ctx).await,
        Commands::Status(cmd) => cmd.run(&ctx),
        Commands::Down(cmd) => cmd.run(&ctx).await,
    }
}
