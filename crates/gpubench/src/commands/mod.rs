//! CLI subcommand handlers.

mod bench;
mod check;
mod cluster;
mod deploy;
mod deps;
mod down;
mod forward;
mod gpu;
mod repair;
mod status;
mod up;

pub use bench::BenchCommand;
pub use check::CheckCommand;
pub use cluster::ClusterCommand;
pub use deploy::DeployCommand;
pub use deps::DepsCommand;
pub use down::DownCommand;
pub use forward::ForwardCommand;
pub use gpu::GpuCommand;
pub use repair::RepairCommand;
pub use status::StatusCommand;
pub use up::UpCommand;

use gpubench::config::BenchConfig;
use gpubench::exec::SystemRunner;

/// Resolved configuration plus the runner every command shares.
pub struct Context {
    pub config: BenchConfig,
    pub runner: SystemRunner,
}

impl Context {
    pub fn new(config: BenchConfig) -> Self {
        let runner = SystemRunner::with_bin_dir(config.bin_dir());
        Self { config, runner }
    }
}
