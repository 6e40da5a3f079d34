//! gpubench library.
//!
//! Brings up a GPU-enabled kind cluster on a single workstation, deploys a
//! model-serving stack onto it and drives a load-generation benchmark in the
//! background. Every external tool runs through [`exec::CommandRunner`].
//!
//! # Example
//!
//! ```ignore
//! use gpubench::{BenchConfig, Orchestrator, SystemRunner, UpOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BenchConfig::default();
//!     let runner = SystemRunner::with_bin_dir(config.bin_dir());
//!     let mut up = Orchestrator::new_or_resume(&runner, config, UpOptions::default())?;
//!     up.run_to_completion().await
//! }
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

pub mod bench;
pub mod cluster;
pub mod config;
pub mod deps;
pub mod error;
pub mod exec;
pub mod gpu;
pub mod kube;
pub mod orchestrator;
pub mod portforward;
pub mod ports;
pub mod process;
pub mod repair;
pub mod retry;
pub mod serving;
pub mod state;
pub mod teardown;
pub mod ui;
pub mod validator;

pub use bench::{BenchRunner, BenchStatus};
pub use config::{BenchConfig, ConfigOverrides};
pub use error::{Error, Result};
pub use exec::{Cmd, CmdOutput, CommandRunner, SystemRunner};
pub use orchestrator::{Orchestrator, UpOptions};
pub use state::{UpState, UpStep};
pub use teardown::{teardown, TeardownOptions, TeardownReport};
