//! Ordered, idempotent teardown.
//!
//! Every step runs even if an earlier one failed; failures are collected in
//! the [`TeardownReport`] rather than aborting the teardown half-way.

use anyhow::Result;
use tracing::{info, warn};

use crate::bench::BenchRunner;
use crate::cluster::ClusterProvisioner;
use crate::config::BenchConfig;
use crate::exec::CommandRunner;
use crate::portforward::PortForward;
use crate::serving::ServingDeployer;
use crate::state::UpState;
use crate::ui;

#[derive(Debug, Clone, Copy, Default)]
pub struct TeardownOptions {
    /// Leave the kind cluster in place.
    pub keep_cluster: bool,
    /// Leave a running benchmark alone.
    pub keep_benchmark: bool,
    /// Uninstall the serving release (only meaningful with `keep_cluster`).
    pub uninstall_serving: bool,
    /// Remove the whole work directory.
    pub purge: bool,
}

/// Result of one teardown step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    NothingToDo,
    Skipped,
    Failed(String),
}

#[derive(Debug, Default)]
pub struct TeardownReport {
    pub steps: Vec<(&'static str, StepOutcome)>,
}

impl TeardownReport {
    fn record(&mut self, name: &'static str, result: Result<bool>) {
        let outcome = match result {
            Ok(true) => StepOutcome::Done,
            Ok(false) => StepOutcome::NothingToDo,
            Err(e) => {
                warn!(step = name, error = %format!("{e:#}"), "Teardown step failed");
                StepOutcome::Failed(format!("{e:#}"))
            }
        };
        self.steps.push((name, outcome));
    }

    fn skip(&mut self, name: &'static str) {
        self.steps.push((name, StepOutcome::Skipped));
    }

    #[must_use]
    pub fn outcome(&self, name: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|(n, _)| *n == name).map(|(_, o)| o)
    }

    #[must_use]
    pub fn failures(&self) -> Vec<(&'static str, &str)> {
        self.steps
            .iter()
            .filter_map(|(name, outcome)| match outcome {
                StepOutcome::Failed(msg) => Some((*name, msg.as_str())),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures().is_empty()
    }

    pub fn print(&self) {
        for (name, outcome) in &self.steps {
            match outcome {
                StepOutcome::Done => ui::print_check_result(name, true, Some("done")),
                StepOutcome::NothingToDo => {
                    ui::print_check_result(name, true, Some("nothing to do"));
                }
                StepOutcome::Skipped => ui::print_info(&format!("{name}: skipped")),
                StepOutcome::Failed(msg) => ui::print_check_result(name, false, Some(msg.as_str())),
            }
        }
    }
}

/// Tear down everything `up` created.
pub async fn teardown(
    runner: &dyn CommandRunner,
    config: &BenchConfig,
    options: TeardownOptions,
) -> TeardownReport {
    let mut report = TeardownReport::default();

    if options.keep_benchmark {
        report.skip("stop benchmark");
    } else {
        let stopped = BenchRunner::new(runner, config).stop().await;
        report.record("stop benchmark", stopped);
    }

    let stopped = PortForward::new(runner, config).stop().await;
    report.record("stop port-forward", stopped);

    let kubeconfig = config.kubeconfig_path();
    if options.keep_cluster && options.uninstall_serving {
        let result = ServingDeployer::new(runner, config, &kubeconfig).uninstall();
        report.record("uninstall serving", result);
    } else {
        report.skip("uninstall serving");
    }

    if options.keep_cluster {
        report.skip("delete cluster");
    } else {
        let deleted = ClusterProvisioner::new(runner, config).delete();
        report.record("delete cluster", deleted);
        let existed = kubeconfig.exists();
        let removed = crate::process::remove_if_exists(&kubeconfig)
            .map(|()| existed)
            .map_err(anyhow::Error::from);
        report.record("remove kubeconfig", removed);
    }

    report.record("remove state", UpState::remove(&config.state_file()));

    if options.purge {
        let dir = config.work_dir();
        let purged = if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .map(|()| true)
                .map_err(anyhow::Error::from)
        } else {
            Ok(false)
        };
        report.record("purge work dir", purged);
    }

    info!(clean = report.is_clean(), "Teardown finished");
    report
}
