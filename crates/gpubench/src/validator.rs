use std::path::Path;

use anyhow::Result;
use colored::Colorize;
use sysinfo::{Disks, System};

use crate::config::BenchConfig;
use crate::exec::{Cmd, CommandRunner};
use crate::ui;

/// Minimum host memory for a kind node plus a small model.
const MIN_MEMORY_GB: u64 = 16;
/// Minimum free disk for node images and model weights.
const MIN_DISK_GB: u64 = 50;

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub passed: bool,
    pub detail: Option<String>,
}

impl Check {
    fn pass(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            detail: Some(detail.into()),
        }
    }

    fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: Some(detail.into()),
        }
    }
}

type CheckFn = Box<dyn Fn(&dyn CommandRunner) -> Check + Send + Sync>;

/// Validates the host before bring-up.
pub struct PrerequisitesValidator {
    requirements: Vec<Requirement>,
}

struct Requirement {
    name: String,
    check: CheckFn,
    install_instructions: String,
    critical: bool,
}

/// Result of one requirement.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub name: String,
    pub check: Check,
    pub install_instructions: String,
    pub critical: bool,
}

/// Results of every requirement.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub outcomes: Vec<CheckOutcome>,
}

impl ValidationReport {
    /// Failed requirements that block the bring-up.
    pub fn critical_failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.critical && !o.check.passed)
    }

    /// Failed requirements that only warrant a warning.
    pub fn advisories(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.outcomes
            .iter()
            .filter(|o| !o.critical && !o.check.passed)
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.critical_failures().next().is_none()
    }
}

impl PrerequisitesValidator {
    /// Validator with no requirements.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            requirements: Vec::new(),
        }
    }

    /// Every requirement of a GPU kind bring-up.
    #[must_use]
    pub fn new(config: &BenchConfig) -> Self {
        let mut validator = Self::empty();

        validator.push(
            "Docker",
            true,
            "Install Docker from https://docs.docker.com/engine/install/ and make sure the daemon is running",
            check_docker,
        );
        validator.push(
            "NVIDIA driver",
            true,
            "Install the NVIDIA driver so that `nvidia-smi -L` lists your GPUs",
            check_nvidia_driver,
        );
        validator.push(
            "NVIDIA Container Toolkit",
            true,
            "Install nvidia-container-toolkit from https://docs.nvidia.com/datacenter/cloud-native/container-toolkit/",
            |runner| check_version(runner, "nvidia-ctk", &["--version"]),
        );
        let clis: [(&'static str, &'static [&'static str]); 3] = [
            ("kind", &["version"]),
            ("kubectl", &["version", "--client"]),
            ("helm", &["version", "--short"]),
        ];
        for (tool, args) in clis {
            validator.push(
                tool,
                false,
                "Installed automatically by `gpubench deps`",
                move |runner| check_version(runner, tool, args),
            );
        }

        let load_generator = config.benchmark.tool.clone();
        let package = config.tools.load_generator_package.clone();
        validator.push(
            &load_generator.clone(),
            false,
            &format!("Installed automatically by `gpubench deps` (pip package {package})"),
            move |runner| match runner.which(&load_generator) {
                Some(path) => Check::pass(path.display().to_string()),
                None => Check::fail("not found"),
            },
        );

        validator.push(
            "System memory",
            true,
            &format!("At least {MIN_MEMORY_GB}GB of RAM is required"),
            |_| check_memory(MIN_MEMORY_GB),
        );

        let work_dir = config.work_dir();
        validator.push(
            "Free disk",
            false,
            &format!("At least {MIN_DISK_GB}GB free is recommended for images and model weights"),
            move |_| check_disk(&work_dir, MIN_DISK_GB),
        );

        validator
    }

    /// Add a requirement.
    pub fn push<F>(&mut self, name: &str, critical: bool, install_instructions: &str, check: F)
    where
        F: Fn(&dyn CommandRunner) -> Check + Send + Sync + 'static,
    {
        self.requirements.push(Requirement {
            name: name.to_string(),
            check: Box::new(check),
            install_instructions: install_instructions.to_string(),
            critical,
        });
    }

    /// Run every check without printing.
    #[must_use]
    pub fn evaluate(&self, runner: &dyn CommandRunner) -> ValidationReport {
        ValidationReport {
            outcomes: self
                .requirements
                .iter()
                .map(|r| CheckOutcome {
                    name: r.name.clone(),
                    check: (r.check)(runner),
                    install_instructions: r.install_instructions.clone(),
                    critical: r.critical,
                })
                .collect(),
        }
    }

    /// Run every check and print a report.
    ///
    /// # Errors
    ///
    /// Returns an error if any critical requirement fails.
    pub fn validate(&self, runner: &dyn CommandRunner) -> Result<ValidationReport> {
        println!();
        let report = self.evaluate(runner);

        for outcome in &report.outcomes {
            ui::print_check_result(
                &outcome.name,
                outcome.check.passed,
                outcome.check.detail.as_deref(),
            );
        }
        println!();

        let failures: Vec<_> = report
            .outcomes
            .iter()
            .filter(|o| !o.check.passed)
            .collect();

        if failures.is_empty() {
            ui::print_success("All prerequisites met!");
            return Ok(report);
        }

        ui::print_warning("Some prerequisites are not met:");
        println!();
        for failure in &failures {
            if failure.critical {
                println!(
                    "  {} {} - {}",
                    "✗".red(),
                    failure.name.red(),
                    failure.install_instructions.bright_black()
                );
            } else {
                println!(
                    "  {} {} - {}",
                    "⚠".yellow(),
                    failure.name.yellow(),
                    failure.install_instructions.bright_black()
                );
            }
        }
        println!();

        if !report.passed() {
            anyhow::bail!(
                "Critical prerequisites not met. Please install the required tools and try again."
            );
        }
        Ok(report)
    }
}

/// First line of a successful version command.
fn check_version(runner: &dyn CommandRunner, tool: &str, args: &[&str]) -> Check {
    if runner.which(tool).is_none() {
        return Check::fail("not found");
    }
    match runner.run(&Cmd::new(tool).args(args.iter().copied())) {
        Ok(output) if output.success() => {
            Check::pass(output.stdout.lines().next().unwrap_or_default().trim())
        }
        Ok(output) => Check::fail(output.stderr.lines().next().unwrap_or("failed").trim()),
        Err(e) => Check::fail(e.to_string()),
    }
}

fn check_docker(runner: &dyn CommandRunner) -> Check {
    if runner.which("docker").is_none() {
        return Check::fail("not found");
    }
    let cmd = Cmd::new("docker").args(["info", "--format", "{{.ServerVersion}}"]);
    match runner.run(&cmd) {
        Ok(output) if output.success() => {
            Check::pass(format!("server {}", output.stdout.trim()))
        }
        Ok(_) => Check::fail("daemon not reachable (is it running, and can you access the socket?)"),
        Err(e) => Check::fail(e.to_string()),
    }
}

fn check_nvidia_driver(runner: &dyn CommandRunner) -> Check {
    match gpu_count(runner) {
        Some(0) => Check::fail("nvidia-smi found no GPUs"),
        Some(count) => Check::pass(format!("{count} GPU(s)")),
        None => Check::fail("nvidia-smi not available"),
    }
}

/// Number of GPUs `nvidia-smi -L` reports, `None` if it cannot run.
#[must_use]
pub fn gpu_count(runner: &dyn CommandRunner) -> Option<usize> {
    runner.which("nvidia-smi")?;
    let output = runner.run(&Cmd::new("nvidia-smi").arg("-L")).ok()?;
    output.success().then(|| count_gpu_lines(&output.stdout))
}

/// Count `GPU <n>: ...` lines in `nvidia-smi -L` output.
#[must_use]
pub fn count_gpu_lines(output: &str) -> usize {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("GPU "))
        .count()
}

fn check_memory(min_gb: u64) -> Check {
    let mut sys = System::new();
    sys.refresh_memory();
    let total_gb = sys.total_memory() / 1024 / 1024 / 1024;
    if total_gb < min_gb {
        Check::fail(format!("{total_gb}GB total"))
    } else {
        Check::pass(format!("{total_gb}GB total"))
    }
}

fn check_disk(path: &Path, min_gb: u64) -> Check {
    let disks = Disks::new_with_refreshed_list();
    // Longest mount point that prefixes the work dir (or its closest parent).
    let probe = path
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("/"));
    let disk = disks
        .list()
        .iter()
        .filter(|d| probe.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len());

    match disk {
        Some(disk) => {
            let free_gb = disk.available_space() / 1024 / 1024 / 1024;
            let detail = format!("{free_gb}GB free on {}", disk.mount_point().display());
            if free_gb < min_gb {
                Check::fail(detail)
            } else {
                Check::pass(detail)
            }
        }
        None => Check::fail("could not determine filesystem"),
    }
}

impl Default for PrerequisitesValidator {
    fn default() -> Self {
        Self::new(&BenchConfig::default())
    }
}
