//! Dependency installer.
//!
//! Downloads pinned releases of kind, kubectl and helm into the bin directory
//! and installs the load generator with pip. Tools already on the search path
//! are left alone, so the step is safe to re-run.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::config::BenchConfig;
use crate::exec::{run_checked, Cmd, CommandRunner};
use crate::retry::{retry_async, RetryConfig};
use crate::ui;

/// Target platform for binary downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: &'static str,
    pub arch: &'static str,
}

impl Platform {
    /// Detect the running platform.
    ///
    /// # Errors
    ///
    /// Returns an error on platforms without upstream release binaries.
    pub fn detect() -> Result<Self> {
        Self::from_std(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Map Rust's platform names to release asset names.
    ///
    /// # Errors
    ///
    /// Returns an error for unsupported OS / architecture pairs.
    pub fn from_std(os: &str, arch: &str) -> Result<Self> {
        let os = match os {
            "linux" => "linux",
            "macos" => "darwin",
            other => anyhow::bail!("Unsupported operating system: {other}"),
        };
        let arch = match arch {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => anyhow::bail!("Unsupported architecture: {other}"),
        };
        Ok(Self { os, arch })
    }
}

/// CLIs fetched as release binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Kind,
    Kubectl,
    Helm,
}

impl Tool {
    pub const ALL: [Self; 3] = [Self::Kind, Self::Kubectl, Self::Helm];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Kind => "kind",
            Self::Kubectl => "kubectl",
            Self::Helm => "helm",
        }
    }

    /// Pinned version from the config.
    #[must_use]
    pub fn version(self, config: &BenchConfig) -> &str {
        match self {
            Self::Kind => &config.tools.kind_version,
            Self::Kubectl => &config.tools.kubectl_version,
            Self::Helm => &config.tools.helm_version,
        }
    }

    /// Release download URL.
    #[must_use]
    pub fn download_url(self, version: &str, platform: Platform) -> String {
        let Platform { os, arch } = platform;
        match self {
            Self::Kind => format!("https://kind.sigs.k8s.io/dl/{version}/kind-{os}-{arch}"),
            Self::Kubectl => {
                format!("https://dl.k8s.io/release/{version}/bin/{os}/{arch}/kubectl")
            }
            Self::Helm => format!("https://get.helm.sh/helm-{version}-{os}-{arch}.tar.gz"),
        }
    }

    /// Path of the binary inside the release archive, if archived.
    fn archive_member(self, platform: Platform) -> Option<String> {
        match self {
            Self::Helm => Some(format!("{}-{}/helm", platform.os, platform.arch)),
            Self::Kind | Self::Kubectl => None,
        }
    }
}

/// What happened to a dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallAction {
    AlreadyPresent(PathBuf),
    Installed(PathBuf),
}

/// Installs missing tools.
pub struct DependencyInstaller<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a BenchConfig,
    client: reqwest::Client,
    retry: RetryConfig,
}

impl<'a> DependencyInstaller<'a> {
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner, config: &'a BenchConfig) -> Self {
        Self {
            runner,
            config,
            client: reqwest::Client::new(),
            retry: RetryConfig::quick(4),
        }
    }

    /// Install every missing dependency.
    ///
    /// # Errors
    ///
    /// Returns an error if a download or install fails.
    pub async fn install_all(&self) -> Result<Vec<(String, InstallAction)>> {
        let platform = Platform::detect()?;
        let mut actions = Vec::new();

        for tool in Tool::ALL {
            let action = self.ensure_tool(tool, platform).await?;
            report(tool.name(), &action);
            actions.push((tool.name().to_string(), action));
        }

        let action = self.ensure_load_generator()?;
        report(&self.config.benchmark.tool, &action);
        actions.push((self.config.benchmark.tool.clone(), action));

        Ok(actions)
    }

    /// Download `tool` unless it is already available.
    ///
    /// # Errors
    ///
    /// Returns an error if the download or extraction fails.
    pub async fn ensure_tool(&self, tool: Tool, platform: Platform) -> Result<InstallAction> {
        if let Some(path) = self.runner.which(tool.name()) {
            return Ok(InstallAction::AlreadyPresent(path));
        }

        let version = tool.version(self.config);
        let url = tool.download_url(version, platform);
        let bin_dir = self.config.bin_dir();
        fs::create_dir_all(&bin_dir)
            .with_context(|| format!("Failed to create {}", bin_dir.display()))?;
        let target = bin_dir.join(tool.name());

        ui::print_progress(&format!("Downloading {} {version}...", tool.name()));
        match tool.archive_member(platform) {
            None => self.download_to(&url, &target).await?,
            Some(member) => {
                let scratch = tempfile::tempdir().context("Failed to create temp dir")?;
                let archive = scratch.path().join("archive.tar.gz");
                self.download_to(&url, &archive).await?;
                run_checked(
                    self.runner,
                    &Cmd::new("tar").args([
                        "-xzf",
                        &archive.to_string_lossy(),
                        "-C",
                        &scratch.path().to_string_lossy(),
                        &member,
                    ]),
                )
                .with_context(|| format!("Failed to extract {}", tool.name()))?;
                fs::copy(scratch.path().join(&member), &target)
                    .with_context(|| format!("Failed to install {}", target.display()))?;
            }
        }
        make_executable(&target)?;

        info!(tool = tool.name(), version, path = %target.display(), "Installed tool");
        Ok(InstallAction::Installed(target))
    }

    /// Fetch `url` into `dest`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns an error on a non-success status or I/O failure.
    pub async fn download_to(&self, url: &str, dest: &Path) -> Result<()> {
        let bytes = retry_async(&self.retry, url, move || async move {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(crate::error::Error::from)?;
            let status = response.status();
            if !status.is_success() {
                anyhow::bail!("HTTP {}", status.as_u16());
            }
            Ok(response.bytes().await.map_err(crate::error::Error::from)?)
        })
        .await
        .with_context(|| format!("Failed to download {url}"))?;

        fs::write(dest, &bytes).with_context(|| format!("Failed to write {}", dest.display()))?;
        Ok(())
    }

    /// Install the load generator with pip unless it is on the search path.
    ///
    /// # Errors
    ///
    /// Returns an error if pip fails or the tool is still missing afterwards.
    pub fn ensure_load_generator(&self) -> Result<InstallAction> {
        let tool = &self.config.benchmark.tool;
        if let Some(path) = self.runner.which(tool) {
            return Ok(InstallAction::AlreadyPresent(path));
        }

        let package = &self.config.tools.load_generator_package;
        ui::print_progress(&format!("Installing {package} with pip..."));
        run_checked(
            self.runner,
            &Cmd::new("python3").args(["-m", "pip", "install", "--user", "--upgrade", package]),
        )
        .with_context(|| format!("Failed to install {package}"))?;

        self.runner
            .which(tool)
            .map(InstallAction::Installed)
            .with_context(|| {
                format!(
                    "{tool} is still not on PATH after installing {package}; add {} to PATH",
                    self.config.bin_dir().display()
                )
            })
    }
}

fn make_executable(path: &Path) -> Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(path, permissions)
        .with_context(|| format!("Failed to chmod {}", path.display()))
}

fn report(name: &str, action: &InstallAction) {
    match action {
        InstallAction::AlreadyPresent(path) => {
            ui::print_check_result(name, true, Some(format!("found at {}", path.display()).as_str()));
        }
        InstallAction::Installed(path) => {
            ui::print_success(&format!("{name} installed to {}", path.display()));
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::exec::scripted::ScriptedRunner;
    use crate::exec::CmdOutput;

    #[test]
    fn test_platform_mapping() {
        let linux = Platform::from_std("linux", "x86_64").unwrap();
        assert_eq!(linux, Platform { os: "linux", arch: "amd64" });

        let mac = Platform::from_std("macos", "aarch64").unwrap();
        assert_eq!(mac, Platform { os: "darwin", arch: "arm64" });

        assert!(Platform::from_std("windows", "x86_64").is_err());
        assert!(Platform::from_std("linux", "riscv64").is_err());
    }

    #[test]
    fn test_download_urls() {
        let platform = Platform { os: "linux", arch: "amd64" };
        assert_eq!(
            Tool::Kind.download_url("v0.24.0", platform),
            "https://kind.sigs.k8s.io/dl/v0.24.0/kind-linux-amd64"
        );
        assert_eq!(
            Tool::Kubectl.download_url("v1.31.0", platform),
            "https://dl.k8s.io/release/v1.31.0/bin/linux/amd64/kubectl"
        );
        assert_eq!(
            Tool::Helm.download_url("v3.16.2", platform),
            "https://get.helm.sh/helm-v3.16.2-linux-amd64.tar.gz"
        );
        assert_eq!(
            Tool::Helm.archive_member(platform).as_deref(),
            Some("linux-amd64/helm")
        );
    }

    #[tokio::test]
    async fn test_present_tool_is_skipped() {
        let runner = ScriptedRunner::new();
        let config = BenchConfig::default();
        let installer = DependencyInstaller::new(&runner, &config);

        let action = installer
            .ensure_tool(Tool::Kind, Platform { os: "linux", arch: "amd64" })
            .await
            .unwrap();
        assert_eq!(action, InstallAction::AlreadyPresent(PathBuf::from("/usr/bin/kind")));
    }

    #[tokio::test]
    async fn test_download_to_writes_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/kind"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"#!/bin/sh\n".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new();
        let config = BenchConfig::default();
        let installer = DependencyInstaller::new(&runner, &config);

        let dest = dir.path().join("kind");
        installer
            .download_to(&format!("{}/kind", server.uri()), &dest)
            .await
            .unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"#!/bin/sh\n");

        make_executable(&dest).unwrap();
        let mode = fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_download_to_rejects_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let runner = ScriptedRunner::new();
        let config = BenchConfig::default();
        let installer = DependencyInstaller::new(&runner, &config);

        let err = installer
            .download_to(&format!("{}/missing", server.uri()), &dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("HTTP 404"));
    }

    #[test]
    fn test_load_generator_installed_with_pip() {
        let runner = ScriptedRunner::with_tools(&["python3"])
            .on("pip install", CmdOutput::ok("Successfully installed guidellm"));
        let config = BenchConfig::default();
        let installer = DependencyInstaller::new(&runner, &config);

        // Still missing afterwards: the scripted PATH never gains guidellm.
        let err = installer.ensure_load_generator().unwrap_err();
        assert!(err.to_string().contains("still not on PATH"));
        assert!(runner.ran("python3 -m pip install --user --upgrade guidellm"));
    }
}
