//! Bring-up configuration types.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then command-line overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "GPUBENCH_CONFIG";

/// Local kind cluster settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// kind cluster name.
    pub name: String,
    /// kind node image.
    pub node_image: String,
    /// Number of GPU worker nodes.
    pub gpu_workers: u8,
    /// Seconds to wait for nodes to become Ready.
    pub wait_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "gpubench".into(),
            node_image: "kindest/node:v1.31.0".into(),
            gpu_workers: 1,
            wait_timeout_secs: 300,
        }
    }
}

/// Versions and install locations of the external tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub kind_version: String,
    pub kubectl_version: String,
    pub helm_version: String,
    /// Where downloaded binaries go (default `~/.local/bin`).
    pub bin_dir: Option<PathBuf>,
    /// Python package providing the load generator.
    pub load_generator_package: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            kind_version: "v0.24.0".into(),
            kubectl_version: "v1.31.0".into(),
            helm_version: "v3.16.2".into(),
            bin_dir: None,
            load_generator_package: "guidellm".into(),
        }
    }
}

/// NVIDIA GPU operator chart settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuOperatorConfig {
    pub repo_name: String,
    pub repo_url: String,
    pub chart: String,
    /// Chart version; latest when unset.
    pub version: Option<String>,
    pub release: String,
    pub namespace: String,
    /// Let the operator install the driver. The host driver is used by default.
    pub driver_enabled: bool,
    /// Let the operator install the container toolkit into the nodes.
    pub toolkit_enabled: bool,
    /// Seconds to wait for GPUs to show up as allocatable.
    pub capacity_timeout_secs: u64,
}

impl Default for GpuOperatorConfig {
    fn default() -> Self {
        Self {
            repo_name: "nvidia".into(),
            repo_url: "https://helm.ngc.nvidia.com/nvidia".into(),
            chart: "nvidia/gpu-operator".into(),
            version: None,
            release: "gpu-operator".into(),
            namespace: "gpu-operator".into(),
            driver_enabled: false,
            toolkit_enabled: true,
            capacity_timeout_secs: 600,
        }
    }
}

/// Model-serving platform settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingConfig {
    pub repo_name: String,
    pub repo_url: String,
    pub chart: String,
    pub version: Option<String>,
    pub release: String,
    pub namespace: String,
    /// Model identifier served by the engine (e.g. a Hugging Face repo).
    pub model: String,
    /// Short name used in resource names.
    pub model_alias: String,
    pub image: String,
    pub tag: String,
    pub replicas: u8,
    pub gpus_per_replica: u8,
    pub max_model_len: Option<u32>,
    /// Service fronting the engine.
    pub service: String,
    pub service_port: u16,
    /// Local port the service is forwarded to.
    pub local_port: u16,
    /// Environment variable holding the Hugging Face token, if any.
    pub hf_token_env: String,
    /// Seconds to wait for the model endpoint.
    pub ready_timeout_secs: u64,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            repo_name: "vllm".into(),
            repo_url: "https://vllm-project.github.io/production-stack".into(),
            chart: "vllm/vllm-stack".into(),
            version: None,
            release: "vllm".into(),
            namespace: "default".into(),
            model: "facebook/opt-125m".into(),
            model_alias: "opt125m".into(),
            image: "vllm/vllm-openai".into(),
            tag: "latest".into(),
            replicas: 1,
            gpus_per_replica: 1,
            max_model_len: None,
            service: "vllm-router-service".into(),
            service_port: 80,
            local_port: 30080,
            hf_token_env: "HF_TOKEN".into(),
            ready_timeout_secs: 900,
        }
    }
}

/// Load generator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    /// Load generator executable.
    pub tool: String,
    pub rate_type: String,
    pub rate: Option<String>,
    pub max_seconds: u64,
    /// Synthetic data spec passed to the load generator.
    pub data: String,
    pub extra_args: Vec<String>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            tool: "guidellm".into(),
            rate_type: "sweep".into(),
            rate: None,
            max_seconds: 120,
            data: "prompt_tokens=256,output_tokens=128".into(),
            extra_args: Vec::new(),
        }
    }
}

/// Full bring-up configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub cluster: ClusterConfig,
    pub tools: ToolsConfig,
    pub gpu_operator: GpuOperatorConfig,
    pub serving: ServingConfig,
    pub benchmark: BenchmarkConfig,
    /// Directory for PID files, logs, state and results.
    pub work_dir: Option<PathBuf>,
}

/// Command-line overrides applied on top of the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub cluster_name: Option<String>,
    pub model: Option<String>,
    pub local_port: Option<u16>,
    pub work_dir: Option<PathBuf>,
}

impl BenchConfig {
    /// Load configuration from an optional YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Parse configuration from YAML; missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply command-line overrides.
    #[must_use]
    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(name) = overrides.cluster_name {
            self.cluster.name = name;
        }
        if let Some(model) = overrides.model {
            self.serving.model_alias = model_alias(&model);
            self.serving.model = model;
        }
        if let Some(port) = overrides.local_port {
            self.serving.local_port = port;
        }
        if overrides.work_dir.is_some() {
            self.work_dir = overrides.work_dir;
        }
        self
    }

    /// Reject values that would make the bring-up meaningless.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> crate::Result<()> {
        if self.cluster.name.trim().is_empty() {
            return Err(invalid("cluster.name must not be empty"));
        }
        if self.cluster.gpu_workers == 0 {
            return Err(invalid("cluster.gpu_workers must be at least 1"));
        }
        if self.serving.model.trim().is_empty() {
            return Err(invalid("serving.model must not be empty"));
        }
        if self.serving.local_port == 0 || self.serving.service_port == 0 {
            return Err(invalid("serving ports must be non-zero"));
        }
        if self.serving.gpus_per_replica == 0 || self.serving.replicas == 0 {
            return Err(invalid("serving.replicas and serving.gpus_per_replica must be at least 1"));
        }
        if self.cluster.wait_timeout_secs == 0
            || self.gpu_operator.capacity_timeout_secs == 0
            || self.serving.ready_timeout_secs == 0
        {
            return Err(invalid("timeouts must be non-zero"));
        }
        if self.benchmark.tool.trim().is_empty() {
            return Err(invalid("benchmark.tool must not be empty"));
        }
        Ok(())
    }

    /// Resolved working directory.
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .map_or_else(std::env::temp_dir, |home| home.join(".gpubench"))
                .join(&self.cluster.name)
        })
    }

    /// Resolved directory for downloaded binaries.
    #[must_use]
    pub fn bin_dir(&self) -> PathBuf {
        self.tools.bin_dir.clone().unwrap_or_else(|| {
            dirs::home_dir().map_or_else(
                || self.work_dir().join("bin"),
                |home| home.join(".local").join("bin"),
            )
        })
    }

    /// Get the kubeconfig path exported for this cluster.
    #[must_use]
    pub fn kubeconfig_path(&self) -> PathBuf {
        self.work_dir().join("kubeconfig")
    }

    /// Get the state file path.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.work_dir().join("up-state.json")
    }

    /// Get the kind config path.
    #[must_use]
    pub fn kind_config_path(&self) -> PathBuf {
        self.work_dir().join("kind-config.yaml")
    }

    /// Get the benchmark results path.
    #[must_use]
    pub fn results_path(&self) -> PathBuf {
        self.work_dir().join("benchmarks.json")
    }

    /// kubectl context name kind registers for the cluster.
    #[must_use]
    pub fn kube_context(&self) -> String {
        format!("kind-{}", self.cluster.name)
    }

    /// Base URL of the forwarded serving endpoint.
    #[must_use]
    pub fn serving_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.serving.local_port)
    }

    /// Total GPUs the serving deployment requests.
    #[must_use]
    pub fn required_gpus(&self) -> u64 {
        u64::from(self.serving.replicas) * u64::from(self.serving.gpus_per_replica)
    }

    #[must_use]
    pub fn cluster_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.wait_timeout_secs)
    }

    #[must_use]
    pub fn capacity_timeout(&self) -> Duration {
        Duration::from_secs(self.gpu_operator.capacity_timeout_secs)
    }

    #[must_use]
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.serving.ready_timeout_secs)
    }
}

/// Derive a resource-name-safe alias from a model id.
///
/// `facebook/opt-125m` becomes `opt125m`.
#[must_use]
pub fn model_alias(model: &str) -> String {
    let base = model.rsplit('/').next().unwrap_or(model);
    let alias: String = base
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if alias.is_empty() {
        "model".into()
    } else {
        alias
    }
}

fn invalid(message: &str) -> Error {
    Error::Config(message.to_string())
}
