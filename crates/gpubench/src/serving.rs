//! Model-serving platform deployment.
//!
//! Installs the vLLM production-stack chart with a single model and waits
//! until its OpenAI-compatible endpoint lists that model.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::BenchConfig;
use crate::exec::CommandRunner;
use crate::kube::{Helm, HelmRelease, Kubectl};
use crate::retry;
use crate::ui;

/// Secret holding the Hugging Face token.
pub const HF_SECRET_NAME: &str = "hf-token-secret";
pub const HF_SECRET_KEY: &str = "token";

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

pub struct ServingDeployer<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a BenchConfig,
    kubeconfig: &'a Path,
}

impl<'a> ServingDeployer<'a> {
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner, config: &'a BenchConfig, kubeconfig: &'a Path) -> Self {
        Self {
            runner,
            config,
            kubeconfig,
        }
    }

    /// Render chart values; `with_hf_token` references the token secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the values cannot be serialized.
    pub fn render_values(&self, with_hf_token: bool) -> Result<String> {
        let serving = &self.config.serving;

        let mut model_spec = json!({
            "name": serving.model_alias,
            "repository": serving.image,
            "tag": serving.tag,
            "modelURL": serving.model,
            "replicaCount": serving.replicas,
            "requestCPU": 4,
            "requestMemory": "16Gi",
            "requestGPU": serving.gpus_per_replica,
        });
        if let Some(max_len) = serving.max_model_len {
            model_spec["vllmConfig"] = json!({ "maxModelLen": max_len });
        }
        if with_hf_token {
            model_spec["hf_token"] = json!({
                "secretName": HF_SECRET_NAME,
                "secretKey": HF_SECRET_KEY,
            });
        }

        let values = json!({
            "servingEngineSpec": {
                "runtimeClassName": "nvidia",
                "modelSpec": [model_spec],
            },
        });
        Ok(serde_yaml::to_string(&values)?)
    }

    /// Deployment names the chart creates, engine first.
    #[must_use]
    pub fn deployments(&self) -> [String; 2] {
        let serving = &self.config.serving;
        [
            format!(
                "deployment/{}-{}-deployment-vllm",
                serving.release, serving.model_alias
            ),
            format!("deployment/{}-deployment-router", serving.release),
        ]
    }

    fn values_path(&self) -> PathBuf {
        self.config.work_dir().join("serving-values.yaml")
    }

    /// Install or upgrade the serving chart and wait for its rollouts.
    ///
    /// # Errors
    ///
    /// Returns an error if any kubectl/helm step fails or a rollout times out.
    pub async fn deploy(&self) -> Result<()> {
        let serving = &self.config.serving;
        let kubectl = Kubectl::new(self.runner, self.kubeconfig);
        let helm = Helm::new(self.runner, self.kubeconfig);

        kubectl.ensure_namespace(&serving.namespace)?;

        let token = std::env::var(&serving.hf_token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());
        if let Some(token) = &token {
            ui::print_progress("Storing Hugging Face token...");
            kubectl.ensure_secret(&serving.namespace, HF_SECRET_NAME, HF_SECRET_KEY, token.trim())?;
        } else {
            debug!(env = %serving.hf_token_env, "No Hugging Face token set");
        }

        let values_path = self.values_path();
        if let Some(dir) = values_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&values_path, self.render_values(token.is_some())?)
            .with_context(|| format!("Failed to write {}", values_path.display()))?;

        ui::print_progress("Adding serving helm repository...");
        helm.repo_add(&serving.repo_name, &serving.repo_url)?;

        let mut release = HelmRelease::new(&serving.release, &serving.chart, &serving.namespace);
        release.version.clone_from(&serving.version);
        release.values_file = Some(values_path);
        ui::print_progress(&format!("Deploying {}...", serving.model));
        helm.upgrade_install(&release)?;

        for deployment in self.deployments() {
            kubectl
                .wait_for_rollout(&serving.namespace, &deployment, self.config.ready_timeout())
                .await?;
        }
        ui::print_success(&format!("Serving stack deployed for {}", serving.model));
        Ok(())
    }

    /// Uninstall the serving release; missing release is fine.
    ///
    /// # Errors
    ///
    /// Returns an error if helm fails.
    pub fn uninstall(&self) -> Result<bool> {
        let serving = &self.config.serving;
        Helm::new(self.runner, self.kubeconfig).uninstall(&serving.release, &serving.namespace)
    }
}

/// Whether `GET {base_url}/v1/models` lists `model`.
///
/// # Errors
///
/// Returns an error if the endpoint is unreachable or answers garbage.
pub async fn model_listed(client: &reqwest::Client, base_url: &str, model: &str) -> Result<bool> {
    let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
    let response = client
        .get(&url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .with_context(|| format!("Failed to reach {url}"))?;
    if !response.status().is_success() {
        anyhow::bail!("{url} returned HTTP {}", response.status().as_u16());
    }
    let models: ModelList = response
        .json()
        .await
        .context("Failed to parse model list")?;
    Ok(models.data.iter().any(|m| m.id == model))
}

/// Poll the endpoint until it lists `model`.
///
/// # Errors
///
/// Returns a timeout error if the model never shows up.
pub async fn wait_model_ready(base_url: &str, model: &str, timeout: Duration) -> Result<()> {
    wait_model_ready_every(base_url, model, timeout, Duration::from_secs(5)).await
}

async fn wait_model_ready_every(
    base_url: &str,
    model: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let client = &reqwest::Client::new();
    info!(base_url, model, "Waiting for model endpoint");

    retry::poll_until_async("model endpoint", timeout, interval, move || async move {
        match model_listed(client, base_url, model).await {
            Ok(true) => Some(()),
            Ok(false) => {
                debug!(model, "Model not listed yet");
                None
            }
            Err(e) => {
                debug!(error = %format!("{e:#}"), "Model endpoint not ready");
                None
            }
        }
    })
    .await?;

    ui::print_success(&format!("Model {model} is serving at {base_url}"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::exec::scripted::ScriptedRunner;

    fn models_body(ids: &[&str]) -> serde_json::Value {
        json!({
            "object": "list",
            "data": ids.iter().map(|id| json!({ "id": id, "object": "model" })).collect::<Vec<_>>(),
        })
    }

    #[test]
    fn test_render_values() {
        let mut config = BenchConfig::default();
        config.serving.max_model_len = Some(2048);
        let runner = ScriptedRunner::new();
        let deployer = ServingDeployer::new(&runner, &config, Path::new("/tmp/kc"));

        let values: serde_yaml::Value =
            serde_yaml::from_str(&deployer.render_values(true).unwrap()).unwrap();
        let spec = &values["servingEngineSpec"]["modelSpec"][0];
        assert_eq!(spec["name"], "opt125m");
        assert_eq!(spec["modelURL"], "facebook/opt-125m");
        assert_eq!(spec["requestGPU"], 1);
        assert_eq!(spec["vllmConfig"]["maxModelLen"], 2048);
        assert_eq!(spec["hf_token"]["secretName"], HF_SECRET_NAME);

        let values: serde_yaml::Value =
            serde_yaml::from_str(&deployer.render_values(false).unwrap()).unwrap();
        assert!(values["servingEngineSpec"]["modelSpec"][0].get("hf_token").is_none());
    }

    #[test]
    fn test_deployment_names() {
        let config = BenchConfig::default();
        let runner = ScriptedRunner::new();
        let deployer = ServingDeployer::new(&runner, &config, Path::new("/tmp/kc"));
        assert_eq!(
            deployer.deployments(),
            [
                "deployment/vllm-opt125m-deployment-vllm".to_string(),
                "deployment/vllm-deployment-router".to_string(),
            ]
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_deploy_with_token() {
        let dir = TempDir::new().unwrap();
        let mut config = BenchConfig::default();
        config.work_dir = Some(dir.path().to_path_buf());
        config.serving.hf_token_env = "GPUBENCH_TEST_HF_TOKEN".into();
        std::env::set_var("GPUBENCH_TEST_HF_TOKEN", "hf_abc");

        let runner = ScriptedRunner::new();
        let result = ServingDeployer::new(&runner, &config, Path::new("/tmp/kc"))
            .deploy()
            .await;
        std::env::remove_var("GPUBENCH_TEST_HF_TOKEN");
        result.unwrap();

        let secret = runner
            .commands()
            .into_iter()
            .filter_map(|c| c.stdin)
            .map(|b| String::from_utf8(b).unwrap())
            .find(|body| body.contains("kind: Secret"))
            .unwrap();
        assert!(secret.contains("hf_abc"));
        assert!(runner.ran("helm repo add vllm https://vllm-project.github.io/production-stack"));
        assert!(runner.ran("helm upgrade --install vllm vllm/vllm-stack --namespace default"));
        assert!(runner.ran("rollout status deployment/vllm-opt125m-deployment-vllm"));
        assert!(runner.ran("rollout status deployment/vllm-deployment-router"));

        let values = std::fs::read_to_string(dir.path().join("serving-values.yaml")).unwrap();
        assert!(values.contains(HF_SECRET_NAME));
    }

    #[tokio::test]
    #[serial]
    async fn test_deploy_without_token_skips_secret() {
        let dir = TempDir::new().unwrap();
        let mut config = BenchConfig::default();
        config.work_dir = Some(dir.path().to_path_buf());
        config.serving.hf_token_env = "GPUBENCH_TEST_HF_TOKEN_UNSET".into();
        std::env::remove_var("GPUBENCH_TEST_HF_TOKEN_UNSET");

        let runner = ScriptedRunner::new();
        ServingDeployer::new(&runner, &config, Path::new("/tmp/kc"))
            .deploy()
            .await
            .unwrap();

        assert!(!runner
            .commands()
            .into_iter()
            .filter_map(|c| c.stdin)
            .any(|b| String::from_utf8_lossy(&b).contains("kind: Secret")));
    }

    #[tokio::test]
    async fn test_model_listed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(models_body(&["facebook/opt-125m"])))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        assert!(model_listed(&client, &server.uri(), "facebook/opt-125m").await.unwrap());
        assert!(!model_listed(&client, &server.uri(), "gpt2").await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_model_ready_after_warmup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(models_body(&["facebook/opt-125m"])))
            .mount(&server)
            .await;

        wait_model_ready_every(
            &server.uri(),
            "facebook/opt-125m",
            Duration::from_secs(5),
            Duration::from_millis(20),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_wait_model_ready_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(models_body(&[])))
            .mount(&server)
            .await;

        let err = wait_model_ready_every(
            &server.uri(),
            "facebook/opt-125m",
            Duration::from_millis(100),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("model endpoint"));
    }
}
