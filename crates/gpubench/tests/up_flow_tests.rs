//! End-to-end `up` runs against scripted tools, a fake API server and a fake
//! serving endpoint.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gpubench::exec::scripted::ScriptedRunner;
use gpubench::exec::{Cmd, CmdOutput, CommandRunner};
use gpubench::retry::RetryConfig;
use gpubench::state::{UpState, UpStep};
use gpubench::{BenchConfig, Orchestrator, UpOptions};
use serde_json::json;
use serial_test::serial;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MODEL: &str = "facebook/opt-125m";

/// Scripted tools, except that spawning the port-forward brings up a fake
/// OpenAI-compatible endpoint on the local port.
struct ForwardingRunner {
    inner: ScriptedRunner,
    port: u16,
}

impl CommandRunner for ForwardingRunner {
    fn run(&self, cmd: &Cmd) -> gpubench::Result<CmdOutput> {
        self.inner.run(cmd)
    }

    fn spawn_detached(&self, cmd: &Cmd, log: &Path) -> gpubench::Result<u32> {
        if cmd.display().contains("port-forward") {
            let listener = TcpListener::bind(("127.0.0.1", self.port))?;
            tokio::spawn(async move {
                let server = MockServer::builder().listener(listener).start().await;
                Mock::given(method("GET"))
                    .and(path("/v1/models"))
                    .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                        "object": "list",
                        "data": [{ "id": MODEL, "object": "model" }],
                    })))
                    .mount(&server)
                    .await;
                std::future::pending::<()>().await;
            });
        }
        self.inner.spawn_detached(cmd, log)
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        self.inner.which(program)
    }
}

fn free_port() -> u16 {
    TcpListener::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn config(dir: &TempDir) -> BenchConfig {
    let mut config = BenchConfig::default();
    config.work_dir = Some(dir.path().join("work"));
    config.serving.model = MODEL.to_string();
    config.serving.local_port = free_port();
    config
}

fn options(dir: &TempDir) -> UpOptions {
    UpOptions {
        skip_checks: true,
        skip_deps: true,
        runtime_config: Some(dir.path().join("nvidia-config.toml")),
        ..UpOptions::default()
    }
}

fn host_runner() -> ScriptedRunner {
    ScriptedRunner::new()
        .on("sysctl -n", CmdOutput::ok("1048576\n"))
        .on("DefaultRuntime", CmdOutput::ok("nvidia\n"))
        .on("get clusters", CmdOutput::ok(""))
}

fn no_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 0,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
        backoff_multiplier: 1.0,
    }
}

async fn fake_api_server(gpus: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/nodes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "apiVersion": "v1",
            "kind": "NodeList",
            "metadata": { "resourceVersion": "1" },
            "items": [
                {
                    "metadata": { "name": "gpubench-control-plane" },
                    "status": { "allocatable": { "cpu": "8" } }
                },
                {
                    "metadata": { "name": "gpubench-worker" },
                    "status": { "allocatable": { "cpu": "8", "nvidia.com/gpu": gpus } }
                }
            ]
        })))
        .mount(&server)
        .await;
    server
}

fn write_kubeconfig(path: &Path, server: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(
        path,
        format!(
            "apiVersion: v1
kind: Config
clusters:
- name: kind-gpubench
  cluster:
    server: {server}
contexts:
- name: kind-gpubench
  context:
    cluster: kind-gpubench
    user: kind-gpubench
current-context: kind-gpubench
users:
- name: kind-gpubench
  user: {{}}
"
        ),
    )
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_failed_up_resumes_without_recreating_cluster() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);

    // No kubeconfig on disk yet, so the GPU capacity wait fails hard.
    let first = host_runner();
    let mut up = Orchestrator::new_or_resume(&first, config.clone(), options(&dir))
        .unwrap()
        .with_retry(no_retry());
    let err = up.run_to_completion().await.unwrap_err();
    assert!(format!("{err:#}").contains("kubeconfig"));

    assert!(first.ran("kind create cluster --name gpubench"));
    assert!(first.ran("helm upgrade --install gpu-operator"));
    let saved = UpState::load(&config.state_file()).unwrap().unwrap();
    assert_eq!(saved.step, UpStep::WaitingGpuCapacity);
    assert!(saved.last_error.is_some());
    assert_eq!(saved.kubeconfig_path.as_deref(), Some(config.kubeconfig_path().as_path()));

    let api = fake_api_server("2").await;
    write_kubeconfig(&config.kubeconfig_path(), &api.uri());

    let second = ForwardingRunner {
        inner: host_runner(),
        port: config.serving.local_port,
    };
    let mut up = Orchestrator::new_or_resume(&second, config.clone(), options(&dir))
        .unwrap()
        .with_retry(no_retry());
    assert_eq!(up.state().step, UpStep::WaitingGpuCapacity);
    up.run_to_completion().await.unwrap();

    assert!(!second.inner.ran("kind create cluster"));
    assert!(!second.inner.ran("gpu-operator"));
    assert!(second.inner.ran("helm upgrade --install vllm"));
    let spawned = second.inner.spawned();
    assert!(spawned[0].contains("port-forward"));
    assert!(spawned[1].contains("benchmark"));

    let done = UpState::load(&config.state_file()).unwrap().unwrap();
    assert!(done.is_complete());
    assert_eq!(done.gpu_count, Some(2));
    assert!(done.benchmark_pid.is_some());
    assert!(done.last_error.is_none());
}

#[tokio::test]
#[serial]
async fn test_fresh_discards_saved_progress() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    std::fs::create_dir_all(config.work_dir()).unwrap();
    let mut stale = UpState::new(&config.cluster.name, config.state_file());
    stale.set_step(UpStep::DeployingServing).unwrap();

    let runner = host_runner();
    let resumed = Orchestrator::new_or_resume(&runner, config.clone(), options(&dir)).unwrap();
    assert_eq!(resumed.state().step, UpStep::DeployingServing);

    let fresh = Orchestrator::new_or_resume(
        &runner,
        config,
        UpOptions {
            fresh: true,
            ..options(&dir)
        },
    )
    .unwrap();
    assert_eq!(fresh.state().step, UpStep::NotStarted);
}

#[tokio::test]
#[serial]
async fn test_state_for_other_cluster_is_ignored() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    std::fs::create_dir_all(config.work_dir()).unwrap();
    let mut other = UpState::new("someone-else", config.state_file());
    other.set_step(UpStep::StartingBenchmark).unwrap();

    let runner = host_runner();
    let up = Orchestrator::new_or_resume(&runner, config, options(&dir)).unwrap();
    assert_eq!(up.state().step, UpStep::NotStarted);
    assert_eq!(up.state().cluster_name, "gpubench");
}
