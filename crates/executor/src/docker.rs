//! Docker container executor.
//!
//! One short-lived container per task. Submission either reuses an
//! existing container (`executor_name` set on the request: POST the task
//! to its HTTP port) or creates a new one: deterministic name, free host
//! port from the configured range, task payload and addresses injected
//! through the environment, ownership labels for later lookup.
//!
//! A custom `base_image` on the leading bot switches to init-container
//! mode: the bot's image runs with the executor binary mounted read-only
//! from a named volume and the entrypoint overridden.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::models::{ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use futures_util::TryStreamExt;

use tm_domain::config::{DockerConfig, ExecutorEndpoints};
use tm_domain::{Error, ExecutionRequest, Result};

const TASK_TYPE_LABEL: &str = "aigc.weibo.com/task-type";
const TEAM_MODE_LABEL: &str = "aigc.weibo.com/team-mode";
const CONTAINER_TZ: &str = "Asia/Shanghai";
const CONTAINER_LOCALE: &str = "en_US.UTF-8";

/// Outcome of a successful submission.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub executor_name: String,
    pub reused: bool,
}

pub struct DockerExecutor {
    docker: Docker,
    http: reqwest::Client,
    config: DockerConfig,
    endpoints: ExecutorEndpoints,
}

impl DockerExecutor {
    pub fn connect(config: DockerConfig, endpoints: ExecutorEndpoints) -> Result<Self> {
        let docker = if config.socket_path == "/var/run/docker.sock" {
            Docker::connect_with_local_defaults()
        } else {
            Docker::connect_with_socket(&config.socket_path, 120, bollard::API_DEFAULT_VERSION)
        }
        .map_err(|e| Error::Docker(format!("connect: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            docker,
            http,
            config,
            endpoints,
        })
    }

    // ── Submission ──────────────────────────────────────────────────

    pub async fn submit(&self, request: &ExecutionRequest) -> Result<SubmitOutcome> {
        if let Some(existing) = request.executor_name.as_deref().filter(|n| !n.is_empty()) {
            self.submit_to_existing(existing, request).await?;
            return Ok(SubmitOutcome {
                executor_name: existing.to_owned(),
                reused: true,
            });
        }

        let user_name = request
            .user
            .as_ref()
            .map(|u| u.name.as_str())
            .unwrap_or("unknown");
        let executor_name = generate_executor_name(request.task_id, request.subtask_id, user_name);
        self.create_container(&executor_name, request).await?;
        Ok(SubmitOutcome {
            executor_name,
            reused: false,
        })
    }

    /// Reuse path: the container is already up and serves a task API.
    async fn submit_to_existing(&self, executor_name: &str, request: &ExecutionRequest) -> Result<()> {
        let port = self
            .container_host_port(executor_name)
            .await?
            .ok_or_else(|| {
                Error::Docker(format!("executor {executor_name} not found or has no ports"))
            })?;

        let url = format!("http://127.0.0.1:{port}/api/tasks/execute");
        tracing::info!(executor_name, %url, "sending task to existing container");
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::http_status(
                response.status().as_u16(),
                &response.text().await.unwrap_or_default(),
            ));
        }
        Ok(())
    }

    async fn create_container(&self, executor_name: &str, request: &ExecutionRequest) -> Result<()> {
        if self.config.executor_image.is_empty() {
            return Err(Error::Config("docker.executor_image is not set".into()));
        }

        let base_image = request.bot.first().and_then(|b| b.base_image.clone());
        let port = self.allocate_port().await?;

        let env = build_env(request, executor_name, port, &self.endpoints);
        let labels = build_labels(request, &self.config.owner);

        let mut binds = vec![format!(
            "{sock}:{sock}",
            sock = self.config.socket_path
        )];
        if !self.config.workspace.is_empty() {
            binds.push(format!("{}:/workspace", self.config.workspace));
        }

        let mut entrypoint = None;
        let image = match &base_image {
            Some(custom) => {
                // Init-container mode: the custom image runs with our
                // executor binary mounted from the named volume.
                binds.push(format!("{}:/app:ro", self.config.binary_volume));
                entrypoint = Some(vec!["/app/executor".to_string()]);
                tracing::info!(
                    executor_name,
                    base_image = %custom,
                    volume = %self.config.binary_volume,
                    "using custom base image mode"
                );
                custom.clone()
            }
            None => self.config.executor_image.clone(),
        };

        let mut host_config = HostConfig {
            binds: Some(binds),
            ..Default::default()
        };
        let mut exposed_ports = None;
        if self.config.network.is_empty() {
            // Bridge mode: publish the allocated port host:host.
            let port_key = format!("{port}/tcp");
            let binding = PortBinding {
                host_ip: None,
                host_port: Some(port.to_string()),
            };
            host_config.port_bindings = Some(HashMap::from([(
                port_key.clone(),
                Some(vec![binding]),
            )]));
            exposed_ports = Some(HashMap::from([(port_key, HashMap::new())]));
        } else {
            host_config.network_mode = Some(self.config.network.clone());
        }

        let container_config = Config {
            image: Some(image.clone()),
            env: Some(env),
            labels: Some(labels),
            entrypoint,
            exposed_ports,
            host_config: Some(host_config),
            ..Default::default()
        };

        tracing::info!(
            task_id = request.task_id,
            executor_name,
            %image,
            port,
            "starting executor container"
        );

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: executor_name,
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| Error::Docker(format!("create {executor_name}: {e}")))?;

        if let Err(e) = self
            .docker
            .start_container(executor_name, None::<StartContainerOptions<String>>)
            .await
        {
            // Never leave a created-but-unstartable container behind.
            let _ = self.force_remove(executor_name).await;
            return Err(Error::Docker(format!("start {executor_name}: {e}")));
        }

        if base_image.is_some() {
            self.probe_startup(executor_name).await?;
        }

        Ok(())
    }

    /// Custom base images fail in characteristic ways (musl vs glibc,
    /// missing entrypoint). Give the container 2 s, then inspect; an
    /// immediate exit is turned into a readable error.
    async fn probe_startup(&self, executor_name: &str) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(2)).await;

        let inspect = match self.docker.inspect_container(executor_name, None).await {
            Ok(i) => i,
            Err(e) => {
                tracing::warn!(executor_name, error = %e, "failed to inspect container after start");
                return Ok(());
            }
        };

        let state = inspect.state.unwrap_or_default();
        if !matches!(state.status, Some(ContainerStateStatusEnum::EXITED)) {
            return Ok(());
        }

        let exit_code = state.exit_code.unwrap_or(-1);
        let logs = self.tail_logs(executor_name, 50).await.unwrap_or_default();
        let reason = analyze_container_failure(&logs, exit_code);
        tracing::error!(executor_name, exit_code, %reason, "container exited immediately");

        let _ = self.force_remove(executor_name).await;
        Err(Error::Docker(format!("container exited immediately: {reason}")))
    }

    async fn tail_logs(&self, executor_name: &str, tail: usize) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let chunks: Vec<_> = self
            .docker
            .logs(executor_name, Some(options))
            .try_collect()
            .await
            .map_err(|e| Error::Docker(format!("logs {executor_name}: {e}")))?;
        Ok(chunks
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(""))
    }

    // ── Ports ───────────────────────────────────────────────────────

    async fn allocate_port(&self) -> Result<u16> {
        let used = self.used_host_ports().await?;
        pick_free_port(
            self.config.port_range_start,
            self.config.port_range_end,
            &used,
        )
        .ok_or_else(|| {
            Error::Docker(format!(
                "no free port in {}-{}",
                self.config.port_range_start, self.config.port_range_end
            ))
        })
    }

    async fn used_host_ports(&self) -> Result<HashSet<u16>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::Docker(format!("list containers: {e}")))?;

        let mut used = HashSet::new();
        for container in containers {
            for port in container.ports.unwrap_or_default() {
                if let Some(public) = port.public_port {
                    used.insert(public);
                }
            }
        }
        Ok(used)
    }

    async fn container_host_port(&self, executor_name: &str) -> Result<Option<u16>> {
        let inspect = match self.docker.inspect_container(executor_name, None).await {
            Ok(i) => i,
            Err(_) => return Ok(None),
        };

        let ports = inspect
            .network_settings
            .and_then(|ns| ns.ports)
            .unwrap_or_default();
        for bindings in ports.into_values().flatten() {
            for binding in bindings {
                if let Some(port) = binding.host_port.and_then(|p| p.parse().ok()) {
                    return Ok(Some(port));
                }
            }
        }

        // Host networking: the PORT env var is the only record.
        let env = inspect.config.and_then(|c| c.env).unwrap_or_default();
        for entry in env {
            if let Some(port) = entry.strip_prefix("PORT=") {
                return Ok(port.parse().ok());
            }
        }
        Ok(None)
    }

    // ── Enumeration / cancel / delete ───────────────────────────────

    async fn list_owned(
        &self,
        extra_label: Option<&str>,
    ) -> Result<Vec<bollard::models::ContainerSummary>> {
        let mut label_filters = vec![format!("owner={}", self.config.owner)];
        if let Some(extra) = extra_label {
            label_filters.push(extra.to_owned());
        }
        let filters = HashMap::from([("label".to_string(), label_filters)]);
        self.docker
            .list_containers(Some(ListContainersOptions {
                all: false,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::Docker(format!("list containers: {e}")))
    }

    /// Count of running owned containers, optionally narrowed by a
    /// `key=value` label selector.
    pub async fn running_count(&self, label_selector: Option<&str>) -> Result<usize> {
        Ok(self.list_owned(label_selector).await?.len())
    }

    /// task_id labels of all running owned containers.
    pub async fn current_task_ids(&self) -> Result<Vec<i64>> {
        let containers = self.list_owned(None).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| c.labels?.get("task_id")?.parse().ok())
            .collect())
    }

    /// Cancel a running task by asking its container's cancel API.
    pub async fn cancel_task(&self, task_id: i64) -> Result<()> {
        let containers = self
            .list_owned(Some(&format!("task_id={task_id}")))
            .await?;
        let container = containers
            .first()
            .ok_or_else(|| Error::NotFound(format!("no running container for task {task_id}")))?;
        let name = container
            .names
            .as_ref()
            .and_then(|n| n.first())
            .map(|n| n.trim_start_matches('/').to_owned())
            .ok_or_else(|| Error::Docker("container has no name".into()))?;

        let port = self
            .container_host_port(&name)
            .await?
            .ok_or_else(|| Error::Docker(format!("no port for container {name}")))?;

        let url = format!("http://127.0.0.1:{port}/api/tasks/cancel?task_id={task_id}");
        tracing::info!(task_id, %url, "requesting task cancellation");
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::http_status(response.status().as_u16(), "cancel rejected"));
        }
        Ok(())
    }

    /// Remove a container, refusing anything this manager does not own.
    pub async fn delete_executor(&self, executor_name: &str) -> Result<()> {
        let inspect = self
            .docker
            .inspect_container(executor_name, None)
            .await
            .map_err(|e| Error::NotFound(format!("container {executor_name}: {e}")))?;

        let owner = inspect
            .config
            .and_then(|c| c.labels)
            .and_then(|l| l.get("owner").cloned())
            .unwrap_or_default();
        if owner != self.config.owner {
            return Err(Error::Permission(format!(
                "container {executor_name} is not owned by {}",
                self.config.owner
            )));
        }

        self.force_remove(executor_name).await
    }

    async fn force_remove(&self, executor_name: &str) -> Result<()> {
        self.docker
            .remove_container(
                executor_name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Error::Docker(format!("remove {executor_name}: {e}")))?;
        tracing::info!(executor_name, "container removed");
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pure helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deterministic container name: `task-{user}-{task_id}-{subtask_id}`.
/// The user segment is sanitised to docker-safe characters.
pub fn generate_executor_name(task_id: i64, subtask_id: i64, user_name: &str) -> String {
    let user: String = user_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let user = user.trim_matches('-');
    let user = if user.is_empty() { "unknown" } else { user };
    format!("task-{user}-{task_id}-{subtask_id}")
}

/// First free port in `[start, end)` not present in `used`.
pub fn pick_free_port(start: u16, end: u16, used: &HashSet<u16>) -> Option<u16> {
    (start..end).find(|p| !used.contains(p))
}

pub(crate) fn build_env(
    request: &ExecutionRequest,
    executor_name: &str,
    port: u16,
    endpoints: &ExecutorEndpoints,
) -> Vec<String> {
    let task_info = serde_json::to_string(request).unwrap_or_else(|_| "{}".into());
    let mut env = vec![
        format!("TASK_INFO={task_info}"),
        format!("EXECUTOR_NAME={executor_name}"),
        format!("PORT={port}"),
        format!("TZ={CONTAINER_TZ}"),
        format!("LANG={CONTAINER_LOCALE}"),
        format!("CALLBACK_URL={}/internal/callback", endpoints.callback_url),
        format!("TASK_API_DOMAIN={}", endpoints.task_api_domain),
    ];

    // Trace context rides into the container so worker spans continue
    // the dispatch trace.
    if let Some(trace) = request.trace_context.as_ref().and_then(|v| v.as_object()) {
        for (key, value) in trace {
            if let Some(value) = value.as_str() {
                env.push(format!("{}={}", key.to_uppercase(), value));
            }
        }
    }

    env
}

pub(crate) fn build_labels(request: &ExecutionRequest, owner: &str) -> HashMap<String, String> {
    let user_name = request
        .user
        .as_ref()
        .map(|u| u.name.clone())
        .unwrap_or_else(|| "unknown".into());
    let mut labels = HashMap::from([
        ("owner".to_string(), owner.to_owned()),
        ("task_id".to_string(), request.task_id.to_string()),
        ("subtask_id".to_string(), request.subtask_id.to_string()),
        ("user".to_string(), user_name),
        (
            TASK_TYPE_LABEL.to_string(),
            request.task_type().to_string(),
        ),
        (
            TEAM_MODE_LABEL.to_string(),
            request
                .team_mode
                .clone()
                .unwrap_or_else(|| "default".into()),
        ),
    ]);
    if let Some(next) = request.subtask_next_id {
        labels.insert("subtask_next_id".to_string(), next.to_string());
    }
    labels
}

/// Turn container logs + exit code into an operator-readable cause.
pub fn analyze_container_failure(logs: &str, exit_code: i64) -> String {
    let lower = logs.to_lowercase();

    if lower.contains("no such file or directory") && lower.contains("exec") {
        return "Binary incompatibility: the executor binary cannot run in this image. \
                This usually happens when the base image uses a different C library \
                (e.g. Alpine uses musl while the executor was built against glibc). \
                Use a glibc-based image like Ubuntu, Debian, or AlmaLinux."
            .into();
    }
    if lower.contains("not found") && (lower.contains("libc") || lower.contains("ld-linux")) {
        return "Missing C library: the base image lacks required system libraries. \
                Use a glibc-based image."
            .into();
    }
    if lower.contains("permission denied") {
        return "Permission denied: the executor binary is not executable or the \
                container user lacks the required permissions."
            .into();
    }
    if exit_code == 127 {
        return "Command not found: the entrypoint or command does not exist in the container.".into();
    }
    if exit_code == 126 {
        return "Not executable: the entrypoint exists but cannot be executed.".into();
    }

    let excerpt: String = logs.chars().take(500).collect();
    format!("Container exited with code {exit_code}. Logs: {excerpt}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use tm_domain::request::{BotSpec, UserRef};

    fn sample_request() -> ExecutionRequest {
        let mut request = ExecutionRequest::new(42, 7);
        request.user = Some(UserRef {
            id: 1,
            name: "Alice Müller".into(),
            ..Default::default()
        });
        request.bot = vec![BotSpec {
            shell_type: Some("ClaudeCode".into()),
            ..Default::default()
        }];
        request
    }

    #[test]
    fn executor_name_is_sanitised() {
        assert_eq!(
            generate_executor_name(42, 7, "Alice Müller"),
            "task-alice-m-ller-42-7"
        );
        assert_eq!(generate_executor_name(1, 2, "---"), "task-unknown-1-2");
        assert_eq!(generate_executor_name(1, 2, "bob"), "task-bob-1-2");
    }

    #[test]
    fn port_picker_skips_used() {
        let used = HashSet::from([20000, 20001, 20003]);
        assert_eq!(pick_free_port(20000, 20010, &used), Some(20002));
        assert_eq!(pick_free_port(20000, 20001, &used), None);
        assert_eq!(pick_free_port(20000, 20000, &HashSet::new()), None);
    }

    #[test]
    fn env_includes_task_payload_and_addresses() {
        let mut request = sample_request();
        request.trace_context = Some(serde_json::json!({"traceparent": "00-aa-bb-01"}));
        let endpoints = ExecutorEndpoints {
            callback_url: "http://backend:8200".into(),
            task_api_domain: "http://backend:8200".into(),
            ..Default::default()
        };

        let env = build_env(&request, "task-alice-42-7", 20005, &endpoints);
        assert!(env.iter().any(|e| e.starts_with("TASK_INFO={")));
        assert!(env.contains(&"EXECUTOR_NAME=task-alice-42-7".to_string()));
        assert!(env.contains(&"PORT=20005".to_string()));
        assert!(env.contains(&"CALLBACK_URL=http://backend:8200/internal/callback".to_string()));
        assert!(env.contains(&"TASK_API_DOMAIN=http://backend:8200".to_string()));
        assert!(env.contains(&"TRACEPARENT=00-aa-bb-01".to_string()));
    }

    #[test]
    fn labels_cover_ownership_and_classification() {
        let mut request = sample_request();
        request.task_type = Some("offline".into());
        request.team_mode = Some("pipeline".into());
        request.subtask_next_id = Some(8);

        let labels = build_labels(&request, "taskmesh-manager");
        assert_eq!(labels["owner"], "taskmesh-manager");
        assert_eq!(labels["task_id"], "42");
        assert_eq!(labels["subtask_id"], "7");
        assert_eq!(labels[TASK_TYPE_LABEL], "offline");
        assert_eq!(labels[TEAM_MODE_LABEL], "pipeline");
        assert_eq!(labels["subtask_next_id"], "8");
    }

    #[test]
    fn labels_default_task_type_online() {
        let labels = build_labels(&sample_request(), "o");
        assert_eq!(labels[TASK_TYPE_LABEL], "online");
        assert_eq!(labels[TEAM_MODE_LABEL], "default");
        assert!(!labels.contains_key("subtask_next_id"));
    }

    #[test]
    fn failure_analysis_detects_musl() {
        let reason = analyze_container_failure(
            "exec /app/executor: no such file or directory",
            1,
        );
        assert!(reason.contains("Binary incompatibility"));
    }

    #[test]
    fn failure_analysis_detects_missing_libc() {
        let reason = analyze_container_failure("ld-linux-x86-64.so.2: not found", 1);
        assert!(reason.contains("Missing C library"));
    }

    #[test]
    fn failure_analysis_exit_codes() {
        assert!(analyze_container_failure("", 127).contains("Command not found"));
        assert!(analyze_container_failure("", 126).contains("Not executable"));
    }

    #[test]
    fn failure_analysis_permission() {
        let reason = analyze_container_failure("sh: permission denied", 1);
        assert!(reason.contains("Permission denied"));
    }

    #[test]
    fn failure_analysis_default_excerpt() {
        let logs = "x".repeat(600);
        let reason = analyze_container_failure(&logs, 9);
        assert!(reason.contains("code 9"));
        assert!(reason.len() < 600);
    }
}
