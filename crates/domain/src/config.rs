//! Configuration for the taskmesh control plane.
//!
//! Loaded from a TOML file with serde defaults per section, then
//! overridden by environment variables for the deploy-critical knobs.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Root config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub executors: ExecutorEndpoints,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub docker: DockerConfig,
}

impl Config {
    /// Load from a TOML file and apply environment overrides. A missing
    /// file yields the defaults (still env-overridable), matching how a
    /// containerised deployment configures everything through env.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        env_override_string("TM_REDIS_URL", &mut self.redis.url);
        env_override_string("TM_CHAT_SHELL_URL", &mut self.executors.chat_shell_url);
        env_override_string("TM_DATA_SERVICE_URL", &mut self.executors.data_service_url);
        env_override_string(
            "TM_EXECUTOR_MANAGER_URL",
            &mut self.executors.executor_manager_url,
        );
        env_override_string("TM_CALLBACK_URL", &mut self.executors.callback_url);
        env_override_string("TM_TASK_API_DOMAIN", &mut self.executors.task_api_domain);
        env_override_string("TM_JWT_SECRET", &mut self.auth.jwt_secret);
        env_override_string("TM_INTERNAL_TOKEN", &mut self.auth.internal_token);
        env_override_string("EXECUTOR_IMAGE", &mut self.docker.executor_image);
        env_override_parse("MAX_CONCURRENT_TASKS", &mut self.queue.max_concurrent_tasks);
        env_override_parse(
            "MAX_OFFLINE_CONCURRENT_TASKS",
            &mut self.queue.max_offline_concurrent_tasks,
        );
        env_override_parse("TASK_QUEUE_MAX_RETRIES", &mut self.queue.max_retries);
        env_override_parse("TASK_HEARTBEAT_TIMEOUT", &mut self.heartbeat.timeout_secs);
        env_override_parse(
            "HEARTBEAT_GRACE_PERIOD",
            &mut self.heartbeat.grace_period_secs,
        );
        if let Ok(v) = std::env::var("DELETE_ZOMBIE_CONTAINERS") {
            self.heartbeat.delete_zombie_containers =
                matches!(v.to_lowercase().as_str(), "true" | "1" | "yes");
        }
    }

    /// Validate the configuration, returning warnings and errors.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.auth.jwt_secret.is_empty() {
            issues.push(ConfigIssue::error(
                "auth.jwt_secret is empty; token minting will fail",
            ));
        }
        if self.auth.internal_token.is_empty() {
            issues.push(ConfigIssue::warning(
                "auth.internal_token is empty; internal endpoints are unauthenticated",
            ));
        }
        if self.docker.executor_image.is_empty() {
            issues.push(ConfigIssue::warning(
                "docker.executor_image is empty; container dispatch will be rejected",
            ));
        }
        if self.docker.port_range_start >= self.docker.port_range_end {
            issues.push(ConfigIssue::error(
                "docker.port_range_start must be below docker.port_range_end",
            ));
        }
        if self.queue.max_concurrent_tasks == 0 {
            issues.push(ConfigIssue::error(
                "queue.max_concurrent_tasks must be at least 1",
            ));
        }
        if parse_hour_range(&self.queue.offline_evening_hours).is_none() {
            issues.push(ConfigIssue::error(
                "queue.offline_evening_hours must look like \"21-23\"",
            ));
        }
        if parse_hour_range(&self.queue.offline_morning_hours).is_none() {
            issues.push(ConfigIssue::error(
                "queue.offline_morning_hours must look like \"0-8\"",
            ));
        }

        issues
    }
}

fn env_override_string(key: &str, slot: &mut String) {
    if let Ok(v) = std::env::var(key) {
        if !v.is_empty() {
            *slot = v;
        }
    }
}

fn env_override_parse<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse() {
            *slot = parsed;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl ConfigIssue {
    fn warning(message: &str) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            message: message.into(),
        }
    }

    fn error(message: &str) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "d_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: d_redis_url() }
    }
}

/// Addresses of the execution services and of ourselves (callback URL
/// handed to workers, task API domain handed to the executor manager).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorEndpoints {
    #[serde(default = "d_chat_shell_url")]
    pub chat_shell_url: String,
    /// Typed data service holding the Task/Bot/Ghost/Shell/Model store.
    #[serde(default = "d_data_service_url")]
    pub data_service_url: String,
    #[serde(default = "d_manager_url")]
    pub executor_manager_url: String,
    #[serde(default = "d_callback_url")]
    pub callback_url: String,
    #[serde(default = "d_callback_url")]
    pub task_api_domain: String,
    /// Dispatch request timeout (SSE streams run long).
    #[serde(default = "d_300")]
    pub dispatch_timeout_secs: u64,
    #[serde(default = "d_30")]
    pub callback_timeout_secs: u64,
    /// Whether the executor-manager router runs inside this process.
    #[serde(default)]
    pub embedded_manager: bool,
}

impl Default for ExecutorEndpoints {
    fn default() -> Self {
        Self {
            chat_shell_url: d_chat_shell_url(),
            data_service_url: d_data_service_url(),
            executor_manager_url: d_manager_url(),
            callback_url: d_callback_url(),
            task_api_domain: d_callback_url(),
            dispatch_timeout_secs: d_300(),
            callback_timeout_secs: d_30(),
            embedded_manager: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret for user auth tokens and task tokens.
    #[serde(default)]
    pub jwt_secret: String,
    /// Pre-shared bearer token for `/internal/*` and the manager API.
    #[serde(default)]
    pub internal_token: String,
    #[serde(default = "d_24")]
    pub user_token_ttl_hours: u64,
    /// Base64 32-byte key for stored-credential decryption.
    #[serde(default)]
    pub credential_key: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            internal_token: String::new(),
            user_token_ttl_hours: d_24(),
            credential_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Tail of the per-task history kept in Redis (token safety).
    #[serde(default = "d_100")]
    pub history_max_messages: usize,
    #[serde(default = "d_86400")]
    pub history_ttl_secs: u64,
    /// Streaming replay cache; short, rewritten constantly mid-stream.
    #[serde(default = "d_600")]
    pub streaming_ttl_secs: u64,
    #[serde(default = "d_300")]
    pub cancel_ttl_secs: u64,
    #[serde(default = "d_3600")]
    pub task_streaming_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            history_max_messages: d_100(),
            history_ttl_secs: d_86400(),
            streaming_ttl_secs: d_600(),
            cancel_ttl_secs: d_300(),
            task_streaming_ttl_secs: d_3600(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Queue with backpressure; consumers drain Redis lists.
    Push,
    /// Scheduler polls the task API for pending work.
    Pull,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "d_dispatch_mode")]
    pub dispatch_mode: DispatchMode,
    #[serde(default = "d_pool")]
    pub service_pool: String,
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "d_10u")]
    pub max_offline_concurrent_tasks: usize,
    #[serde(default = "d_3")]
    pub max_retries: u32,
    #[serde(default = "d_1000")]
    pub backpressure_wait_ms: u64,
    #[serde(default = "d_5")]
    pub dequeue_timeout_secs: u64,
    #[serde(default = "d_1000")]
    pub capacity_cache_ttl_ms: u64,
    /// Hour windows (inclusive) during which offline tasks run.
    #[serde(default = "d_evening")]
    pub offline_evening_hours: String,
    #[serde(default = "d_morning")]
    pub offline_morning_hours: String,
    #[serde(default = "d_30")]
    pub task_fetch_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dispatch_mode: d_dispatch_mode(),
            service_pool: d_pool(),
            max_concurrent_tasks: d_max_concurrent(),
            max_offline_concurrent_tasks: d_10u(),
            max_retries: d_3(),
            backpressure_wait_ms: d_1000(),
            dequeue_timeout_secs: d_5(),
            capacity_cache_ttl_ms: d_1000(),
            offline_evening_hours: d_evening(),
            offline_morning_hours: d_morning(),
            task_fetch_interval_secs: d_30(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// No heartbeat for this long ⇒ the worker is dead.
    #[serde(default = "d_60")]
    pub timeout_secs: u64,
    /// Containers get this long to boot before heartbeats are expected.
    #[serde(default = "d_30")]
    pub grace_period_secs: u64,
    #[serde(default = "d_30")]
    pub check_interval_secs: u64,
    /// TTL on the heartbeat key itself; slightly above the send interval.
    #[serde(default = "d_20")]
    pub ttl_secs: u64,
    /// Dead containers are preserved by default for OOM debugging.
    #[serde(default)]
    pub delete_zombie_containers: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            timeout_secs: d_60(),
            grace_period_secs: d_30(),
            check_interval_secs: d_30(),
            ttl_secs: d_20(),
            delete_zombie_containers: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub executor_image: String,
    #[serde(default = "d_port_start")]
    pub port_range_start: u16,
    #[serde(default = "d_port_end")]
    pub port_range_end: u16,
    /// Docker network; empty means bridge with `-p` mapping.
    #[serde(default)]
    pub network: String,
    /// Host workspace directory mounted into workers; empty disables.
    #[serde(default)]
    pub workspace: String,
    #[serde(default = "d_socket")]
    pub socket_path: String,
    /// Named volume holding the executor binary for custom-image mode.
    #[serde(default = "d_binary_volume")]
    pub binary_volume: String,
    /// Label value identifying containers this manager owns.
    #[serde(default = "d_owner")]
    pub owner: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            executor_image: String::new(),
            port_range_start: d_port_start(),
            port_range_end: d_port_end(),
            network: String::new(),
            workspace: String::new(),
            socket_path: d_socket(),
            binary_volume: d_binary_volume(),
            owner: d_owner(),
        }
    }
}

/// Parse an inclusive hour range like `"21-23"`.
pub fn parse_hour_range(raw: &str) -> Option<(u32, u32)> {
    let (start, end) = raw.split_once('-')?;
    let start: u32 = start.trim().parse().ok()?;
    let end: u32 = end.trim().parse().ok()?;
    if start > 23 || end > 23 || start > end {
        return None;
    }
    Some((start, end))
}

// ── serde default helpers ───────────────────────────────────────────

fn d_port() -> u16 {
    8200
}
fn d_host() -> String {
    "0.0.0.0".into()
}
fn d_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}
fn d_chat_shell_url() -> String {
    "http://127.0.0.1:8100".into()
}
fn d_data_service_url() -> String {
    "http://127.0.0.1:8300".into()
}
fn d_manager_url() -> String {
    "http://127.0.0.1:8001/executor-manager".into()
}
fn d_callback_url() -> String {
    "http://127.0.0.1:8200".into()
}
fn d_dispatch_mode() -> DispatchMode {
    DispatchMode::Push
}
fn d_pool() -> String {
    "default".into()
}
fn d_max_concurrent() -> usize {
    30
}
fn d_evening() -> String {
    "21-23".into()
}
fn d_morning() -> String {
    "0-8".into()
}
fn d_socket() -> String {
    "/var/run/docker.sock".into()
}
fn d_binary_volume() -> String {
    "executor-bin".into()
}
fn d_owner() -> String {
    "taskmesh-manager".into()
}
fn d_port_start() -> u16 {
    20000
}
fn d_port_end() -> u16 {
    21000
}
fn d_3() -> u32 {
    3
}
fn d_5() -> u64 {
    5
}
fn d_10u() -> usize {
    10
}
fn d_20() -> u64 {
    20
}
fn d_24() -> u64 {
    24
}
fn d_30() -> u64 {
    30
}
fn d_60() -> u64 {
    60
}
fn d_100() -> usize {
    100
}
fn d_300() -> u64 {
    300
}
fn d_600() -> u64 {
    600
}
fn d_1000() -> u64 {
    1000
}
fn d_3600() -> u64 {
    3600
}
fn d_86400() -> u64 {
    86400
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
