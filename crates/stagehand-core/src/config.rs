use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_steps")]
    pub steps: u32,
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_factor() -> f64 {
    2.0
}

fn default_steps() -> u32 {
    5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            factor: default_factor(),
            steps: default_steps(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = self.initial_backoff_ms as f64 * self.factor.powi(attempt as i32);
        Duration::from_millis(ms.min(u64::MAX as f64) as u64)
    }
}

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Missed cron/timeline runs tolerated before giving up on a schedule.
    #[serde(default = "default_max_missed_starts")]
    pub max_missed_starts: usize,
}

fn default_max_missed_starts() -> usize {
    100
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_missed_starts: default_max_missed_starts(),
        }
    }
}

// ---------------------------------------------------------------------------
// ReconcileConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Delay before retrying a pass that lost an optimistic-concurrency race.
    #[serde(default = "default_conflict_requeue_ms")]
    pub conflict_requeue_ms: u64,
    /// Poll interval for event-gated schedules, which have no next tick.
    #[serde(default = "default_idle_requeue_secs")]
    pub idle_requeue_secs: u64,
    /// Keys reconciled in parallel. A single key never runs twice at once.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_conflict_requeue_ms() -> u64 {
    1000
}

fn default_idle_requeue_secs() -> u64 {
    30
}

fn default_workers() -> usize {
    2
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            conflict_requeue_ms: default_conflict_requeue_ms(),
            idle_requeue_secs: default_idle_requeue_secs(),
            workers: default_workers(),
        }
    }
}

impl ReconcileConfig {
    pub fn conflict_requeue(&self) -> Duration {
        Duration::from_millis(self.conflict_requeue_ms)
    }

    pub fn idle_requeue(&self) -> Duration {
        Duration::from_secs(self.idle_requeue_secs)
    }
}

// ---------------------------------------------------------------------------
// VirtualExecConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Callbacks run on their own tokio task.
    #[default]
    Spawned,
    /// Callbacks run to completion before `run_virtual` returns.
    Inline,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualExecConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub retry: RetryPolicy,
}

// ---------------------------------------------------------------------------
// ExecConfig
// ---------------------------------------------------------------------------

/// Remote command execution for `call` actions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Program invoked as `<program> <namespace> <service> <callable>`.
    #[serde(default)]
    pub program: Option<String>,
}

// ---------------------------------------------------------------------------
// TelemetryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub grafana_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_telemetry_retry")]
    pub retry: RetryPolicy,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_telemetry_retry() -> RetryPolicy {
    RetryPolicy {
        steps: 3,
        ..RetryPolicy::default()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            grafana_url: None,
            api_key: None,
            timeout_secs: default_timeout_secs(),
            retry: default_telemetry_retry(),
        }
    }
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:6666".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

// ---------------------------------------------------------------------------
// OrchestratorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub virtual_exec: VirtualExecConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            scheduler: SchedulerConfig::default(),
            reconcile: ReconcileConfig::default(),
            virtual_exec: VirtualExecConfig::default(),
            exec: ExecConfig::default(),
            telemetry: TelemetryConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from a YAML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(data)?)
    }
}
