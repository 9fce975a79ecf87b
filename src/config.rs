//! Configuration loading for agentmesh.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Get the agentmesh home directory (~/.agentmesh).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".agentmesh"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.agentmesh/settings.json
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&get_settings_path()?)
}

/// Load and validate settings from an explicit path.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}. Run 'agentmesh config init' first.",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;

    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

/// Write settings as pretty JSON, creating the parent directory.
pub fn save_settings(settings: &Settings, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    tracing::info!("Wrote settings to {}", path.display());
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    let positive = [
        ("livenessTimeoutSeconds", settings.liveness_timeout_seconds),
        ("discoveryIntervalSeconds", settings.discovery_interval_seconds),
        ("taskTimeoutSeconds", settings.task_timeout_seconds),
        ("capabilityTimeoutMillis", settings.capability_timeout_millis),
        ("ioTimeoutMillis", settings.io_timeout_millis),
    ];
    for (name, value) in positive {
        if value == 0 {
            return Err(Error::Config(format!("{} must be greater than zero", name)));
        }
    }

    if settings.liveness_timeout_seconds <= settings.discovery_interval_seconds {
        return Err(Error::Config(format!(
            "livenessTimeoutSeconds ({}) must exceed discoveryIntervalSeconds ({})",
            settings.liveness_timeout_seconds, settings.discovery_interval_seconds
        )));
    }

    if settings.max_payload_bytes < MIN_PAYLOAD_BYTES {
        return Err(Error::Config(format!(
            "maxPayloadBytes must be at least {}",
            MIN_PAYLOAD_BYTES
        )));
    }

    if settings.max_active_sessions == 0 || settings.max_agents == 0 {
        return Err(Error::Config(
            "maxActiveSessions and maxAgents must be greater than zero".to_string(),
        ));
    }

    if settings.capabilities.iter().all(|c| c.trim().is_empty()) {
        return Err(Error::Config("capabilities must not be empty".to_string()));
    }

    Ok(())
}

const MIN_PAYLOAD_BYTES: usize = 256;

/// Task executor configuration.
///
/// With no `program`, tasks are answered by the built-in echo executor.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_executor_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_executor_retries")]
    pub retries: u32,
    #[serde(default = "default_executor_retry_backoff_millis")]
    pub retry_backoff_millis: u64,
}

fn default_executor_timeout_seconds() -> u64 {
    240
}

fn default_executor_retries() -> u32 {
    1
}

fn default_executor_retry_backoff_millis() -> u64 {
    600
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            timeout_seconds: default_executor_timeout_seconds(),
            retries: default_executor_retries(),
            retry_backoff_millis: default_executor_retry_backoff_millis(),
        }
    }
}

/// agentmesh settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Fixed agent id; generated per process when absent.
    #[serde(default)]
    pub agent_id: Option<String>,

    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,

    #[serde(default = "default_liveness_timeout_seconds")]
    pub liveness_timeout_seconds: u64,

    #[serde(default = "default_discovery_interval_seconds")]
    pub discovery_interval_seconds: u64,

    #[serde(default = "default_task_timeout_seconds")]
    pub task_timeout_seconds: u64,

    #[serde(default = "default_capability_timeout_millis")]
    pub capability_timeout_millis: u64,

    #[serde(default = "default_busy_queue_threshold")]
    pub busy_queue_threshold: u32,

    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    #[serde(default = "default_session_grace_seconds")]
    pub session_grace_seconds: u64,

    #[serde(default = "default_max_active_sessions")]
    pub max_active_sessions: usize,

    #[serde(default = "default_max_agents")]
    pub max_agents: usize,

    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,

    #[serde(default = "default_shutdown_grace_millis")]
    pub shutdown_grace_millis: u64,

    #[serde(default = "default_io_timeout_millis")]
    pub io_timeout_millis: u64,

    #[serde(default)]
    pub executor: ExecutorConfig,
}

fn default_capabilities() -> Vec<String> {
    ["text-generation", "file-analysis", "terminal", "memory-search"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

fn default_liveness_timeout_seconds() -> u64 {
    30
}

fn default_discovery_interval_seconds() -> u64 {
    10
}

fn default_task_timeout_seconds() -> u64 {
    30
}

fn default_capability_timeout_millis() -> u64 {
    2000
}

fn default_busy_queue_threshold() -> u32 {
    5
}

fn default_max_payload_bytes() -> usize {
    8192
}

fn default_session_grace_seconds() -> u64 {
    60
}

fn default_max_active_sessions() -> usize {
    100
}

fn default_max_agents() -> usize {
    64
}

fn default_discovery_port() -> u16 {
    9876
}

fn default_listen_port() -> u16 {
    9877
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}

fn default_shutdown_grace_millis() -> u64 {
    2000
}

fn default_io_timeout_millis() -> u64 {
    3000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            agent_id: None,
            capabilities: default_capabilities(),
            liveness_timeout_seconds: default_liveness_timeout_seconds(),
            discovery_interval_seconds: default_discovery_interval_seconds(),
            task_timeout_seconds: default_task_timeout_seconds(),
            capability_timeout_millis: default_capability_timeout_millis(),
            busy_queue_threshold: default_busy_queue_threshold(),
            max_payload_bytes: default_max_payload_bytes(),
            session_grace_seconds: default_session_grace_seconds(),
            max_active_sessions: default_max_active_sessions(),
            max_agents: default_max_agents(),
            discovery_port: default_discovery_port(),
            listen_port: default_listen_port(),
            bind_address: default_bind_address(),
            broadcast_address: default_broadcast_address(),
            shutdown_grace_millis: default_shutdown_grace_millis(),
            io_timeout_millis: default_io_timeout_millis(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl Settings {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_seconds)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_seconds)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_seconds)
    }

    pub fn capability_timeout(&self) -> Duration {
        Duration::from_millis(self.capability_timeout_millis)
    }

    pub fn session_grace(&self) -> Duration {
        Duration::from_secs(self.session_grace_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_millis)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_millis)
    }

    /// Upper bound for one encoded envelope on the wire.
    pub fn max_frame_bytes(&self) -> usize {
        self.max_payload_bytes + 1024
    }
}
