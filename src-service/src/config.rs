//! Configuration management for the subtext service.
//!
//! Configuration loads from a JSON file in the platform config
//! directory (Linux: `~/.config/subtext/config.json`) and is then
//! overridden by environment variables, so deployments can tune the
//! service without touching files:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `SUBTEXT_MODEL` | default inference model variant |
//! | `SUBTEXT_PRECISION` | `float16` / `int8` / `float32` |
//! | `SUBTEXT_DEVICES` | comma-separated device ordinals for the pool |
//! | `SUBTEXT_MAX_SESSIONS` | admission ceiling |
//! | `SUBTEXT_PRELOAD` | warm the default engine at startup |
//! | `SUBTEXT_ENGINE_BIN` / `SUBTEXT_WORKER_BIN` | external binaries |
//! | `SUBTEXT_DATA_DIR` | storage root (sessions/downloads/outputs) |
//! | `SUBTEXT_LISTEN_HOST` / `SUBTEXT_LISTEN_PORT` | front-end binding |

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::partition::PartitionConfig;
use crate::session::StorageLayout;
use crate::worker::link::WorkerSpawnConfig;
use subtext_common::types::{ModelKey, Precision};

/// Engine-related configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default model variant for requests that do not name one.
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub precision: Precision,
    /// Inference engine binary.
    #[serde(default = "default_engine_bin")]
    pub engine_bin: String,
    /// Worker process binary.
    #[serde(default = "default_worker_bin")]
    pub worker_bin: String,
    /// Warm the default engine at service start.
    #[serde(default)]
    pub preload: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            precision: Precision::default(),
            engine_bin: default_engine_bin(),
            worker_bin: default_worker_bin(),
            preload: false,
        }
    }
}

/// Scheduling and worker-pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Device ordinals usable by the worker pool; defines N.
    #[serde(default = "default_devices")]
    pub devices: Vec<u32>,
    /// Admission ceiling.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// How long a caller waits for an admission slot.
    #[serde(default = "default_admission_deadline_s")]
    pub admission_deadline_s: u64,
    /// How long a cold worker spawn may take.
    #[serde(default = "default_ready_timeout_s")]
    pub ready_timeout_s: u64,
    #[serde(default = "default_min_unit_s")]
    pub min_unit_s: f64,
    #[serde(default = "default_max_unit_s")]
    pub max_unit_s: f64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            max_sessions: default_max_sessions(),
            admission_deadline_s: default_admission_deadline_s(),
            ready_timeout_s: default_ready_timeout_s(),
            min_unit_s: default_min_unit_s(),
            max_unit_s: default_max_unit_s(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage root. If unset, the platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Stale sessions, downloads and artefacts older than this are
    /// swept.
    #[serde(default = "default_max_artifact_age_hours")]
    pub max_artifact_age_hours: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_artifact_age_hours: default_max_artifact_age_hours(),
        }
    }
}

/// Network binding reserved for the web front-end; the core service
/// itself listens on the Unix socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

fn default_model() -> String {
    "large-v3-turbo".to_string()
}

fn default_engine_bin() -> String {
    "subtext-engine".to_string()
}

fn default_worker_bin() -> String {
    "subtext-worker".to_string()
}

fn default_devices() -> Vec<u32> {
    vec![0]
}

fn default_max_sessions() -> usize {
    2
}

fn default_admission_deadline_s() -> u64 {
    600
}

fn default_ready_timeout_s() -> u64 {
    180
}

fn default_min_unit_s() -> f64 {
    15.0
}

fn default_max_unit_s() -> f64 {
    45.0
}

fn default_max_artifact_age_hours() -> u64 {
    24
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    7860
}

/// Get the path to the config file.
fn get_config_path() -> Option<PathBuf> {
    let proj_dirs = ProjectDirs::from("", "", "subtext")?;
    Some(proj_dirs.config_dir().join("config.json"))
}

impl ServiceConfig {
    /// Load from the config file (defaults if absent or invalid), then
    /// apply environment overrides.
    pub fn load() -> Self {
        let mut config = match get_config_path() {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match serde_json::from_str::<ServiceConfig>(&contents) {
                    Ok(config) => config,
                    Err(e) => {
                        warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        ServiceConfig::default()
                    }
                },
                Err(e) => {
                    warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    ServiceConfig::default()
                }
            },
            _ => ServiceConfig::default(),
        };
        config.apply_env();
        config
    }

    /// Apply the `SUBTEXT_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(model) = std::env::var("SUBTEXT_MODEL") {
            self.engine.model = model;
        }
        if let Ok(value) = std::env::var("SUBTEXT_PRECISION") {
            match Precision::parse(&value) {
                Some(precision) => self.engine.precision = precision,
                None => warn!("Ignoring invalid SUBTEXT_PRECISION={}", value),
            }
        }
        if let Ok(value) = std::env::var("SUBTEXT_DEVICES") {
            match parse_devices(&value) {
                Some(devices) => self.scheduling.devices = devices,
                None => warn!("Ignoring invalid SUBTEXT_DEVICES={}", value),
            }
        }
        if let Ok(value) = std::env::var("SUBTEXT_MAX_SESSIONS") {
            match value.parse() {
                Ok(n) => self.scheduling.max_sessions = n,
                Err(_) => warn!("Ignoring invalid SUBTEXT_MAX_SESSIONS={}", value),
            }
        }
        if let Ok(value) = std::env::var("SUBTEXT_PRELOAD") {
            self.engine.preload = matches!(value.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(bin) = std::env::var("SUBTEXT_ENGINE_BIN") {
            self.engine.engine_bin = bin;
        }
        if let Ok(bin) = std::env::var("SUBTEXT_WORKER_BIN") {
            self.engine.worker_bin = bin;
        }
        if let Ok(dir) = std::env::var("SUBTEXT_DATA_DIR") {
            self.storage.data_dir = Some(dir);
        }
        if let Ok(host) = std::env::var("SUBTEXT_LISTEN_HOST") {
            self.network.listen_host = host;
        }
        if let Ok(value) = std::env::var("SUBTEXT_LISTEN_PORT") {
            match value.parse() {
                Ok(port) => self.network.listen_port = port,
                Err(_) => warn!("Ignoring invalid SUBTEXT_LISTEN_PORT={}", value),
            }
        }
    }

    /// Storage root: configured directory, or the platform data dir.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.storage.data_dir {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        ProjectDirs::from("", "", "subtext")
            .map(|dirs| dirs.data_local_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./subtext-data"))
    }

    pub fn storage_layout(&self) -> StorageLayout {
        StorageLayout::under(&self.data_dir())
    }

    pub fn default_model_key(&self) -> ModelKey {
        ModelKey::new(self.engine.model.clone(), self.engine.precision)
    }

    pub fn max_artifact_age(&self) -> Duration {
        Duration::from_secs(self.storage.max_artifact_age_hours * 3600)
    }

    pub fn admission_deadline(&self) -> Duration {
        Duration::from_secs(self.scheduling.admission_deadline_s)
    }

    pub fn partition_config(&self) -> PartitionConfig {
        PartitionConfig {
            min_unit_s: self.scheduling.min_unit_s,
            max_unit_s: self.scheduling.max_unit_s,
            ..PartitionConfig::default()
        }
    }

    pub fn spawn_config(&self, model_key: ModelKey) -> WorkerSpawnConfig {
        WorkerSpawnConfig {
            worker_bin: PathBuf::from(&self.engine.worker_bin),
            engine_bin: PathBuf::from(&self.engine.engine_bin),
            model_key,
            ready_timeout: Duration::from_secs(self.scheduling.ready_timeout_s),
        }
    }
}

/// Parse a comma-separated device list (`"0,1,3"`).
fn parse_devices(value: &str) -> Option<Vec<u32>> {
    let devices: Vec<u32> = value
        .split(',')
        .map(|part| part.trim().parse().ok())
        .collect::<Option<_>>()?;
    if devices.is_empty() {
        None
    } else {
        Some(devices)
    }
}
