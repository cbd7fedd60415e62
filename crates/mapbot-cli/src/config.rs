//! Configuration Vault – reads/writes `~/.mapbot/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mapbot_middleware::DeviceLinkConfig;
use mapbot_runtime::{MapperConfig, PipelineConfig};
use serde::{Deserialize, Serialize};

/// Persisted bridge configuration stored in `~/.mapbot/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Robot WebSocket host.
    #[serde(default = "default_device_host")]
    pub device_host: String,

    #[serde(default = "default_device_port")]
    pub device_port: u16,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// HTTP + WebSocket port browsers connect to.
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,

    #[serde(default = "default_grid_size")]
    pub grid_size: usize,

    #[serde(default = "default_cell_size")]
    pub cell_size: f64,

    #[serde(default = "default_max_distance")]
    pub max_distance: f64,

    #[serde(default = "default_map_push_interval_ms")]
    pub map_push_interval_ms: u64,

    #[serde(default = "default_camera_buffer_size")]
    pub camera_buffer_size: usize,

    /// SQLite file for finished maps. Empty means `~/.mapbot/maps.db`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub database_path: String,

    /// `"compact"` or `"json"`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_device_host() -> String {
    "192.168.1.100".to_string()
}
fn default_device_port() -> u16 {
    8080
}
fn default_reconnect_interval_ms() -> u64 {
    5000
}
fn default_heartbeat_interval_ms() -> u64 {
    3000
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_gateway_port() -> u16 {
    3000
}
fn default_grid_size() -> usize {
    100
}
fn default_cell_size() -> f64 {
    10.0
}
fn default_max_distance() -> f64 {
    400.0
}
fn default_map_push_interval_ms() -> u64 {
    200
}
fn default_camera_buffer_size() -> usize {
    10
}
fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_host: default_device_host(),
            device_port: default_device_port(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            gateway_port: default_gateway_port(),
            grid_size: default_grid_size(),
            cell_size: default_cell_size(),
            max_distance: default_max_distance(),
            map_push_interval_ms: default_map_push_interval_ms(),
            camera_buffer_size: default_camera_buffer_size(),
            database_path: String::new(),
            log_format: default_log_format(),
        }
    }
}

impl Config {
    /// Runtime settings derived from this config.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            map_push_interval: Duration::from_millis(self.map_push_interval_ms),
            camera_buffer_size: self.camera_buffer_size,
            mapper: MapperConfig {
                grid_size: self.grid_size,
                cell_size: self.cell_size,
                max_distance: self.max_distance,
                ..MapperConfig::default()
            },
            link: DeviceLinkConfig {
                reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
                heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            },
        }
    }

    /// Resolved SQLite path.
    pub fn database_path(&self) -> PathBuf {
        if self.database_path.is_empty() {
            mapbot_dir(&home_dir()).join("maps.db")
        } else {
            PathBuf::from(&self.database_path)
        }
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn mapbot_dir(home: &str) -> PathBuf {
    PathBuf::from(home).join(".mapbot")
}

/// Return the path to `~/.mapbot/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    mapbot_dir(home).join("config.toml")
}

/// Load the config from disk and apply `MAPBOT_*` overrides.  Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `MAPBOT_*` environment variable overrides to `cfg`.
///
/// Values that fail to parse are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `MAPBOT_DEVICE_HOST` | `device_host` |
/// | `MAPBOT_DEVICE_PORT` | `device_port` |
/// | `MAPBOT_RECONNECT_INTERVAL_MS` | `reconnect_interval_ms` |
/// | `MAPBOT_HEARTBEAT_INTERVAL_MS` | `heartbeat_interval_ms` |
/// | `MAPBOT_GATEWAY_PORT` | `gateway_port` |
/// | `MAPBOT_DATABASE_PATH` | `database_path` |
/// | `MAPBOT_GRID_SIZE` | `grid_size` |
/// | `MAPBOT_CELL_SIZE` | `cell_size` |
/// | `MAPBOT_MAX_DISTANCE` | `max_distance` |
/// | `MAPBOT_CAMERA_BUFFER_SIZE` | `camera_buffer_size` |
/// | `MAPBOT_LOG_FORMAT` | `log_format` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("MAPBOT_DEVICE_HOST")
        && !v.trim().is_empty()
    {
        cfg.device_host = v;
    }
    if let Ok(v) = std::env::var("MAPBOT_DATABASE_PATH") {
        cfg.database_path = v;
    }
    if let Ok(v) = std::env::var("MAPBOT_LOG_FORMAT") {
        cfg.log_format = v;
    }
    override_parsed("MAPBOT_DEVICE_PORT", &mut cfg.device_port);
    override_parsed("MAPBOT_RECONNECT_INTERVAL_MS", &mut cfg.reconnect_interval_ms);
    override_parsed("MAPBOT_HEARTBEAT_INTERVAL_MS", &mut cfg.heartbeat_interval_ms);
    override_parsed("MAPBOT_GATEWAY_PORT", &mut cfg.gateway_port);
    override_parsed("MAPBOT_GRID_SIZE", &mut cfg.grid_size);
    override_parsed("MAPBOT_CELL_SIZE", &mut cfg.cell_size);
    override_parsed("MAPBOT_MAX_DISTANCE", &mut cfg.max_distance);
    override_parsed("MAPBOT_CAMERA_BUFFER_SIZE", &mut cfg.camera_buffer_size);
}

fn override_parsed<T: std::str::FromStr>(var: &str, field: &mut T) {
    if let Ok(v) = std::env::var(var)
        && let Ok(parsed) = v.trim().parse::<T>()
    {
        *field = parsed;
    }
}

/// Save the config to disk, creating `~/.mapbot/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner read/write only (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
