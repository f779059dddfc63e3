//! gridfleet.toml configuration parser.
//!
//! Every section is optional; omitted keys take the defaults below.
//! Durations are strings such as `"100ms"`, `"1s"` or `"2m"`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable consulted when `native.executable_path` is unset.
pub const GRID_SERVER_PATH_ENV: &str = "GRID_SERVER_PATH";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub ports: PortsConfig,
    pub health: HealthConfig,
    pub native: NativeConfig,
    pub docker: DockerConfig,
}

/// Port allocator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// First port of the allocation range (inclusive).
    pub range_start: u16,
    /// End of the allocation range (exclusive).
    pub range_end: u16,
    /// Random candidates tried per allocation.
    pub max_attempts: u32,
    /// How long a released port stays out of rotation.
    pub reuse_cooldown: String,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range_start: 45000,
            range_end: 47000,
            max_attempts: 1000,
            reuse_cooldown: "30s".to_string(),
        }
    }
}

impl PortsConfig {
    pub fn reuse_cooldown(&self) -> Result<Duration, ConfigError> {
        require_duration("ports.reuse_cooldown", &self.reuse_cooldown)
    }
}

/// Liveness probing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Host the grid servers listen on.
    pub host: String,
    /// Probe attempts before an instance is declared unavailable.
    pub attempts: u32,
    /// Per-attempt timeout, also slept between attempts.
    pub timeout: String,
    pub scheme: String,
    pub path: String,
    /// Body a healthy grid server answers with.
    pub expected_text: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            attempts: 30,
            timeout: "1s".to_string(),
            scheme: "http".to_string(),
            path: "/health".to_string(),
            expected_text: "OK".to_string(),
        }
    }
}

impl HealthConfig {
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        require_duration("health.timeout", &self.timeout)
    }
}

/// Native process backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
    /// File name of the grid server executable.
    pub executable_name: String,
    /// Directory holding the executable. Falls back to the registry value
    /// below on Windows, then to `$GRID_SERVER_PATH`.
    pub executable_path: Option<PathBuf>,
    /// Registry key holding the install directory, e.g.
    /// `HKEY_LOCAL_MACHINE\SOFTWARE\GridServer`. Windows only.
    pub registry_key: Option<String>,
    /// Value name under `registry_key`.
    pub registry_value: String,
    /// Argument template; `{port}` is substituted. Defaults to `{port} -Console`.
    pub arguments: Option<String>,
    /// Adopt already-running grid servers at startup.
    pub discover_on_start: bool,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            executable_name: "grid-server".to_string(),
            executable_path: None,
            registry_key: None,
            registry_value: "InstallPath".to_string(),
            arguments: None,
            discover_on_start: true,
        }
    }
}

impl NativeConfig {
    /// Directory of the executable: config first, then the environment.
    pub fn resolve_executable_path(&self) -> Option<PathBuf> {
        self.executable_path.clone().or_else(|| {
            std::env::var_os(GRID_SERVER_PATH_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        })
    }

    /// Process name as it appears in the process table (file stem).
    pub fn process_name(&self) -> String {
        Path::new(&self.executable_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.executable_name.clone())
    }
}

/// Container backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Primary engine endpoint (`unix://` or `http://`).
    pub socket_uri: String,
    /// Endpoint tried when the primary one is unreachable.
    pub fallback_uri: Option<String>,
    /// Image repository, also the name of the reference container images
    /// are committed from.
    pub image_name: String,
    pub image_tag: String,
    pub remove_volumes: bool,
    /// Sleep between remove attempts (default 100ms).
    pub container_stop_sleep_interval: Option<String>,
    pub max_attempts_to_wait_for_container_exit: u32,
    /// Upper bound on a single image commit.
    pub max_time_to_wait_for_image: String,
    /// Passed to grid servers as `SETTINGS_KEY`; required to create containers.
    pub settings_key: Option<String>,
    pub http_access_key: Option<String>,
    pub shared_logs_directory: String,
    pub shared_internal_scripts_directory: String,
    pub mount_path_override: Option<String>,
    pub reserved_cores_per_instance: Option<f64>,
    pub max_memory_bytes: i64,
    pub max_threads: i64,
    pub primary_dns_server: Option<String>,
    pub secondary_dns_server: Option<String>,
    pub environment: HashMap<String, String>,
    /// Override host core counts instead of reading `/proc/cpuinfo`.
    pub physical_cores: Option<u32>,
    pub logical_cores: Option<u32>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_uri: "unix:///var/run/docker.sock".to_string(),
            fallback_uri: Some("http://host.docker.internal:2375".to_string()),
            image_name: "grid-server".to_string(),
            image_tag: "latest".to_string(),
            remove_volumes: true,
            container_stop_sleep_interval: None,
            max_attempts_to_wait_for_container_exit: 5,
            max_time_to_wait_for_image: "5m".to_string(),
            settings_key: None,
            http_access_key: None,
            shared_logs_directory: "/var/log/grid-server".to_string(),
            shared_internal_scripts_directory: "/opt/grid-server/internalscripts".to_string(),
            mount_path_override: None,
            reserved_cores_per_instance: None,
            max_memory_bytes: 0,
            max_threads: 0,
            primary_dns_server: None,
            secondary_dns_server: None,
            environment: HashMap::new(),
            physical_cores: None,
            logical_cores: None,
        }
    }
}

impl DockerConfig {
    pub fn container_stop_sleep_interval(&self) -> Result<Duration, ConfigError> {
        match &self.container_stop_sleep_interval {
            Some(value) => require_duration("docker.container_stop_sleep_interval", value),
            None => Ok(Duration::from_millis(100)),
        }
    }

    pub fn max_time_to_wait_for_image(&self) -> Result<Duration, ConfigError> {
        require_duration("docker.max_time_to_wait_for_image", &self.max_time_to_wait_for_image)
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: FleetConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Reject configurations no backend could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.range_start < 1024 {
            return Err(ConfigError::Invalid(format!(
                "ports.range_start {} is inside the well-known range",
                self.ports.range_start
            )));
        }
        if self.ports.range_end <= self.ports.range_start {
            return Err(ConfigError::Invalid(format!(
                "ports.range_end {} must be greater than range_start {}",
                self.ports.range_end, self.ports.range_start
            )));
        }
        if self.ports.max_attempts == 0 {
            return Err(ConfigError::Invalid("ports.max_attempts must be > 0".into()));
        }
        if self.health.attempts == 0 {
            return Err(ConfigError::Invalid("health.attempts must be > 0".into()));
        }
        if self.docker.max_attempts_to_wait_for_container_exit == 0 {
            return Err(ConfigError::Invalid(
                "docker.max_attempts_to_wait_for_container_exit must be > 0".into(),
            ));
        }
        if self.native.executable_name.is_empty() {
            return Err(ConfigError::Invalid("native.executable_name cannot be empty".into()));
        }
        self.ports.reuse_cooldown()?;
        self.health.timeout()?;
        self.docker.container_stop_sleep_interval()?;
        self.docker.max_time_to_wait_for_image()?;
        Ok(())
    }
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn require_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::Duration {
        field,
        value: value.to_string(),
    })
}
