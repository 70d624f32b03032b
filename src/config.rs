//! Configuration types for media-broker

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::Path, path::PathBuf, time::Duration};

/// Main configuration for the broker
///
/// Every field has a default, so an empty JSON object is a valid configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Directory receiving fetched artifacts and archives (default: "./downloads")
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// External tool discovery
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Request admission limits
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Artifact retention and sweeping
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Dynamic DNS heartbeat
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// HTTP API settings
    #[serde(default)]
    pub api: ApiConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            tools: ToolsConfig::default(),
            admission: AdmissionConfig::default(),
            retention: RetentionConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read {}: {}", path.display(), e),
            key: None,
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.max_delay < self.heartbeat.min_delay {
            return Err(Error::Config {
                message: "max_delay must not be smaller than min_delay".to_string(),
                key: Some("heartbeat.max_delay".to_string()),
            });
        }

        if self.retention.sweep_interval.is_zero() {
            return Err(Error::Config {
                message: "sweep_interval must be greater than zero".to_string(),
                key: Some("retention.sweep_interval".to_string()),
            });
        }

        if self.admission.max_concurrent_fetches == Some(0) {
            return Err(Error::Config {
                message: "max_concurrent_fetches must be at least 1 when set".to_string(),
                key: Some("admission.max_concurrent_fetches".to_string()),
            });
        }

        if self.heartbeat.enabled {
            for (key, value) in [
                ("heartbeat.host", &self.heartbeat.host),
                ("heartbeat.domain", &self.heartbeat.domain),
                ("heartbeat.password", &self.heartbeat.password),
            ] {
                if value.trim().is_empty() {
                    return Err(Error::Config {
                        message: "required when the heartbeat is enabled".to_string(),
                        key: Some(key.to_string()),
                    });
                }
            }
        }

        Ok(())
    }
}

/// External tool paths
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to the media fetch tool (auto-detected as `yt-dlp` if None)
    #[serde(default)]
    pub fetch_tool_path: Option<PathBuf>,

    /// Path to the archive tool (auto-detected as `zip` if None)
    #[serde(default)]
    pub archive_tool_path: Option<PathBuf>,

    /// Whether to search PATH for external binaries if explicit paths not set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,

    /// Upper bound on a single tool invocation (None = wait indefinitely)
    #[serde(default, with = "optional_duration_serde")]
    pub timeout: Option<Duration>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            fetch_tool_path: None,
            archive_tool_path: None,
            search_path: true,
            timeout: None,
        }
    }
}

/// Request admission limits
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Largest projected transfer accepted for one request (default: 2×10^10 bytes)
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: u64,

    /// Cap on simultaneous fetch pipelines (None = unbounded)
    #[serde(default)]
    pub max_concurrent_fetches: Option<usize>,

    /// Free-space check against the output directory
    #[serde(default)]
    pub disk_space: DiskSpaceConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_request_bytes: default_max_request_bytes(),
            max_concurrent_fetches: None,
            disk_space: DiskSpaceConfig::default(),
        }
    }
}

/// Disk space checking configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskSpaceConfig {
    /// Enable disk space checking before fetching (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Space that must remain free after the projected transfer (default: 1 GiB)
    #[serde(default = "default_min_free_space")]
    pub min_free_space: u64,
}

impl Default for DiskSpaceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_free_space: default_min_free_space(),
        }
    }
}

/// Artifact retention configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Age after which an unowned artifact is evicted (default: 24 hours)
    #[serde(default = "default_max_age", with = "duration_serde")]
    pub max_age: Duration,

    /// Pause between the end of one sweep and the start of the next (default: 5 seconds)
    #[serde(default = "default_sweep_interval", with = "duration_serde")]
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age: default_max_age(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// Dynamic DNS heartbeat configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Run the heartbeat loop (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Host record to update (e.g. "@" or "www")
    #[serde(default)]
    pub host: String,

    /// Domain owning the record
    #[serde(default)]
    pub domain: String,

    /// Dynamic DNS password for the domain
    #[serde(default)]
    pub password: String,

    /// Endpoint returning the caller's public address as plain text
    #[serde(default = "default_address_probe_url")]
    pub address_probe_url: String,

    /// Dynamic DNS update endpoint
    #[serde(default = "default_update_url")]
    pub update_url: String,

    /// Lower backoff bound, also the delay between healthy cycles (default: 5000 ms)
    #[serde(default = "default_min_delay", with = "duration_ms_serde")]
    pub min_delay: Duration,

    /// Upper backoff bound (default: 60000 ms)
    #[serde(default = "default_max_delay", with = "duration_ms_serde")]
    pub max_delay: Duration,

    /// Timeout for each probe/update HTTP call (default: 10 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            domain: String::new(),
            password: String::new(),
            address_probe_url: default_address_probe_url(),
            update_url: default_update_url(),
            min_delay: default_min_delay(),
            max_delay: default_max_delay(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// REST API configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the API server (default: 127.0.0.1:8080)
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Enable CORS for browser access (default: true)
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Allowed CORS origins (default: ["*"])
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Serve Swagger UI at /swagger-ui (default: false)
    #[serde(default)]
    pub swagger_ui: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            cors_enabled: true,
            cors_origins: default_cors_origins(),
            swagger_ui: false,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_true() -> bool {
    true
}

fn default_max_request_bytes() -> u64 {
    20_000_000_000
}

fn default_min_free_space() -> u64 {
    1024 * 1024 * 1024
}

fn default_max_age() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_address_probe_url() -> String {
    "https://api.ipify.org".to_string()
}

fn default_update_url() -> String {
    "https://dynamicdns.park-your-domain.com/update".to_string()
}

fn default_min_delay() -> Duration {
    Duration::from_millis(5_000)
}

fn default_max_delay() -> Duration {
    Duration::from_millis(60_000)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
