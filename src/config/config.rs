//! Configuration structures and loading

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Offset between the IPC port published on the host and the matching VNC port.
pub const VNC_PORT_OFFSET: u16 = 10_000;

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfiguration,

    /// State database configuration
    #[serde(default)]
    pub database: DatabaseConfiguration,

    /// Host port range handed out to instances
    pub ports: PortsConfiguration,

    /// Docker configuration
    pub docker: DockerConfiguration,

    /// File cache configuration
    pub cache: CacheConfiguration,

    /// Readiness checker configuration
    pub checker: CheckerConfiguration,

    /// Host admission thresholds
    #[serde(default)]
    pub thresholds: ThresholdConfiguration,

    /// Background task engine configuration
    #[serde(default)]
    pub tasks: TaskConfiguration,

    /// Reconciler configuration
    #[serde(default)]
    pub monitor: MonitorConfiguration,

    /// Pool pre-warming configuration
    #[serde(default)]
    pub pool: PoolConfiguration,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        config.validate()?;

        std::fs::create_dir_all(&config.cache.directory)
            .with_context(|| "Failed to create cache directory")?;

        Ok(config)
    }

    /// Check cross-field invariants the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        if u16::MAX - VNC_PORT_OFFSET < self.ports.highest {
            bail!(
                "ports.highest {} leaves no room for the VNC offset of {}",
                self.ports.highest,
                VNC_PORT_OFFSET
            );
        }
        Ok(())
    }

    /// Address the HTTP API binds to
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfiguration {
    /// Host to bind to
    #[serde(default = "default_api_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

fn default_api_host() -> String {
    "0.0.0.0".into()
}

fn default_api_port() -> u16 {
    5000
}

/// State database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfiguration {
    /// Path to the SQLite database file
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfiguration {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/lib/ptpool/ptpool.db")
}

/// Host port range [lowest, highest] reserved for instances
#[derive(Debug, Clone, Deserialize)]
pub struct PortsConfiguration {
    pub lowest: u16,
    pub highest: u16,
}

/// Docker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfiguration {
    /// Docker endpoint; unix socket path or http(s) URL. Local defaults when unset.
    #[serde(default)]
    pub url: Option<String>,

    /// Image instances are created from
    #[serde(default = "default_docker_image")]
    pub image: String,

    /// Data-only container whose volumes every instance attaches
    #[serde(default = "default_data_container")]
    pub data_container: String,

    /// IPC port inside the container
    #[serde(default = "default_pt_port")]
    pub pt_port: u16,

    /// VNC port inside the container
    #[serde(default = "default_vnc_port")]
    pub vnc_port: u16,
}

fn default_docker_image() -> String {
    "packettracer".into()
}

fn default_data_container() -> String {
    "ptshared".into()
}

fn default_pt_port() -> u16 {
    39000
}

fn default_vnc_port() -> u16 {
    5900
}

/// File cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfiguration {
    /// Host directory downloads land in
    pub directory: PathBuf,

    /// Path the cache volume is mounted at inside instances
    #[serde(default = "default_container_directory")]
    pub container_directory: String,
}

fn default_container_directory() -> String {
    "/data/cache".into()
}

/// Readiness checker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CheckerConfiguration {
    /// Absolute path to the checker jar
    pub jar_path: PathBuf,

    /// Host the probe connects to
    #[serde(default = "default_checker_host")]
    pub host: String,

    /// Per-attempt probe timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_checker_host() -> String {
    "localhost".into()
}

fn default_probe_timeout() -> u64 {
    2
}

/// Host admission thresholds, in percent
#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdConfiguration {
    #[serde(default = "default_threshold")]
    pub cpu: f32,

    #[serde(default = "default_threshold")]
    pub memory: f32,
}

impl Default for ThresholdConfiguration {
    fn default() -> Self {
        Self {
            cpu: default_threshold(),
            memory: default_threshold(),
        }
    }
}

fn default_threshold() -> f32 {
    90.0
}

/// Background task engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfiguration {
    /// Number of worker tasks draining the queue
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Readiness retries after the first probe attempt
    #[serde(default = "default_ready_max_retries")]
    pub ready_max_retries: u32,

    /// Delay between readiness attempts in seconds
    #[serde(default = "default_ready_retry_delay")]
    pub ready_retry_delay_secs: u64,

    /// Deadline for a client-facing allocation in seconds
    #[serde(default = "default_allocate_timeout")]
    pub allocate_timeout_secs: u64,
}

impl Default for TaskConfiguration {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            ready_max_retries: default_ready_max_retries(),
            ready_retry_delay_secs: default_ready_retry_delay(),
            allocate_timeout_secs: default_allocate_timeout(),
        }
    }
}

fn default_workers() -> usize {
    num_cpus::get().max(2)
}

fn default_ready_max_retries() -> u32 {
    3
}

fn default_ready_retry_delay() -> u64 {
    10
}

fn default_allocate_timeout() -> u64 {
    30
}

/// Reconciler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfiguration {
    /// Cron expression for the periodic reconciler pass
    #[serde(default = "default_monitor_schedule")]
    pub schedule: String,
}

impl Default for MonitorConfiguration {
    fn default() -> Self {
        Self {
            schedule: default_monitor_schedule(),
        }
    }
}

fn default_monitor_schedule() -> String {
    // Every two minutes
    "0 */2 * * * *".into()
}

/// Pool pre-warming configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolConfiguration {
    /// Instances to create at boot so the pool starts warm
    #[serde(default)]
    pub size: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfiguration {
    /// Log file; stdout when unset
    #[serde(default)]
    pub file: Option<PathBuf>,
}
