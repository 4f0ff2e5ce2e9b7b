//! Configuration file management module
//!
//! Handles YAML configuration file parsing, validation, and default values.
//! Uses Serde to declaratively define configuration structure with
//! strong validation.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::net::TcpStream;

use crate::constants::{
    get_home_config_path, get_system_config_path, CIRCUIT_MAX_AGE_SECS,
    CIRCUIT_ROTATION_STAGGER_SECS, DEFAULT_API_PORT, DEFAULT_BACKEND_DNS_PORT, DEFAULT_DNS_PORT,
    DEFAULT_SOCKS_PORT, DNS_CACHE_HARD_CAP, DNS_TIMEOUT_SECS, GRACEFUL_ROTATION_TIMEOUT_SECS,
    HEALTH_CHECK_INTERVAL_MS, IP_DIVERSITY_CHECK_INTERVAL_SECS,
    IP_DIVERSITY_ROTATION_COOLDOWN_SECS, PERF_SPEED_TEST_DEFAULT_BYTES, PERF_TEST_INTERVAL_SECS,
    SOCKS_TIMEOUT_SECS,
};

/// Load balancing algorithm types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BalanceMethod {
    /// Uniform random selection among healthy, non-draining backends.
    Random,
    /// Select backends sequentially via an atomic round-robin cursor.
    RoundRobin,
    /// Select the backend with the fewest active connections.
    LeastConnections,
}

impl Default for BalanceMethod {
    fn default() -> Self {
        BalanceMethod::RoundRobin
    }
}

impl std::fmt::Display for BalanceMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BalanceMethod::Random => write!(f, "random"),
            BalanceMethod::RoundRobin => write!(f, "round-robin"),
            BalanceMethod::LeastConnections => write!(f, "least-connections"),
        }
    }
}

/// Individual backend instance configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    /// Backend host (IP address or hostname).
    pub host: String,
    /// Control-channel port (cookie-authenticated).
    pub control_port: u16,
    /// SOCKS5 listener port on the backend.
    pub socks_port: u16,
    /// DNS listener port on the backend (defaults to 53 if unset).
    #[serde(default)]
    pub dns_port: Option<u16>,
    /// Path to the control-auth cookie file.
    pub cookie_path: String,
    /// Backend's data directory (read-only to this process).
    pub data_dir: String,
    /// Optional per-backend client-connection cap.
    #[serde(default)]
    pub max_connections: Option<u32>,
}

impl BackendConfig {
    pub fn control_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.control_port);
        addr_str
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid control address: {}", addr_str))
    }

    pub fn socks_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.socks_port);
        addr_str
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid SOCKS address: {}", addr_str))
    }

    pub fn dns_addr(&self) -> Result<SocketAddr> {
        let port = self.dns_port.unwrap_or(DEFAULT_BACKEND_DNS_PORT);
        let addr_str = format!("{}:{}", self.host, port);
        addr_str
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid DNS address: {}", addr_str))
    }

    /// Quick control-port reachability probe (1 second timeout). Used by
    /// `check` for a cheap pre-flight signal; not a bootstrap health check.
    pub async fn check_connectivity(&self) -> Result<()> {
        let addr = self.control_addr()?;
        match tokio::time::timeout(Duration::from_secs(1), TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => bail!("Backend {} connection failed: {}", addr, e),
            Err(_) => bail!("Backend {} connection timeout", addr),
        }
    }
}

/// DNS response cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dns_cache_cap")]
    pub hard_cap: usize,
    #[serde(default)]
    pub default_min_ttl_secs: Option<u32>,
    #[serde(default)]
    pub min_ttl_override_secs: Option<u32>,
    #[serde(default)]
    pub max_ttl_override_secs: Option<u32>,
}

impl Default for DnsCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hard_cap: DNS_CACHE_HARD_CAP,
            default_min_ttl_secs: None,
            min_ttl_override_secs: None,
            max_ttl_override_secs: None,
        }
    }
}

/// Circuit-manager rotation tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_circuit_max_age")]
    pub max_age_secs: u64,
    #[serde(default = "default_rotation_stagger")]
    pub rotation_stagger_secs: u64,
    #[serde(default = "default_graceful_rotation_timeout")]
    pub graceful_rotation_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub ip_diversity_enabled: bool,
    #[serde(default = "default_diversity_min_backends")]
    pub ip_diversity_min_backends: usize,
    #[serde(default = "default_diversity_check_interval")]
    pub ip_diversity_check_interval_secs: u64,
    #[serde(default = "default_diversity_cooldown")]
    pub ip_diversity_rotation_cooldown_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_secs: CIRCUIT_MAX_AGE_SECS,
            rotation_stagger_secs: CIRCUIT_ROTATION_STAGGER_SECS,
            graceful_rotation_timeout_secs: GRACEFUL_ROTATION_TIMEOUT_SECS,
            ip_diversity_enabled: true,
            ip_diversity_min_backends: 2,
            ip_diversity_check_interval_secs: IP_DIVERSITY_CHECK_INTERVAL_SECS,
            ip_diversity_rotation_cooldown_secs: IP_DIVERSITY_ROTATION_COOLDOWN_SECS,
        }
    }
}

/// Performance-probe tuning (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PerfConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_perf_interval")]
    pub interval_secs: u64,
    /// name => URL for latency (HEAD) probes.
    #[serde(default)]
    pub latency_targets: HashMap<String, String>,
    #[serde(default)]
    pub speed_target_url: Option<String>,
    #[serde(default = "default_speed_bytes")]
    pub speed_target_bytes: u64,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: PERF_TEST_INTERVAL_SECS,
            latency_targets: HashMap::new(),
            speed_target_url: None,
            speed_target_bytes: PERF_SPEED_TEST_DEFAULT_BYTES,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_dns_cache_cap() -> usize {
    DNS_CACHE_HARD_CAP
}
fn default_circuit_max_age() -> u64 {
    CIRCUIT_MAX_AGE_SECS
}
fn default_rotation_stagger() -> u64 {
    CIRCUIT_ROTATION_STAGGER_SECS
}
fn default_graceful_rotation_timeout() -> u64 {
    GRACEFUL_ROTATION_TIMEOUT_SECS
}
fn default_diversity_min_backends() -> usize {
    2
}
fn default_diversity_check_interval() -> u64 {
    IP_DIVERSITY_CHECK_INTERVAL_SECS
}
fn default_diversity_cooldown() -> u64 {
    IP_DIVERSITY_ROTATION_COOLDOWN_SECS
}
fn default_perf_interval() -> u64 {
    PERF_TEST_INTERVAL_SECS
}
fn default_speed_bytes() -> u64 {
    PERF_SPEED_TEST_DEFAULT_BYTES
}
fn default_socks_port() -> u16 {
    DEFAULT_SOCKS_PORT
}
fn default_dns_port() -> u16 {
    DEFAULT_DNS_PORT
}
fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}
fn default_socks_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_dns_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_api_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_socks_timeout() -> u64 {
    SOCKS_TIMEOUT_SECS
}
fn default_dns_timeout() -> u64 {
    DNS_TIMEOUT_SECS
}
fn default_health_check_interval_ms() -> u64 {
    HEALTH_CHECK_INTERVAL_MS
}

/// Complete configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Common SOCKS5 listener bind address.
    #[serde(default = "default_socks_bind")]
    pub socks_bind: String,
    /// Common SOCKS5 listener port.
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    /// Common DNS proxy bind address.
    #[serde(default = "default_dns_bind")]
    pub dns_bind: String,
    /// Common DNS proxy port.
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
    /// Management HTTP API bind address.
    #[serde(default = "default_api_bind")]
    pub api_bind: String,
    /// Management HTTP API port.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Load balancing strategy.
    #[serde(default)]
    pub method: BalanceMethod,

    /// List of backend instances.
    pub backends: Vec<BackendConfig>,

    /// Global maximum concurrent client connections across all backends.
    #[serde(default)]
    pub max_total_connections: Option<u32>,

    /// SOCKS connect/dial timeout.
    #[serde(default = "default_socks_timeout")]
    pub socks_timeout_secs: u64,
    /// Optional SOCKS accept jitter, in milliseconds (0 disables).
    #[serde(default)]
    pub socks_accept_jitter_ms: u64,
    /// Allow private/loopback/link-local/ULA destinations through SOCKS.
    #[serde(default)]
    pub allow_private_destinations: bool,

    /// DNS forward timeout.
    #[serde(default = "default_dns_timeout")]
    pub dns_timeout_secs: u64,
    /// DNS response cache tuning.
    #[serde(default)]
    pub dns_cache: DnsCacheConfig,

    /// Health check interval.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Circuit manager tuning.
    #[serde(default)]
    pub circuit: CircuitConfig,

    /// Performance probe tuning.
    #[serde(default)]
    pub perf: PerfConfig,

    /// Exit-IP lookup URL (used by the per-backend HTTP client).
    #[serde(default = "default_exit_ip_url")]
    pub exit_ip_url: String,

    /// Log level: "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_exit_ip_url() -> String {
    "https://api.ipify.org?format=json".to_string()
}

impl Config {
    /// Create new Config with defaults.
    pub fn new() -> Self {
        Self {
            socks_bind: default_socks_bind(),
            socks_port: DEFAULT_SOCKS_PORT,
            dns_bind: default_dns_bind(),
            dns_port: DEFAULT_DNS_PORT,
            api_bind: default_api_bind(),
            api_port: DEFAULT_API_PORT,
            method: BalanceMethod::RoundRobin,
            backends: Vec::new(),
            max_total_connections: None,
            socks_timeout_secs: SOCKS_TIMEOUT_SECS,
            socks_accept_jitter_ms: 0,
            allow_private_destinations: false,
            dns_timeout_secs: DNS_TIMEOUT_SECS,
            dns_cache: DnsCacheConfig::default(),
            health_check_interval_ms: HEALTH_CHECK_INTERVAL_MS,
            circuit: CircuitConfig::default(),
            perf: PerfConfig::default(),
            exit_ip_url: default_exit_ip_url(),
            log_level: default_log_level(),
        }
    }

    /// Resolve configuration file path.
    ///
    /// Uses CLI specified path if available, otherwise searches default
    /// paths. Priority:
    /// 1. Path specified via CLI argument
    /// 2. $HOME/.torfleet/config.yaml
    /// 3. /etc/torfleet/config.yaml
    pub fn resolve_config_path(cli_path: Option<&Path>) -> Result<std::path::PathBuf> {
        if let Some(path) = cli_path {
            return Ok(path.to_path_buf());
        }

        let home_path = get_home_config_path();
        if home_path.exists() {
            return Ok(home_path);
        }

        let system_path = get_system_config_path();
        if system_path.exists() {
            return Ok(system_path);
        }

        Ok(home_path)
    }

    /// Load configuration from file.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Cannot read configuration file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Configuration file parsing failed: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            bail!("At least one backend is required");
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            let key = format!("{}:{}", backend.host, backend.control_port);
            if !seen.insert(key.clone()) {
                bail!("Duplicate backend (host, control_port): {}", key);
            }
        }

        if self.socks_port == 0 || self.dns_port == 0 || self.api_port == 0 {
            bail!("Listener ports must be in range 1-65535");
        }

        for backend in &self.backends {
            if backend.control_port == 0 || backend.socks_port == 0 {
                bail!(
                    "Invalid backend port for {}: control/socks ports must be nonzero",
                    backend.host
                );
            }
        }

        if self.perf.enabled && self.perf.latency_targets.is_empty() && self.perf.speed_target_url.is_none() {
            bail!("perf.enabled is true but no latency_targets or speed_target_url configured");
        }

        if let (Some(min), Some(max)) = (
            self.dns_cache.min_ttl_override_secs,
            self.dns_cache.max_ttl_override_secs,
        ) {
            if max < min {
                bail!(
                    "dns_cache.max_ttl_override_secs ({}) is less than min_ttl_override_secs ({})",
                    max,
                    min
                );
            }
        }

        Ok(())
    }

    /// Generate default configuration file template.
    pub fn default_template() -> String {
        r#"# torfleet configuration

# Common front-end listeners.
socks_bind: "127.0.0.1"
socks_port: 9050
dns_bind: "127.0.0.1"
dns_port: 9053
api_bind: "127.0.0.1"
api_port: 9095

# Load balancing strategy: "random" | "round-robin" | "least-connections"
method: "round-robin"

# Backend instances (one per locally running anonymity-network client).
backends:
  - host: "127.0.0.1"
    control_port: 9151
    socks_port: 9150
    dns_port: 9153
    cookie_path: "/home/user/.torfleet/backend-1/control_auth_cookie"
    data_dir: "/home/user/.torfleet/backend-1"
  - host: "127.0.0.1"
    control_port: 9251
    socks_port: 9250
    dns_port: 9253
    cookie_path: "/home/user/.torfleet/backend-2/control_auth_cookie"
    data_dir: "/home/user/.torfleet/backend-2"

dns_cache:
  enabled: true
  hard_cap: 20000

circuit:
  enabled: true
  max_age_secs: 600
  ip_diversity_enabled: true

log_level: "info"
"#
        .to_string()
    }

    /// Initialize default configuration file (create if not exists).
    pub async fn init_default_file() -> Result<std::path::PathBuf> {
        let path = get_home_config_path();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        if !path.exists() {
            fs::write(&path, Self::default_template())
                .await
                .with_context(|| {
                    format!("Failed to create default config file: {}", path.display())
                })?;
            log::info!("Default configuration file created: {}", path.display());
        }

        Ok(path)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration file (for the `check` command).
pub async fn validate_config_file(cli_path: Option<std::path::PathBuf>) -> Result<()> {
    let path = Config::resolve_config_path(cli_path.as_deref())?;

    log::info!("Validating configuration file: {}", path.display());

    let config = Config::load_from_file(&path).await?;

    log::info!("Configuration file syntax validation passed");
    log::info!("  - SOCKS listener: {}:{}", config.socks_bind, config.socks_port);
    log::info!("  - DNS listener: {}:{}", config.dns_bind, config.dns_port);
    log::info!("  - Load balancing method: {}", config.method);
    log::info!("  - Number of backends: {}", config.backends.len());

    log::info!("Checking backend control-port reachability...");
    let mut healthy_count = 0;
    let mut unhealthy_count = 0;

    for backend in &config.backends {
        match backend.check_connectivity().await {
            Ok(()) => {
                log::info!(
                    "  [OK] {}:{} - Connection successful",
                    backend.host,
                    backend.control_port
                );
                healthy_count += 1;
            }
            Err(e) => {
                log::warn!(
                    "  [FAIL] {}:{} - {}",
                    backend.host,
                    backend.control_port,
                    e
                );
                unhealthy_count += 1;
            }
        }
    }

    log::info!(
        "Validation complete: {} healthy, {} unhealthy",
        healthy_count,
        unhealthy_count
    );

    if healthy_count == 0 {
        bail!("Cannot reach any backend's control port. Please check your configuration.");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_backend(port: u16) -> BackendConfig {
        BackendConfig {
            host: "127.0.0.1".to_string(),
            control_port: port,
            socks_port: port + 1,
            dns_port: Some(port + 2),
            cookie_path: "/tmp/cookie".to_string(),
            data_dir: "/tmp/data".to_string(),
            max_connections: None,
        }
    }

    #[test]
    fn validate_rejects_empty_backend_list() {
        let config = Config::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_backends() {
        let mut config = Config::new();
        config.backends.push(sample_backend(9151));
        config.backends.push(sample_backend(9151));
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_distinct_backends() {
        let mut config = Config::new();
        config.backends.push(sample_backend(9151));
        config.backends.push(sample_backend(9251));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_perf_enabled_without_targets() {
        let mut config = Config::new();
        config.backends.push(sample_backend(9151));
        config.perf.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_ttl_overrides() {
        let mut config = Config::new();
        config.backends.push(sample_backend(9151));
        config.dns_cache.min_ttl_override_secs = Some(300);
        config.dns_cache.max_ttl_override_secs = Some(60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_template_parses_and_validates() {
        let template = Config::default_template();
        let config: Config = serde_yaml::from_str(&template).expect("template parses");
        config.validate().expect("template validates");
    }
}
