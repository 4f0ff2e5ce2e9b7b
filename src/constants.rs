//! Constants definition module
//!
//! Centralizes constants used throughout the application.
//! This improves maintainability by requiring changes in only one place.

use std::path::PathBuf;

/// Application basic settings
pub const APP_NAME: &str = "torfleet";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default common-listener ports.
pub const DEFAULT_SOCKS_PORT: u16 = 9050;
pub const DEFAULT_DNS_PORT: u16 = 9053;
pub const DEFAULT_API_PORT: u16 = 9095;

/// Default per-backend DNS port when a backend config omits one.
pub const DEFAULT_BACKEND_DNS_PORT: u16 = 53;

/// Health check settings.
///
/// The bootstrap-phase control probe is authoritative (see DESIGN.md's Open
/// Question decision); the TCP gate below is a cheap pre-check so a backend
/// that's merely still bootstrapping doesn't pay a full control round-trip
/// on every tick.
pub const HEALTH_CHECK_INTERVAL_MS: u64 = 5_000;
pub const HEALTH_CHECK_TCP_GATE_TIMEOUT_MS: u64 = 500;
pub const HEALTH_CHECK_BOOTSTRAP_TIMEOUT_SECS: u64 = 7;

/// Control channel settings.
pub const CONTROL_READ_TIMEOUT_SECS: u64 = 10;
pub const CONTROL_READ_TIMEOUT_INTROSPECTION_SECS: u64 = 20;
pub const CONTROL_SUCCESS_LINE: &str = "250 OK";
pub const CONTROL_AUTH_REJECTED_PREFIX: &str = "515";
pub const CONTROL_EVENT_PREFIX: &str = "650 ";
pub const NEWNYM_COMMAND: &str = "SIGNAL NEWNYM";

/// SOCKS front listener settings.
pub const SOCKS_TIMEOUT_SECS: u64 = 10;
pub const SOCKS_IDLE_TIMEOUT_SECS: u64 = 15 * 60;
pub const SOCKS_BACKEND_SELECT_RETRIES: u32 = 5;
pub const SOCKS_BACKEND_SELECT_BACKOFF_MS: u64 = 100;
pub const SPLICE_BUFFER_SIZE: usize = 64 * 1024;

/// DNS proxy settings.
pub const DNS_TIMEOUT_SECS: u64 = 5;
pub const DNS_CACHE_HARD_CAP: usize = 20_000;
pub const DNS_CACHE_EVICTION_FRACTION: usize = 4;
pub const DNS_CACHE_SWEEP_INTERVAL_SECS: u64 = 30;

/// Circuit manager settings.
pub const CIRCUIT_MAX_AGE_SECS: u64 = 10 * 60;
pub const CIRCUIT_ROTATION_STAGGER_SECS: u64 = 5;
pub const GRACEFUL_ROTATION_TIMEOUT_SECS: u64 = 30;
pub const IP_DIVERSITY_CHECK_INTERVAL_SECS: u64 = 5 * 60;
pub const IP_DIVERSITY_ROTATION_COOLDOWN_SECS: u64 = 10 * 60;
pub const IP_DIVERSITY_MIN_BACKENDS: usize = 2;
pub const CIRCUIT_MANAGER_MIN_TICK_SECS: u64 = 60;

/// IP diversity prefix lengths (see DESIGN.md's Open Question decision).
pub const IPV4_DIVERSITY_PREFIX_BITS: u8 = 24;
pub const IPV6_DIVERSITY_PREFIX_BITS: u8 = 48;

/// Performance metrics settings.
pub const PERF_TEST_INTERVAL_SECS: u64 = 5 * 60;
pub const PERF_METRIC_STALE_FACTOR: f64 = 1.5;
pub const PERF_SPEED_TEST_DEFAULT_BYTES: u64 = 1_000_000;

/// Graceful shutdown settings.
///
/// Maximum time to wait for existing connections/tasks to complete.
/// Forces shutdown after this time to prevent infinite waits.
pub const GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
pub const API_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// File and directory settings.
pub const PID_FILENAME: &str = "torfleet.pid";
pub const LOG_FILENAME: &str = "torfleet.log";
pub const CONFIG_FILENAME: &str = "config.yaml";
pub const PROTECTION_STATE_FILENAME: &str = "protection_state.json";

/// Configuration file priority (higher = more priority)
/// 1. Path specified via CLI argument
/// 2. $HOME/.torfleet/config.yaml
/// 3. /etc/torfleet/config.yaml
pub fn get_home_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".torfleet").join(CONFIG_FILENAME))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILENAME))
}

pub fn get_system_config_path() -> PathBuf {
    PathBuf::from("/etc/torfleet").join(CONFIG_FILENAME)
}

/// PID file path ($HOME/.torfleet/torfleet.pid)
pub fn get_pid_file_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".torfleet").join(PID_FILENAME))
        .unwrap_or_else(|| PathBuf::from(PID_FILENAME))
}

/// Log file path ($HOME/.torfleet/torfleet.log)
pub fn get_log_file_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".torfleet").join(LOG_FILENAME))
        .unwrap_or_else(|| PathBuf::from(LOG_FILENAME))
}

/// Runtime directory path ($HOME/.torfleet/)
pub fn get_runtime_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".torfleet"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Protection-mode snapshot file path ($HOME/.torfleet/protection_state.json)
pub fn get_protection_state_path() -> PathBuf {
    get_runtime_dir().join(PROTECTION_STATE_FILENAME)
}
