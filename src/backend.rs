//! Backend instance module
//!
//! One `BackendState` per configured backend. Owns the authenticated
//! control-channel connection, health/traffic/circuit bookkeeping, and the
//! per-instance HTTP client used for exit-IP and performance probes. This is
//! the sole mutator of per-backend state; every other component reads
//! through its methods.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::BackendConfig;
use crate::constants::{
    CONTROL_AUTH_REJECTED_PREFIX, CONTROL_EVENT_PREFIX, CONTROL_READ_TIMEOUT_INTROSPECTION_SECS,
    CONTROL_READ_TIMEOUT_SECS, CONTROL_SUCCESS_LINE, DEFAULT_BACKEND_DNS_PORT,
    HEALTH_CHECK_BOOTSTRAP_TIMEOUT_SECS, NEWNYM_COMMAND, PERF_METRIC_STALE_FACTOR,
    SOCKS_TIMEOUT_SECS,
};

/// Which live endpoint a management-API port change targets (spec §6's
/// "set SOCKS/DNS/control port" action).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Control,
    Socks,
    Dns,
}

impl PortKind {
    fn conf_name(self) -> &'static str {
        match self {
            PortKind::Control => "ControlPort",
            PortKind::Socks => "SocksPort",
            PortKind::Dns => "DNSPort",
        }
    }
}

/// Behavioral classification of a control-channel failure, used by
/// `protection.rs`'s storm detector to decide whether a failure counts
/// toward the timeout/refused window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    Timeout,
    ConnectionRefused,
    Io,
    AuthRejected,
    CommandRejected,
    Protocol,
}

/// Control-channel connection state machine (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Disconnected,
    Authenticating,
    Ready,
    Broken,
}

/// Recognized node-policy kinds settable via `SETCONF`/`RESETCONF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodePolicyKind {
    ExitNodes,
    EntryNodes,
    ExcludeNodes,
}

impl NodePolicyKind {
    fn conf_name(self) -> &'static str {
        match self {
            NodePolicyKind::ExitNodes => "ExitNodes",
            NodePolicyKind::EntryNodes => "EntryNodes",
            NodePolicyKind::ExcludeNodes => "ExcludeNodes",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExternalIpInfo {
    pub ip: String,
    pub observed_at_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PerfMetric {
    pub last_latency_ms: Option<u64>,
    pub last_speed_kbps: Option<f64>,
    pub last_test_at_ms: u64,
    pub consecutive_failures: u32,
}

impl PerfMetric {
    pub fn is_stale(&self, probe_interval_secs: u64) -> bool {
        let max_age_ms = (probe_interval_secs as f64 * PERF_METRIC_STALE_FACTOR * 1000.0) as u64;
        now_unix_ms().saturating_sub(self.last_test_at_ms) > max_age_ms
    }
}

/// Live control-channel connection plus cached auth state.
struct ControlConn {
    state: ControlState,
    stream: Option<TcpStream>,
    cookie: Option<Vec<u8>>,
}

impl ControlConn {
    fn new() -> Self {
        Self {
            state: ControlState::Disconnected,
            stream: None,
            cookie: None,
        }
    }

    fn discard(&mut self) {
        self.stream = None;
        self.state = ControlState::Disconnected;
    }
}

/// Runtime state for one backend instance.
pub struct BackendState {
    pub id: u32,
    pub config: BackendConfig,

    healthy: AtomicBool,
    last_check_ms: AtomicU64,
    consecutive_failures: AtomicU32,

    active_connections: AtomicUsize,
    served_since_rotation: AtomicU64,
    draining: AtomicBool,

    // Live endpoint ports, independently reconfigurable via the management
    // API's `SETCONF`-backed "set port" action (spec §6). `live_dns_port ==
    // 0` means "fall back to the configured/default DNS port".
    live_control_port: AtomicU32,
    live_socks_port: AtomicU32,
    live_dns_port: AtomicU32,

    last_circuit_recreation_ms: AtomicU64,
    last_diversity_rotate_ms: AtomicU64,

    external_ip: StdMutex<Option<ExternalIpInfo>>,
    metrics: StdMutex<HashMap<String, PerfMetric>>,
    node_policies: StdMutex<HashMap<NodePolicyKind, String>>,

    control: AsyncMutex<ControlConn>,
    http_client: StdMutex<Option<reqwest::Client>>,
}

impl BackendState {
    pub fn new(id: u32, config: BackendConfig) -> Self {
        Self {
            id,
            config,
            // Considered unhealthy until the first bootstrap probe succeeds.
            healthy: AtomicBool::new(false),
            last_check_ms: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            active_connections: AtomicUsize::new(0),
            served_since_rotation: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            live_control_port: AtomicU32::new(config.control_port as u32),
            live_socks_port: AtomicU32::new(config.socks_port as u32),
            live_dns_port: AtomicU32::new(config.dns_port.map(|p| p as u32).unwrap_or(0)),
            last_circuit_recreation_ms: AtomicU64::new(0),
            last_diversity_rotate_ms: AtomicU64::new(0),
            external_ip: StdMutex::new(None),
            metrics: StdMutex::new(HashMap::new()),
            node_policies: StdMutex::new(HashMap::new()),
            control: AsyncMutex::new(ControlConn::new()),
            http_client: StdMutex::new(None),
        }
    }

    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        let previous = self.healthy.swap(healthy, Ordering::Relaxed);
        self.last_check_ms.store(now_unix_ms(), Ordering::Relaxed);
        if previous != healthy {
            log::info!(
                "backend {} health transition: {} -> {}",
                self.id,
                previous,
                healthy
            );
        }
        if healthy {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn increment_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.served_since_rotation.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_connections(&self) {
        let prev = self.active_connections.fetch_sub(1, Ordering::Relaxed);
        if prev == 0 {
            self.active_connections.store(0, Ordering::Relaxed);
        }
    }

    /// Live control address, honoring any port reconfigured via the
    /// management API since startup.
    pub fn control_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!(
            "{}:{}",
            self.config.host,
            self.live_control_port.load(Ordering::Relaxed)
        );
        addr_str
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid control address: {}", addr_str))
    }

    pub fn socks_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!(
            "{}:{}",
            self.config.host,
            self.live_socks_port.load(Ordering::Relaxed)
        );
        addr_str
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid SOCKS address: {}", addr_str))
    }

    pub fn dns_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.config.host, self.current_dns_port());
        addr_str
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid DNS address: {}", addr_str))
    }

    pub fn current_control_port(&self) -> u16 {
        self.live_control_port.load(Ordering::Relaxed) as u16
    }

    pub fn current_socks_port(&self) -> u16 {
        self.live_socks_port.load(Ordering::Relaxed) as u16
    }

    pub fn current_dns_port(&self) -> u16 {
        let raw = self.live_dns_port.load(Ordering::Relaxed);
        if raw == 0 {
            DEFAULT_BACKEND_DNS_PORT
        } else {
            raw as u16
        }
    }

    /// Reconfigures one of this backend's live endpoints via `SETCONF`. On
    /// success the cached endpoint is updated; changing the control port
    /// also drops the active control connection (spec §6), forcing
    /// re-authentication at the new port on the next command. Changing the
    /// SOCKS port invalidates the cached per-instance HTTP client.
    pub async fn set_port(&self, kind: PortKind, new_port: u16) -> Result<()> {
        let command = format!("SETCONF {}={}", kind.conf_name(), new_port);
        self.send_control(&command, false).await?;

        match kind {
            PortKind::Control => {
                self.live_control_port
                    .store(new_port as u32, Ordering::Relaxed);
                self.reset_control_connection().await;
            }
            PortKind::Socks => {
                self.live_socks_port
                    .store(new_port as u32, Ordering::Relaxed);
                self.invalidate_http_client();
            }
            PortKind::Dns => {
                self.live_dns_port
                    .store(new_port as u32, Ordering::Relaxed);
            }
        }

        Ok(())
    }

    /// Discards the live control connection so the next command
    /// reauthenticates, used after a control-port change.
    pub async fn reset_control_connection(&self) {
        let mut conn = self.control.lock().await;
        conn.discard();
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::Relaxed);
    }

    pub fn last_circuit_recreation_ms(&self) -> u64 {
        self.last_circuit_recreation_ms.load(Ordering::Relaxed)
    }

    pub fn last_diversity_rotate_ms(&self) -> u64 {
        self.last_diversity_rotate_ms.load(Ordering::Relaxed)
    }

    pub fn set_last_diversity_rotate_now(&self) {
        self.last_diversity_rotate_ms
            .store(now_unix_ms(), Ordering::Relaxed);
    }

    /// Backdates the rotation timestamps for rotation-candidate-selection
    /// tests, which need to simulate backends rotated at specific times
    /// without driving a real control-channel round-trip.
    #[cfg(test)]
    pub fn set_last_circuit_recreation_ms_for_test(&self, ms: u64) {
        self.last_circuit_recreation_ms.store(ms, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn set_last_diversity_rotate_ms_for_test(&self, ms: u64) {
        self.last_diversity_rotate_ms.store(ms, Ordering::Relaxed);
    }

    pub fn set_external_ip(&self, ip: String) {
        let mut guard = self.external_ip.lock().unwrap();
        *guard = Some(ExternalIpInfo {
            ip,
            observed_at_ms: now_unix_ms(),
        });
    }

    pub fn clear_external_ip(&self) {
        let mut guard = self.external_ip.lock().unwrap();
        *guard = None;
    }

    pub fn get_external_ip_info(&self) -> Option<ExternalIpInfo> {
        self.external_ip.lock().unwrap().clone()
    }

    pub fn update_perf_metric(
        &self,
        alias: &str,
        latency_ms: Option<u64>,
        speed_kbps: Option<f64>,
        failed: bool,
    ) {
        let mut metrics = self.metrics.lock().unwrap();
        let entry = metrics.entry(alias.to_string()).or_default();
        entry.last_test_at_ms = now_unix_ms();
        if failed {
            entry.consecutive_failures += 1;
        } else {
            entry.consecutive_failures = 0;
            if latency_ms.is_some() {
                entry.last_latency_ms = latency_ms;
            }
            if speed_kbps.is_some() {
                entry.last_speed_kbps = speed_kbps;
            }
        }
    }

    pub fn get_perf_metrics(&self) -> HashMap<String, PerfMetric> {
        self.metrics.lock().unwrap().clone()
    }

    pub fn get_node_policies(&self) -> HashMap<NodePolicyKind, String> {
        self.node_policies.lock().unwrap().clone()
    }

    fn store_node_policy(&self, kind: NodePolicyKind, value: &str) {
        let mut policies = self.node_policies.lock().unwrap();
        if value.is_empty() {
            policies.remove(&kind);
        } else {
            policies.insert(kind, value.to_string());
        }
    }

    /// Apply a node-policy change via `SETCONF`/`RESETCONF`; an empty value
    /// resets the policy.
    pub async fn set_node_policy(&self, kind: NodePolicyKind, value: &str) -> Result<()> {
        let command = if value.is_empty() {
            format!("RESETCONF {}", kind.conf_name())
        } else {
            format!("SETCONF {}={}", kind.conf_name(), value)
        };

        self.send_control(&command, false).await?;
        self.store_node_policy(kind, value);
        Ok(())
    }

    /// Returns a cached HTTP client routed through this backend's SOCKS
    /// endpoint, rebuilding it on first use or after a port change.
    pub fn get_http_client(&self) -> Result<reqwest::Client> {
        let mut guard = self.http_client.lock().unwrap();
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        let proxy_url = format!("socks5://{}:{}", self.config.host, self.current_socks_port());
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(&proxy_url).context("Invalid SOCKS proxy URL")?)
            .timeout(Duration::from_secs(SOCKS_TIMEOUT_SECS))
            .build()
            .context("Failed to build per-backend HTTP client")?;

        *guard = Some(client.clone());
        Ok(client)
    }

    /// Invalidates the cached HTTP client, forcing a rebuild on next use.
    /// Called when the backend's SOCKS port is reconfigured.
    pub fn invalidate_http_client(&self) {
        let mut guard = self.http_client.lock().unwrap();
        *guard = None;
    }

    /// Sends a bootstrap-phase introspection probe and reports healthy iff
    /// the response carries both `PROGRESS=100` and `TAG=done`.
    pub async fn check_health(&self, deadline: Duration) -> bool {
        let probe = tokio::time::timeout(
            deadline.min(Duration::from_secs(HEALTH_CHECK_BOOTSTRAP_TIMEOUT_SECS)),
            self.send_control("GETINFO status/bootstrap-phase", false),
        )
        .await;

        let healthy = match probe {
            Ok(Ok(response)) => response.contains("PROGRESS=100") && response.contains("TAG=done"),
            _ => false,
        };

        self.set_healthy(healthy);
        healthy
    }

    /// Sends a line-oriented control command, authenticating (and
    /// reconnecting, once) as needed. See spec §4.1 for the exact framing
    /// rules this implements.
    pub async fn send_control(&self, command: &str, update_circuit_time: bool) -> Result<String> {
        let mut conn = self.control.lock().await;
        match self.send_control_locked(&mut conn, command).await {
            Ok(response) => {
                if update_circuit_time
                    && command.trim() == NEWNYM_COMMAND
                    && response.starts_with(CONTROL_SUCCESS_LINE)
                {
                    self.last_circuit_recreation_ms
                        .store(now_unix_ms(), Ordering::Relaxed);
                }
                Ok(response)
            }
            Err(first_err) => {
                conn.discard();
                self.send_control_locked(&mut conn, command)
                    .await
                    .map_err(|_| first_err)
            }
        }
    }

    async fn send_control_locked(&self, conn: &mut ControlConn, command: &str) -> Result<String> {
        self.ensure_authenticated(conn).await?;

        let addr = self.control_addr()?;
        let stream = conn
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("control connection not open after authentication"))?;

        let write_deadline = Duration::from_secs(SOCKS_TIMEOUT_SECS);
        tokio::time::timeout(write_deadline, async {
            stream.write_all(command.as_bytes()).await?;
            stream.write_all(b"\r\n").await
        })
        .await
        .map_err(|_| anyhow!("control write timeout to {}", addr))?
        .map_err(|e| {
            conn.discard();
            anyhow!("control write failed to {}: {}", addr, e)
        })?;

        let multiline = command.starts_with("GETINFO") || command.starts_with("GETCONF");
        let read_timeout = if multiline {
            Duration::from_secs(CONTROL_READ_TIMEOUT_INTROSPECTION_SECS)
        } else {
            Duration::from_secs(CONTROL_READ_TIMEOUT_SECS)
        };

        let stream = conn.stream.as_mut().unwrap();
        let mut reader = BufReader::new(stream);
        let mut collected = String::new();

        let result = tokio::time::timeout(read_timeout, async {
            loop {
                let mut line = String::new();
                let n = reader.read_line(&mut line).await?;
                if n == 0 {
                    bail!("control connection closed by {}", addr);
                }
                let trimmed = line.trim_end_matches(['\r', '\n']);

                if trimmed.starts_with(CONTROL_EVENT_PREFIX) {
                    continue;
                }

                let is_error = trimmed
                    .as_bytes()
                    .first()
                    .map(|b| *b == b'4' || *b == b'5')
                    .unwrap_or(false);

                collected.push_str(trimmed);
                collected.push('\n');

                if is_error {
                    return Ok(collected);
                }
                if multiline {
                    if trimmed.starts_with(CONTROL_SUCCESS_LINE) {
                        return Ok(collected);
                    }
                } else if trimmed.starts_with("250 ") && !trimmed.starts_with("250-") {
                    return Ok(collected);
                }
            }
        })
        .await
        .map_err(|_| anyhow!("control read timeout from {}", addr))?;

        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                conn.discard();
                Err(e)
            }
        }
    }

    async fn ensure_authenticated(&self, conn: &mut ControlConn) -> Result<()> {
        if conn.state == ControlState::Ready && conn.stream.is_some() {
            return Ok(());
        }

        conn.state = ControlState::Authenticating;
        let addr = self.control_addr()?;
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("Failed to connect to control port {}", addr))?;
        conn.stream = Some(stream);

        if conn.cookie.is_none() {
            let raw = tokio::fs::read(&self.config.cookie_path)
                .await
                .with_context(|| format!("Failed to read cookie file {}", self.config.cookie_path))?;
            conn.cookie = Some(raw);
        }
        let hex_cookie = hex::encode(conn.cookie.as_ref().unwrap());

        let write_deadline = Duration::from_secs(SOCKS_TIMEOUT_SECS);
        let auth_line = format!("AUTHENTICATE {}\r\n", hex_cookie);
        let stream = conn.stream.as_mut().unwrap();
        tokio::time::timeout(write_deadline, stream.write_all(auth_line.as_bytes()))
            .await
            .map_err(|_| anyhow!("control auth write timeout to {}", addr))?
            .with_context(|| format!("Failed to write AUTHENTICATE to {}", addr))?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        tokio::time::timeout(
            Duration::from_secs(CONTROL_READ_TIMEOUT_SECS),
            reader.read_line(&mut line),
        )
        .await
        .map_err(|_| anyhow!("control auth read timeout from {}", addr))?
        .with_context(|| format!("Failed to read AUTHENTICATE response from {}", addr))?;

        let trimmed = line.trim_end();
        if trimmed.starts_with(CONTROL_SUCCESS_LINE) {
            conn.state = ControlState::Ready;
            Ok(())
        } else if trimmed.starts_with(CONTROL_AUTH_REJECTED_PREFIX) {
            // Invalidate the cached cookie; caller's single retry will reread it.
            conn.cookie = None;
            conn.discard();
            bail!("control authentication rejected ({}): {}", addr, trimmed);
        } else {
            conn.discard();
            bail!("unexpected control auth response from {}: {}", addr, trimmed);
        }
    }

    /// Issues the circuit-renewal signal and, on success, resets this
    /// instance's cached external IP (the old exit-IP no longer applies).
    pub async fn renew_circuit(&self) -> Result<()> {
        self.send_control(NEWNYM_COMMAND, true).await?;
        self.clear_external_ip();
        Ok(())
    }

    pub fn control_socket_addr(&self) -> Result<SocketAddr> {
        self.control_addr()
    }
}

/// RAII connection-count guard: increments on acquire, decrements on drop.
pub struct ConnectionGuard<'a> {
    backend: &'a BackendState,
}

impl<'a> ConnectionGuard<'a> {
    pub fn acquire(backend: &'a BackendState) -> Self {
        backend.increment_connections();
        Self { backend }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.backend.decrement_connections();
    }
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config(port: u16) -> BackendConfig {
        BackendConfig {
            host: "127.0.0.1".to_string(),
            control_port: port,
            socks_port: port + 1,
            dns_port: Some(port + 2),
            cookie_path: "/tmp/does-not-exist-cookie".to_string(),
            data_dir: "/tmp".to_string(),
            max_connections: None,
        }
    }

    #[test]
    fn starts_unhealthy_until_first_probe() {
        let backend = BackendState::new(1, sample_config(9151));
        assert!(!backend.is_healthy());
    }

    #[test]
    fn connection_counter_tracks_nested_guards() {
        let backend = BackendState::new(1, sample_config(9151));
        {
            let _g1 = ConnectionGuard::acquire(&backend);
            assert_eq!(backend.active_connections(), 1);
            {
                let _g2 = ConnectionGuard::acquire(&backend);
                assert_eq!(backend.active_connections(), 2);
            }
            assert_eq!(backend.active_connections(), 1);
        }
        assert_eq!(backend.active_connections(), 0);
    }

    #[test]
    fn health_transition_resets_or_increments_failure_counter() {
        let backend = BackendState::new(1, sample_config(9151));
        backend.set_healthy(false);
        backend.set_healthy(false);
        assert_eq!(backend.consecutive_failures(), 2);
        backend.set_healthy(true);
        assert_eq!(backend.consecutive_failures(), 0);
    }

    #[test]
    fn node_policy_round_trips_through_store() {
        let backend = BackendState::new(1, sample_config(9151));
        backend.store_node_policy(NodePolicyKind::ExitNodes, "{us},{gb}");
        assert_eq!(
            backend.get_node_policies().get(&NodePolicyKind::ExitNodes),
            Some(&"{us},{gb}".to_string())
        );
        backend.store_node_policy(NodePolicyKind::ExitNodes, "");
        assert!(backend
            .get_node_policies()
            .get(&NodePolicyKind::ExitNodes)
            .is_none());
    }

    #[test]
    fn perf_metric_staleness_follows_probe_interval() {
        let mut metric = PerfMetric::default();
        metric.last_test_at_ms = now_unix_ms();
        assert!(!metric.is_stale(300));

        metric.last_test_at_ms = 0;
        assert!(metric.is_stale(300));
    }

    #[test]
    fn draining_flag_toggles() {
        let backend = BackendState::new(1, sample_config(9151));
        assert!(!backend.is_draining());
        backend.set_draining(true);
        assert!(backend.is_draining());
    }
}
