//! Application state module
//!
//! Centralizes shared runtime state. Uses arc-swap for lock-free config
//! reading and atomic hot-swapping, following the teacher's `state.rs`
//! nearly unchanged; the teacher's one `active_connections: RwLock<usize>`
//! scalar is replaced by per-backend atomics living on `BackendState`
//! itself, since this system needs per-backend (not just global)
//! connection accounting.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::{info, warn};

use crate::backend_pool::BackendPool;
use crate::circuit::RotationGate;
use crate::config::{BalanceMethod, CircuitConfig, Config, DnsCacheConfig, PerfConfig};
use crate::dns_cache::DnsCache;
use crate::load_balancer::LoadBalancer;
use crate::protection::ProtectionMode;

/// Snapshot of runtime parameters derived from `Config`, hot-swappable as
/// a whole. No field is mutated in place after publication.
#[derive(Clone)]
pub struct RuntimeConfig {
    pub socks_bind: String,
    pub socks_port: u16,
    pub dns_bind: String,
    pub dns_port: u16,
    pub api_bind: String,
    pub api_port: u16,
    pub method: BalanceMethod,
    pub max_total_connections: Option<u32>,
    pub socks_timeout_secs: u64,
    pub socks_accept_jitter_ms: u64,
    pub allow_private_destinations: bool,
    pub dns_timeout_secs: u64,
    pub dns_cache_config: DnsCacheConfig,
    pub health_check_interval_ms: u64,
    pub circuit_config: CircuitConfig,
    pub perf_config: PerfConfig,
    pub exit_ip_url: String,
    pub log_level: String,
    pub backend_pool: Arc<BackendPool>,
    pub config_path: PathBuf,
}

impl RuntimeConfig {
    pub fn from_config(config: Config, config_path: PathBuf) -> Self {
        let backend_pool = Arc::new(BackendPool::from_config(&config));

        Self {
            socks_bind: config.socks_bind,
            socks_port: config.socks_port,
            dns_bind: config.dns_bind,
            dns_port: config.dns_port,
            api_bind: config.api_bind,
            api_port: config.api_port,
            method: config.method,
            max_total_connections: config.max_total_connections,
            socks_timeout_secs: config.socks_timeout_secs,
            socks_accept_jitter_ms: config.socks_accept_jitter_ms,
            allow_private_destinations: config.allow_private_destinations,
            dns_timeout_secs: config.dns_timeout_secs,
            dns_cache_config: config.dns_cache,
            health_check_interval_ms: config.health_check_interval_ms,
            circuit_config: config.circuit,
            perf_config: config.perf,
            exit_ip_url: config.exit_ip_url,
            log_level: config.log_level,
            backend_pool,
            config_path,
        }
    }
}

/// Shared process state. Config and load balancer are hot-swapped
/// together via arc-swap so readers always see a matched pair.
pub struct AppState {
    config: ArcSwap<RuntimeConfig>,
    load_balancer: ArcSwap<LoadBalancer>,
    shutdown: tokio::sync::broadcast::Sender<()>,
    reload: tokio::sync::mpsc::Sender<()>,
    rotation_gate: Arc<RotationGate>,
    protection_mode: Arc<ProtectionMode>,
    dns_cache: ArcSwap<DnsCache>,
}

impl AppState {
    pub fn new(
        runtime_config: RuntimeConfig,
        shutdown: tokio::sync::broadcast::Sender<()>,
        reload: tokio::sync::mpsc::Sender<()>,
    ) -> Self {
        let load_balancer = LoadBalancer::new(
            runtime_config.method,
            Arc::clone(&runtime_config.backend_pool),
        );
        let dns_cache = DnsCache::new(runtime_config.dns_cache_config.clone());

        let protection_mode = Arc::new(ProtectionMode::new(
            DEFAULT_PROTECTION_THRESHOLD,
            DEFAULT_PROTECTION_WINDOW_MS,
            DEFAULT_PROTECTION_STABLE_RECOVERIES,
        ));

        Self {
            config: ArcSwap::new(Arc::new(runtime_config)),
            load_balancer: ArcSwap::new(Arc::new(load_balancer)),
            shutdown,
            reload,
            rotation_gate: Arc::new(RotationGate::default()),
            protection_mode,
            dns_cache: ArcSwap::new(Arc::new(dns_cache)),
        }
    }

    pub fn config(&self) -> Arc<RuntimeConfig> {
        self.config.load().clone()
    }

    /// Atomically replaces the config snapshot, load balancer, and DNS
    /// cache. Existing connections are unaffected; a port change only
    /// takes effect on next restart.
    pub fn swap_config(&self, new_config: RuntimeConfig) {
        let old_socks_port = self.config.load().socks_port;
        let new_socks_port = new_config.socks_port;

        let new_lb = LoadBalancer::new(new_config.method, Arc::clone(&new_config.backend_pool));
        let new_cache = DnsCache::new(new_config.dns_cache_config.clone());

        self.config.store(Arc::new(new_config));
        self.load_balancer.store(Arc::new(new_lb));
        self.dns_cache.store(Arc::new(new_cache));

        info!("Configuration swapped without downtime");

        if old_socks_port != new_socks_port {
            warn!(
                "SOCKS port change detected ({} -> {}). New port applies on next restart.",
                old_socks_port, new_socks_port
            );
        }
    }

    pub fn subscribe_shutdown(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub async fn trigger_reload(&self) -> anyhow::Result<()> {
        self.reload
            .send(())
            .await
            .map_err(|_| anyhow::anyhow!("Reload channel closed"))?;
        Ok(())
    }

    pub fn reload_sender(&self) -> &tokio::sync::mpsc::Sender<()> {
        &self.reload
    }

    pub fn backend_pool(&self) -> Arc<BackendPool> {
        Arc::clone(&self.config.load().backend_pool)
    }

    pub fn load_balancer(&self) -> Arc<LoadBalancer> {
        self.load_balancer.load().clone()
    }

    pub fn dns_cache(&self) -> Arc<DnsCache> {
        self.dns_cache.load().clone()
    }

    pub fn rotation_gate(&self) -> Arc<RotationGate> {
        Arc::clone(&self.rotation_gate)
    }

    pub fn protection_mode(&self) -> Arc<ProtectionMode> {
        Arc::clone(&self.protection_mode)
    }

    pub fn socks_port(&self) -> u16 {
        self.config.load().socks_port
    }

    pub fn method(&self) -> BalanceMethod {
        self.config.load().method
    }
}

const DEFAULT_PROTECTION_THRESHOLD: u32 = 5;
const DEFAULT_PROTECTION_WINDOW_MS: u64 = 30_000;
const DEFAULT_PROTECTION_STABLE_RECOVERIES: u32 = 3;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use std::path::PathBuf;
    use tokio::sync::{broadcast, mpsc};

    fn runtime_config_with_ports(ports: &[u16]) -> RuntimeConfig {
        let mut config = Config::new();
        for &port in ports {
            config.backends.push(BackendConfig {
                host: "127.0.0.1".to_string(),
                control_port: port,
                socks_port: port + 1,
                dns_port: Some(port + 2),
                cookie_path: "/tmp/cookie".to_string(),
                data_dir: "/tmp".to_string(),
                max_connections: None,
            });
        }
        let runtime = RuntimeConfig::from_config(config, PathBuf::from("/tmp/test-config.yaml"));
        for backend in runtime.backend_pool.all_backends() {
            backend.set_healthy(true);
        }
        runtime
    }

    #[test]
    fn swap_config_updates_load_balancer_backend_pool() {
        let (shutdown_tx, _) = broadcast::channel(4);
        let (reload_tx, _reload_rx) = mpsc::channel(4);

        let state = AppState::new(
            runtime_config_with_ports(&[9151, 9251]),
            shutdown_tx,
            reload_tx,
        );

        let initial = state
            .load_balancer()
            .select_backend()
            .expect("initial backend should exist");
        assert!(initial.config.control_port == 9151 || initial.config.control_port == 9251);

        state.swap_config(runtime_config_with_ports(&[9351]));

        let after = state
            .load_balancer()
            .select_backend()
            .expect("backend should exist after swap");
        assert_eq!(after.config.control_port, 9351);
    }

    #[test]
    fn rotation_gate_is_shared_and_exclusive() {
        let (shutdown_tx, _) = broadcast::channel(4);
        let (reload_tx, _reload_rx) = mpsc::channel(4);
        let state = AppState::new(runtime_config_with_ports(&[9151]), shutdown_tx, reload_tx);

        let gate = state.rotation_gate();
        assert!(gate.try_acquire());
        assert!(!state.rotation_gate().try_acquire());
    }
}
