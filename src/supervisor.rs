//! Supervisor module
//!
//! Manages the whole-process lifecycle: signal handling, graceful shutdown,
//! configuration reload, and spawning/joining every background task this
//! process runs (SOCKS front, DNS proxy, health monitor, circuit manager,
//! metrics loop, DNS-cache eviction sweep, management API).

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use crate::api::{self, ApiState};
use crate::circuit::CircuitManager;
use crate::config_store::ConfigStore;
use crate::constants::{API_SHUTDOWN_TIMEOUT_SECS, DNS_CACHE_SWEEP_INTERVAL_SECS, GRACEFUL_SHUTDOWN_TIMEOUT_SECS};
use crate::dns::DnsProxy;
use crate::health::HealthMonitor;
use crate::metrics::MetricsLoop;
use crate::process::PidFileGuard;
use crate::socks::{SocksConfig, SocksServer};
use crate::state::AppState;

/// Supervisor
///
/// Owns daemon/foreground process startup, signal handling, and task
/// orchestration. `run_daemon` additionally holds the PID-file guard.
pub struct Supervisor;

/// Handles to every background task this process runs, so shutdown can
/// join them in one place.
struct TaskHandles {
    socks: tokio::task::JoinHandle<()>,
    dns: tokio::task::JoinHandle<()>,
    health: tokio::task::JoinHandle<()>,
    circuit: tokio::task::JoinHandle<()>,
    metrics: tokio::task::JoinHandle<()>,
    cache_sweep: tokio::task::JoinHandle<()>,
    api: tokio::task::JoinHandle<()>,
}

impl Supervisor {
    /// Run as a background daemon. Creates the PID file (refusing to start
    /// if one already exists and the process is alive), then delegates to
    /// the shared main loop.
    pub async fn run_daemon(cli_config_path: Option<&Path>) -> Result<()> {
        let _pid_guard = PidFileGuard::new()
            .context("Failed to create PID file - check if already running")?;

        info!("torfleet daemon starting (PID: {})", std::process::id());
        Self::main_loop(cli_config_path).await?;
        info!("torfleet daemon shutdown complete");
        Ok(())
    }

    /// Run in the foreground (no PID file, no fork). Used for interactive
    /// use and for tests that want a live process without daemonizing.
    pub async fn run_foreground(cli_config_path: Option<&Path>) -> Result<()> {
        info!("torfleet starting in foreground (PID: {})", std::process::id());
        Self::main_loop(cli_config_path).await?;
        info!("torfleet shutdown complete");
        Ok(())
    }

    async fn main_loop(cli_config_path: Option<&Path>) -> Result<()> {
        let (runtime_config, config_path) = ConfigStore::load_initial_config(cli_config_path).await?;

        info!("Configuration loaded: {}", config_path.display());
        info!(
            "  - SOCKS listener: {}:{}",
            runtime_config.socks_bind, runtime_config.socks_port
        );
        info!(
            "  - DNS listener: {}:{}",
            runtime_config.dns_bind, runtime_config.dns_port
        );
        info!(
            "  - Management API: {}:{}",
            runtime_config.api_bind, runtime_config.api_port
        );
        info!("  - Load balancing: {}", runtime_config.method);
        info!("  - Backends: {}", runtime_config.backend_pool.total_count());

        let (shutdown_tx, _) = broadcast::channel(16);
        let (reload_tx, mut reload_rx) = mpsc::channel(4);

        let state = Arc::new(AppState::new(runtime_config, shutdown_tx, reload_tx));

        let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("Failed to register SIGHUP handler")?;

        info!("Signal handlers registered (SIGTERM, SIGINT, SIGHUP)");

        let handles = Self::spawn_tasks(&state)?;

        info!("All service tasks started");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received - starting graceful shutdown");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received - starting graceful shutdown");
                    break;
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received - reloading configuration");
                    if let Err(e) = ConfigStore::reload_config(&state, None).await {
                        error!("Configuration reload failed: {}", e);
                    }
                }
                Some(()) = reload_rx.recv() => {
                    info!("Reload request received");
                    if let Err(e) = ConfigStore::reload_config(&state, None).await {
                        error!("Configuration reload failed: {}", e);
                    }
                }
            }
        }

        info!("Starting graceful shutdown...");
        Self::graceful_shutdown(state, handles).await
    }

    /// Constructs and spawns every background task against a freshly built
    /// `AppState`. All tasks subscribe to the same shutdown broadcast.
    fn spawn_tasks(state: &Arc<AppState>) -> Result<TaskHandles> {
        let config = state.config();

        let socks_bind: SocketAddr = format!("{}:{}", config.socks_bind, config.socks_port)
            .parse()
            .with_context(|| format!("Invalid SOCKS bind address {}:{}", config.socks_bind, config.socks_port))?;
        let dns_bind: SocketAddr = format!("{}:{}", config.dns_bind, config.dns_port)
            .parse()
            .with_context(|| format!("Invalid DNS bind address {}:{}", config.dns_bind, config.dns_port))?;
        let api_bind: SocketAddr = format!("{}:{}", config.api_bind, config.api_port)
            .parse()
            .with_context(|| format!("Invalid API bind address {}:{}", config.api_bind, config.api_port))?;

        let socks_config = SocksConfig {
            bind_addr: socks_bind,
            connect_timeout: Duration::from_secs(config.socks_timeout_secs),
            idle_timeout: Duration::from_secs(crate::constants::SOCKS_IDLE_TIMEOUT_SECS),
            select_retries: crate::constants::SOCKS_BACKEND_SELECT_RETRIES,
            select_backoff: Duration::from_millis(crate::constants::SOCKS_BACKEND_SELECT_BACKOFF_MS),
            accept_jitter: Duration::from_millis(config.socks_accept_jitter_ms),
            allow_private_destinations: config.allow_private_destinations,
            max_total_connections: config.max_total_connections,
            splice_buffer_size: crate::constants::SPLICE_BUFFER_SIZE,
        };

        let socks_server = Arc::new(SocksServer::new(
            socks_config,
            state.load_balancer(),
            state.protection_mode(),
        ));
        let socks_shutdown = state.subscribe_shutdown();
        let socks_handle = tokio::spawn(async move {
            if let Err(e) = socks_server.run(socks_shutdown).await {
                error!("SOCKS front listener error: {}", e);
            }
        });

        let dns_proxy = DnsProxy::new(
            dns_bind,
            state.dns_cache(),
            state.load_balancer(),
            Duration::from_secs(config.dns_timeout_secs),
        );
        let dns_shutdown = state.subscribe_shutdown();
        let dns_handle = tokio::spawn(async move {
            if let Err(e) = dns_proxy.run(dns_shutdown).await {
                error!("DNS proxy error: {}", e);
            }
        });

        let health_monitor = HealthMonitor::new(state.backend_pool());
        let health_shutdown = state.subscribe_shutdown();
        let health_handle = tokio::spawn(async move {
            if let Err(e) = health_monitor.run(health_shutdown).await {
                error!("Health monitor error: {}", e);
            }
        });

        let circuit_manager = Arc::new(CircuitManager::new(
            state.backend_pool(),
            config.circuit_config.clone(),
            state.rotation_gate(),
            config.exit_ip_url.clone(),
        ));
        let circuit_for_loop = Arc::clone(&circuit_manager);
        let circuit_shutdown = state.subscribe_shutdown();
        let circuit_handle = tokio::spawn(async move {
            circuit_for_loop.run(circuit_shutdown).await;
        });

        let metrics_loop = MetricsLoop::new(state.backend_pool(), config.perf_config.clone());
        let metrics_shutdown = state.subscribe_shutdown();
        let metrics_handle = tokio::spawn(async move {
            if let Err(e) = metrics_loop.run(metrics_shutdown).await {
                error!("Metrics loop error: {}", e);
            }
        });

        let cache_sweep_state = Arc::clone(state);
        let mut cache_sweep_shutdown = state.subscribe_shutdown();
        let cache_sweep_handle = tokio::spawn(async move {
            run_cache_sweep_loop(cache_sweep_state, &mut cache_sweep_shutdown).await;
        });

        let api_state = ApiState {
            app: Arc::clone(state),
            circuit: circuit_manager,
        };
        let api_router = api::build_router(api_state);
        let api_shutdown = state.subscribe_shutdown();
        let api_handle = tokio::spawn(async move {
            if let Err(e) = run_api_server(api_bind, api_router, api_shutdown).await {
                error!("Management API error: {}", e);
            }
        });

        Ok(TaskHandles {
            socks: socks_handle,
            dns: dns_handle,
            health: health_handle,
            circuit: circuit_handle,
            metrics: metrics_handle,
            cache_sweep: cache_sweep_handle,
            api: api_handle,
        })
    }

    /// Broadcasts shutdown, then waits (with a timeout) for every task to
    /// finish and for in-flight connections to drain.
    async fn graceful_shutdown(state: Arc<AppState>, handles: TaskHandles) -> Result<()> {
        info!("Sending shutdown signal to all services");
        state.trigger_shutdown();

        let active = state.backend_pool().total_active_connections();
        if active > 0 {
            info!("Waiting for {} active SOCKS connections...", active);
        }

        let pool_for_wait = state.backend_pool();
        let shutdown_result = timeout(Duration::from_secs(GRACEFUL_SHUTDOWN_TIMEOUT_SECS), async move {
            if let Err(e) = handles.socks.await {
                error!("SOCKS task termination error: {}", e);
            }
            if let Err(e) = handles.dns.await {
                error!("DNS task termination error: {}", e);
            }
            if let Err(e) = handles.health.await {
                error!("Health monitor task termination error: {}", e);
            }
            if let Err(e) = handles.circuit.await {
                error!("Circuit manager task termination error: {}", e);
            }
            if let Err(e) = handles.metrics.await {
                error!("Metrics task termination error: {}", e);
            }
            if let Err(e) = handles.cache_sweep.await {
                error!("Cache sweep task termination error: {}", e);
            }
            if let Err(e) = handles.api.await {
                error!("Management API task termination error: {}", e);
            }

            loop {
                let active = pool_for_wait.total_active_connections();
                if active == 0 {
                    break;
                }
                debug!("{} active connections remaining...", active);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match shutdown_result {
            Ok(()) => info!("All services stopped and connections closed"),
            Err(_) => warn!(
                "Graceful shutdown timeout ({} seconds). Force stopping.",
                GRACEFUL_SHUTDOWN_TIMEOUT_SECS
            ),
        }

        Ok(())
    }
}

async fn run_cache_sweep_loop(state: Arc<AppState>, shutdown: &mut broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(DNS_CACHE_SWEEP_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cache = state.dns_cache();
                if cache.is_enabled() {
                    let removed = cache.sweep_expired();
                    if removed > 0 {
                        debug!("DNS cache sweep removed {} expired entries", removed);
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn run_api_server(
    bind: SocketAddr,
    router: axum::Router,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind management API listener on {}", bind))?;

    info!("Management API listening on {}", bind);

    let mut deadline_watch = shutdown.resubscribe();
    let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = shutdown.recv().await;
        info!("Management API received shutdown signal, draining in-flight requests");
    });

    tokio::select! {
        result = serve => result.context("Management API server error"),
        _ = async {
            let _ = deadline_watch.recv().await;
            tokio::time::sleep(Duration::from_secs(API_SHUTDOWN_TIMEOUT_SECS)).await;
        } => {
            warn!("Management API did not finish draining within its grace period");
            Ok(())
        }
    }
}

/// Public API for main.rs
pub async fn run_daemon(cli_config_path: Option<&Path>) -> Result<()> {
    Supervisor::run_daemon(cli_config_path).await
}

pub async fn run_foreground(cli_config_path: Option<&Path>) -> Result<()> {
    Supervisor::run_foreground(cli_config_path).await
}
