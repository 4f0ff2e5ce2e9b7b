//! Health monitor (C4)
//!
//! At startup, each backend is probed once concurrently; thereafter the
//! monitor ticks on the configured interval, firing a per-backend check in
//! parallel each time. Purely observational: mutates only the health fields
//! of instances. Grounded on the teacher's `health.rs` loop shape
//! (`tokio::time::interval`, `tokio::select!` against shutdown, parallel
//! per-backend `tokio::spawn`); the probe itself is replaced with the
//! bootstrap-phase control command, gated by a cheap TCP pre-check (see
//! DESIGN.md's Open Question decision).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info};
use tokio::net::TcpStream;
use tokio::time::{interval, timeout};

use crate::backend_pool::BackendPool;
use crate::constants::{
    HEALTH_CHECK_BOOTSTRAP_TIMEOUT_SECS, HEALTH_CHECK_INTERVAL_MS,
    HEALTH_CHECK_TCP_GATE_TIMEOUT_MS,
};

pub struct HealthMonitor {
    pool: Arc<BackendPool>,
}

impl HealthMonitor {
    pub fn new(pool: Arc<BackendPool>) -> Self {
        Self { pool }
    }

    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        let mut ticker = interval(Duration::from_millis(HEALTH_CHECK_INTERVAL_MS));

        info!(
            "Health monitor started: {}ms interval",
            HEALTH_CHECK_INTERVAL_MS
        );

        self.check_all_backends().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all_backends().await;
                }
                _ = shutdown.recv() => {
                    info!("Health monitor received shutdown signal");
                    break;
                }
            }
        }

        info!("Health monitor stopped");
        Ok(())
    }

    async fn check_all_backends(&self) {
        let mut handles = Vec::new();

        for backend in self.pool.all_backends() {
            let backend = Arc::clone(backend);
            handles.push(tokio::spawn(async move {
                let tcp_gate_passed = match backend.socks_addr() {
                    Ok(addr) => timeout(
                        Duration::from_millis(HEALTH_CHECK_TCP_GATE_TIMEOUT_MS),
                        TcpStream::connect(&addr),
                    )
                    .await
                    .map(|r| r.is_ok())
                    .unwrap_or(false),
                    Err(e) => {
                        error!("backend {} has an invalid SOCKS address: {}", backend.id, e);
                        false
                    }
                };

                if !tcp_gate_passed {
                    debug!("backend {} failed the TCP pre-check gate", backend.id);
                    backend.set_healthy(false);
                    return;
                }

                backend
                    .check_health(Duration::from_secs(HEALTH_CHECK_BOOTSTRAP_TIMEOUT_SECS))
                    .await;
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("health check task panicked: {}", e);
            }
        }

        self.pool.log_status();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, Config};

    fn pool_with_one_backend() -> Arc<BackendPool> {
        let mut config = Config::new();
        config.backends.push(BackendConfig {
            host: "127.0.0.1".to_string(),
            control_port: 19151,
            socks_port: 19150,
            dns_port: Some(19153),
            cookie_path: "/tmp/cookie".to_string(),
            data_dir: "/tmp".to_string(),
            max_connections: None,
        });
        Arc::new(BackendPool::from_config(&config))
    }

    #[tokio::test]
    async fn unreachable_backend_is_marked_unhealthy() {
        let pool = pool_with_one_backend();
        let monitor = HealthMonitor::new(Arc::clone(&pool));
        monitor.check_all_backends().await;

        assert!(!pool.all_backends()[0].is_healthy());
    }
}
