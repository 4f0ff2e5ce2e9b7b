//! Backend pool module
//!
//! Owns the fixed set of `BackendState` instances for a loaded config
//! snapshot and provides the read-only queries the load balancer, health
//! monitor, circuit manager, and management API need.

use std::sync::Arc;

use crate::backend::BackendState;
use crate::config::Config;

/// Collection of backend instances for one config snapshot.
#[derive(Debug)]
pub struct BackendPool {
    backends: Vec<Arc<BackendState>>,
}

impl BackendPool {
    /// Builds a pool from a validated config, assigning dense 1-based ids
    /// in config order. Ids are stable for the lifetime of this pool; a
    /// config reload rebuilds a fresh pool rather than recreating ids.
    pub fn from_config(config: &Config) -> Self {
        let backends = config
            .backends
            .iter()
            .enumerate()
            .map(|(idx, backend_config)| {
                Arc::new(BackendState::new((idx + 1) as u32, backend_config.clone()))
            })
            .collect();

        Self { backends }
    }

    pub fn all_backends(&self) -> &[Arc<BackendState>] {
        &self.backends
    }

    /// Backends that are healthy and not currently draining: the subset
    /// eligible for new work (spec §3 invariant: a draining backend is
    /// never selected).
    pub fn eligible_backends(&self) -> Vec<Arc<BackendState>> {
        self.backends
            .iter()
            .filter(|b| b.is_healthy() && !b.is_draining())
            .cloned()
            .collect()
    }

    pub fn healthy_backends(&self) -> Vec<Arc<BackendState>> {
        self.backends
            .iter()
            .filter(|b| b.is_healthy())
            .cloned()
            .collect()
    }

    pub fn healthy_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_healthy()).count()
    }

    pub fn total_count(&self) -> usize {
        self.backends.len()
    }

    pub fn find_backend(&self, id: u32) -> Option<Arc<BackendState>> {
        self.backends.iter().find(|b| b.id == id).cloned()
    }

    pub fn total_active_connections(&self) -> usize {
        self.backends.iter().map(|b| b.active_connections()).sum()
    }

    pub fn log_status(&self) {
        let total = self.total_count();
        let healthy = self.healthy_count();
        log::debug!("Backend pool status: {}/{} healthy", healthy, total);

        for backend in &self.backends {
            log::debug!(
                "  - backend {} {}:{} [{}{}] (connections: {})",
                backend.id,
                backend.config.host,
                backend.config.control_port,
                if backend.is_healthy() { "healthy" } else { "unhealthy" },
                if backend.is_draining() { ", draining" } else { "" },
                backend.active_connections()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn sample_config(n: usize) -> Config {
        let mut config = Config::new();
        for i in 0..n {
            let port = 9151 + (i as u16) * 100;
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
        config
    }

    #[test]
    fn assigns_dense_one_based_ids() {
        let pool = BackendPool::from_config(&sample_config(3));
        let ids: Vec<u32> = pool.all_backends().iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn eligible_excludes_unhealthy_and_draining() {
        let pool = BackendPool::from_config(&sample_config(3));
        pool.all_backends()[0].set_healthy(true);
        pool.all_backends()[1].set_healthy(true);
        pool.all_backends()[1].set_draining(true);
        pool.all_backends()[2].set_healthy(false);

        let eligible = pool.eligible_backends();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, 1);
    }

    #[test]
    fn find_backend_returns_none_for_unknown_id() {
        let pool = BackendPool::from_config(&sample_config(2));
        assert!(pool.find_backend(99).is_none());
        assert!(pool.find_backend(1).is_some());
    }

    #[test]
    fn total_active_connections_sums_across_backends() {
        let pool = BackendPool::from_config(&sample_config(2));
        pool.all_backends()[0].increment_connections();
        pool.all_backends()[1].increment_connections();
        pool.all_backends()[1].increment_connections();
        assert_eq!(pool.total_active_connections(), 3);
    }
}
