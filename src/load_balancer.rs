//! Load balancer module
//!
//! Selects a healthy, non-draining backend per the configured policy:
//! `random`, `round-robin`, or `least-connections`. Never blocks; reads each
//! backend's health/draining flags through `BackendState`'s own short
//! critical sections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::backend::BackendState;
use crate::backend_pool::BackendPool;
use crate::config::BalanceMethod;

/// Picks backends out of a pool according to a fixed policy.
pub struct LoadBalancer {
    method: BalanceMethod,
    pool: Arc<BackendPool>,
    rr_index: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(method: BalanceMethod, pool: Arc<BackendPool>) -> Self {
        Self {
            method,
            pool,
            rr_index: AtomicUsize::new(0),
        }
    }

    /// Selects a backend, or `None` if no backend is both healthy and
    /// not draining.
    pub fn select_backend(&self) -> Option<Arc<BackendState>> {
        let eligible = self.pool.eligible_backends();

        if eligible.is_empty() {
            log::warn!("No healthy, non-draining backend available");
            return None;
        }

        match self.method {
            BalanceMethod::Random => Self::select_random(&eligible),
            BalanceMethod::RoundRobin => self.select_round_robin(&eligible),
            BalanceMethod::LeastConnections => Self::select_least_connections(&eligible),
        }
    }

    fn select_random(backends: &[Arc<BackendState>]) -> Option<Arc<BackendState>> {
        backends.choose(&mut rand::thread_rng()).cloned()
    }

    /// Atomic cursor advanced modulo the eligible subset's current size; a
    /// subset-size change is picked up on the next call since the index is
    /// interpreted modulo the size at call time (spec §4.4).
    fn select_round_robin(&self, backends: &[Arc<BackendState>]) -> Option<Arc<BackendState>> {
        let index = self.rr_index.fetch_add(1, Ordering::Relaxed);
        let selected = &backends[index % backends.len()];

        log::debug!(
            "round-robin selection: backend {} (index {})",
            selected.id,
            index % backends.len()
        );

        Some(Arc::clone(selected))
    }

    /// Minimum active-connection count; ties broken by lowest id.
    fn select_least_connections(backends: &[Arc<BackendState>]) -> Option<Arc<BackendState>> {
        backends
            .iter()
            .min_by_key(|b| (b.active_connections(), b.id))
            .cloned()
    }

    pub fn method(&self) -> BalanceMethod {
        self.method
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    #[cfg(test)]
    pub fn current_index(&self) -> usize {
        self.rr_index.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, Config};

    fn create_test_pool() -> Arc<BackendPool> {
        let mut config = Config::new();
        for port in [9151u16, 9251, 9351] {
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
        let pool = Arc::new(BackendPool::from_config(&config));
        for backend in pool.all_backends() {
            backend.set_healthy(true);
        }
        pool
    }

    #[test]
    fn round_robin_cycles_through_eligible_backends() {
        let pool = create_test_pool();
        let lb = LoadBalancer::new(BalanceMethod::RoundRobin, Arc::clone(&pool));

        let b1 = lb.select_backend().unwrap();
        let _b2 = lb.select_backend().unwrap();
        let _b3 = lb.select_backend().unwrap();
        let b4 = lb.select_backend().unwrap();

        assert_eq!(b1.id, b4.id);
    }

    #[test]
    fn least_connections_avoids_the_busiest_backend() {
        let pool = create_test_pool();
        let lb = LoadBalancer::new(BalanceMethod::LeastConnections, Arc::clone(&pool));

        pool.all_backends()[0].increment_connections();
        pool.all_backends()[0].increment_connections();

        let selected = lb.select_backend().unwrap();
        assert_ne!(selected.id, pool.all_backends()[0].id);
    }

    #[test]
    fn least_connections_breaks_ties_by_lowest_id() {
        let pool = create_test_pool();
        let lb = LoadBalancer::new(BalanceMethod::LeastConnections, Arc::clone(&pool));

        let selected = lb.select_backend().unwrap();
        assert_eq!(selected.id, 1);
    }

    #[test]
    fn no_eligible_backend_returns_none() {
        let pool = create_test_pool();
        for backend in pool.all_backends() {
            backend.set_healthy(false);
        }

        let lb = LoadBalancer::new(BalanceMethod::RoundRobin, pool);
        assert!(lb.select_backend().is_none());
    }

    #[test]
    fn draining_backend_is_excluded() {
        let pool = create_test_pool();
        pool.all_backends()[0].set_draining(true);
        pool.all_backends()[1].set_draining(true);

        let lb = LoadBalancer::new(BalanceMethod::RoundRobin, pool);
        let selected = lb.select_backend().unwrap();
        assert_eq!(selected.id, 3);
    }
}
