//! Circuit manager (C8)
//!
//! Age-based rotation, IP-diversity rotation, and operator-triggered
//! staggered bulk rotation, all gated by a single atomic
//! "rotation-in-progress" flag so at most one rotation runs at a time. No
//! direct teacher counterpart; grounded in the gate/atomic-flag idiom the
//! teacher already uses for its round-robin cursor and `protection.rs`'s
//! atomic state machine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::broadcast;

use crate::backend::BackendState;
use crate::backend_pool::BackendPool;
use crate::config::CircuitConfig;
use crate::net_util::{diversity_group_key, parse_exit_ip_body};

/// Single process-wide compare-and-swap gate. Guarantees at most one of
/// age-rotation, diversity-rotation, or bulk-rotation runs concurrently.
#[derive(Default)]
pub struct RotationGate {
    held: AtomicBool,
}

impl RotationGate {
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

pub struct CircuitManager {
    pool: Arc<BackendPool>,
    config: CircuitConfig,
    gate: Arc<RotationGate>,
    exit_ip_url: String,
}

impl CircuitManager {
    pub fn new(
        pool: Arc<BackendPool>,
        config: CircuitConfig,
        gate: Arc<RotationGate>,
        exit_ip_url: String,
    ) -> Self {
        Self {
            pool,
            config,
            gate,
            exit_ip_url,
        }
    }

    /// Background loop driving (a) age-based and (b) IP-diversity
    /// rotation. Ticks at the smaller of `max_age/5` and
    /// `diversity_interval/5`, floored at 1 minute.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            log::info!("circuit manager disabled by config");
            return;
        }

        let tick = self.tick_interval();
        let mut interval = tokio::time::interval(tick);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    self.run_age_rotation().await;
                    if self.config.ip_diversity_enabled {
                        self.run_diversity_rotation().await;
                    }
                }
            }
        }
    }

    fn tick_interval(&self) -> Duration {
        let age_based = self.config.max_age_secs / 5;
        let diversity_based = self.config.ip_diversity_check_interval_secs / 5;
        Duration::from_secs(age_based.min(diversity_based).max(60))
    }

    /// (a) Age-based rotation: selects the oldest-rotated healthy backend
    /// past `max_age_secs` and renews its circuit.
    async fn run_age_rotation(&self) {
        if !self.gate.try_acquire() {
            return;
        }

        let result = self.age_rotation_locked().await;
        self.gate.release();

        if let Err(e) = result {
            log::warn!("age-based circuit rotation failed: {}", e);
        }
    }

    async fn age_rotation_locked(&self) -> Result<()> {
        let now = now_unix_secs();
        let max_age = self.config.max_age_secs;

        let candidate = select_oldest_past_threshold(
            self.pool.healthy_backends().into_iter(),
            max_age,
            now,
            |b| b.last_circuit_recreation_ms(),
        );

        let Some(backend) = candidate else {
            return Ok(());
        };

        log::info!("rotating backend {} for circuit age", backend.id);
        self.drain_and_renew(&backend).await?;
        tokio::time::sleep(Duration::from_secs(self.config.rotation_stagger_secs)).await;
        Ok(())
    }

    /// (b) IP-diversity rotation: refreshes stale exit-IPs, groups healthy
    /// backends by /24 (v4) or /48 (v6), and rotates the oldest member of
    /// any group of size ≥ `ip_diversity_min_backends` whose last diversity
    /// rotation exceeds the cooldown.
    async fn run_diversity_rotation(&self) {
        if !self.gate.try_acquire() {
            return;
        }

        let result = self.diversity_rotation_locked().await;
        self.gate.release();

        if let Err(e) = result {
            log::warn!("IP-diversity circuit rotation failed: {}", e);
        }
    }

    async fn diversity_rotation_locked(&self) -> Result<()> {
        let half_interval = Duration::from_secs(self.config.ip_diversity_check_interval_secs / 2);
        let healthy = self.pool.healthy_backends();

        for backend in &healthy {
            let stale = match backend.get_external_ip_info() {
                None => true,
                Some(info) => {
                    now_unix_ms().saturating_sub(info.observed_at_ms) > half_interval.as_millis() as u64
                }
            };
            if stale {
                refresh_external_ip(backend, &self.exit_ip_url).await;
            }
        }

        let mut groups: HashMap<String, Vec<Arc<BackendState>>> = HashMap::new();
        for backend in &healthy {
            if let Some(info) = backend.get_external_ip_info() {
                if let Ok(ip) = info.ip.parse() {
                    groups
                        .entry(diversity_group_key(&ip))
                        .or_default()
                        .push(Arc::clone(backend));
                }
            }
        }

        let now = now_unix_secs();
        let cooldown = self.config.ip_diversity_rotation_cooldown_secs;

        for members in groups.values() {
            if members.len() < self.config.ip_diversity_min_backends {
                continue;
            }

            let candidate = select_oldest(members.iter().cloned(), now, |b| {
                b.last_diversity_rotate_ms()
            });

            if let Some(backend) = candidate {
                let last = backend.last_diversity_rotate_ms() / 1000;
                let age = if last == 0 { u64::MAX } else { now.saturating_sub(last) };
                if age > cooldown {
                    log::info!("rotating backend {} for IP diversity", backend.id);
                    self.drain_and_renew(&backend).await?;
                    backend.set_last_diversity_rotate_now();
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// (c) Operator-initiated staggered bulk rotation: renews every healthy
    /// backend in sequence with `rotation_stagger_secs` between them.
    /// Returns an error if the gate is already held (conflict).
    pub async fn bulk_rotate(&self) -> Result<usize> {
        if !self.gate.try_acquire() {
            bail!("rotation already in progress");
        }

        let result = self.bulk_rotate_locked().await;
        self.gate.release();
        result
    }

    async fn bulk_rotate_locked(&self) -> Result<usize> {
        let backends = self.pool.healthy_backends();
        let mut rotated = 0;

        for backend in &backends {
            if let Err(e) = self.drain_and_renew(backend).await {
                log::warn!("bulk rotation: backend {} failed: {}", backend.id, e);
                continue;
            }
            rotated += 1;
            tokio::time::sleep(Duration::from_secs(self.config.rotation_stagger_secs)).await;
        }

        Ok(rotated)
    }

    /// Operator-initiated single-backend rotation (management API's
    /// per-backend "rotate" action). Takes the same gate as age/diversity/
    /// bulk rotation so no two renewal signals from any source are ever
    /// in flight at once (spec invariant 2). Returns an error if the gate
    /// is already held.
    pub async fn rotate_one(&self, backend: &Arc<BackendState>) -> Result<()> {
        if !self.gate.try_acquire() {
            bail!("rotation already in progress");
        }

        let result = self.drain_and_renew(backend).await;
        self.gate.release();
        result
    }

    async fn drain_and_renew(&self, backend: &Arc<BackendState>) -> Result<()> {
        backend.set_draining(true);

        let deadline = Duration::from_secs(self.config.graceful_rotation_timeout_secs);
        let start = tokio::time::Instant::now();
        while backend.active_connections() > 0 && start.elapsed() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let result = backend.renew_circuit().await;
        backend.set_draining(false);
        result
    }

    pub fn gate(&self) -> Arc<RotationGate> {
        Arc::clone(&self.gate)
    }
}

/// Picks the element whose `last_ms` is OLDEST (largest elapsed age) among
/// those exceeding `threshold_secs`, tie-broken by lowest id. An element
/// whose `last_ms` is 0 (never rotated) is treated as infinitely old.
/// Shared by age-based and diversity rotation so both pick the most
/// overdue candidate, not merely the first one that qualifies.
fn select_oldest_past_threshold<T>(
    items: impl Iterator<Item = T>,
    threshold_secs: u64,
    now_secs: u64,
    last_ms: impl Fn(&T) -> u64,
) -> Option<T>
where
    T: AsRef<BackendState>,
{
    items
        .filter_map(|item| {
            let age = age_secs(last_ms(&item), now_secs);
            (age > threshold_secs).then_some((age, item))
        })
        .max_by_key(|(age, item)| (*age, std::cmp::Reverse(item.as_ref().id)))
        .map(|(_, item)| item)
}

/// Picks the element whose `last_ms` is OLDEST, with no qualifying
/// threshold — used where the caller applies its own post-selection check
/// (diversity rotation's cooldown).
fn select_oldest<T>(
    items: impl Iterator<Item = T>,
    now_secs: u64,
    last_ms: impl Fn(&T) -> u64,
) -> Option<T>
where
    T: AsRef<BackendState>,
{
    items
        .map(|item| (age_secs(last_ms(&item), now_secs), item))
        .max_by_key(|(age, item)| (*age, std::cmp::Reverse(item.as_ref().id)))
        .map(|(_, item)| item)
}

fn age_secs(last_ms: u64, now_secs: u64) -> u64 {
    if last_ms == 0 {
        return u64::MAX;
    }
    now_secs.saturating_sub(last_ms / 1000)
}

/// Refreshes one backend's cached exit IP through its own SOCKS-routed
/// HTTP client, accepting the same `{"IP":...}`-or-plain-body shapes as
/// the management API's on-demand probe (spec §6).
async fn refresh_external_ip(backend: &Arc<BackendState>, exit_ip_url: &str) {
    let Ok(client) = backend.get_http_client() else {
        return;
    };

    match client.get(exit_ip_url).send().await {
        Ok(response) => match response.text().await {
            Ok(body) => {
                if let Some(ip) = parse_exit_ip_body(&body) {
                    backend.set_external_ip(ip);
                } else {
                    log::debug!("backend {} exit-ip body unparseable: {}", backend.id, body);
                }
            }
            Err(e) => log::debug!("exit-IP body read failed for backend {}: {}", backend.id, e),
        },
        Err(e) => log::debug!("exit-IP refresh failed for backend {}: {}", backend.id, e),
    }
}

fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
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

    #[test]
    fn gate_allows_only_one_holder() {
        let gate = RotationGate::default();
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
        gate.release();
        assert!(gate.try_acquire());
    }

    #[test]
    fn tick_interval_is_floored_at_one_minute() {
        let config = CircuitConfig {
            enabled: true,
            max_age_secs: 60,
            rotation_stagger_secs: 5,
            graceful_rotation_timeout_secs: 30,
            ip_diversity_enabled: true,
            ip_diversity_min_backends: 2,
            ip_diversity_check_interval_secs: 60,
            ip_diversity_rotation_cooldown_secs: 600,
        };
        let pool = Arc::new(BackendPool::from_config(&crate::config::Config::new()));
        let manager = CircuitManager::new(
            pool,
            config,
            Arc::new(RotationGate::default()),
            "https://api.ipify.org?format=json".to_string(),
        );
        assert_eq!(manager.tick_interval(), Duration::from_secs(60));
    }

    fn sample_backend(id: u32, port: u16) -> Arc<BackendState> {
        Arc::new(BackendState::new(
            id,
            crate::config::BackendConfig {
                host: "127.0.0.1".to_string(),
                control_port: port,
                socks_port: port + 1,
                dns_port: Some(port + 2),
                cookie_path: "/tmp/does-not-exist-cookie".to_string(),
                data_dir: "/tmp".to_string(),
                max_connections: None,
            },
        ))
    }

    #[test]
    fn age_rotation_selects_the_most_overdue_backend_not_the_newest_qualifying() {
        let a = sample_backend(1, 9001);
        let b = sample_backend(2, 9101);
        let now = 20_000u64;
        // a rotated 10800s ago, b rotated 5400s ago; both exceed the 3600s
        // threshold, but a is the one that is actually most overdue.
        a.set_last_circuit_recreation_ms_for_test((now - 10_800) * 1000);
        b.set_last_circuit_recreation_ms_for_test((now - 5_400) * 1000);

        let candidate = select_oldest_past_threshold(
            vec![Arc::clone(&a), Arc::clone(&b)].into_iter(),
            3_600,
            now,
            |backend| backend.last_circuit_recreation_ms(),
        );

        assert_eq!(candidate.unwrap().id, a.id);
    }

    #[test]
    fn age_rotation_treats_never_rotated_backend_as_infinitely_old() {
        let a = sample_backend(1, 9001);
        let b = sample_backend(2, 9101);
        let now = 20_000u64;
        // a has never rotated (last == 0); b rotated long ago but has a
        // real timestamp. a must still win.
        b.set_last_circuit_recreation_ms_for_test((now - 100_000) * 1000);

        let candidate = select_oldest_past_threshold(
            vec![Arc::clone(&a), Arc::clone(&b)].into_iter(),
            3_600,
            now,
            |backend| backend.last_circuit_recreation_ms(),
        );

        assert_eq!(candidate.unwrap().id, a.id);
    }

    #[test]
    fn age_rotation_ties_break_by_lowest_id() {
        let a = sample_backend(5, 9001);
        let b = sample_backend(2, 9101);
        let now = 20_000u64;
        a.set_last_circuit_recreation_ms_for_test((now - 7_200) * 1000);
        b.set_last_circuit_recreation_ms_for_test((now - 7_200) * 1000);

        let candidate = select_oldest_past_threshold(
            vec![Arc::clone(&a), Arc::clone(&b)].into_iter(),
            3_600,
            now,
            |backend| backend.last_circuit_recreation_ms(),
        );

        assert_eq!(candidate.unwrap().id, b.id);
    }

    #[test]
    fn age_rotation_excludes_backends_under_threshold() {
        let a = sample_backend(1, 9001);
        let now = 20_000u64;
        a.set_last_circuit_recreation_ms_for_test((now - 100) * 1000);

        let candidate = select_oldest_past_threshold(
            vec![Arc::clone(&a)].into_iter(),
            3_600,
            now,
            |backend| backend.last_circuit_recreation_ms(),
        );

        assert!(candidate.is_none());
    }

    #[test]
    fn diversity_rotation_selects_oldest_member_unconditionally() {
        let a = sample_backend(1, 9001);
        let b = sample_backend(2, 9101);
        let now = 20_000u64;
        a.set_last_diversity_rotate_ms_for_test((now - 50) * 1000);
        b.set_last_diversity_rotate_ms_for_test((now - 500) * 1000);

        let candidate = select_oldest(vec![Arc::clone(&a), Arc::clone(&b)].into_iter(), now, |backend| {
            backend.last_diversity_rotate_ms()
        });

        assert_eq!(candidate.unwrap().id, b.id);
    }
}
