//! Performance metrics loop (§4.7)
//!
//! On a fixed interval, issues latency probes (HEAD requests) and a light
//! speed probe (streamed GET up to a configured byte count) through each
//! healthy backend's per-instance HTTP client, updating the backend's
//! metric map. Grounded on the SOCKS-proxied `reqwest::Proxy::all`
//! latency-measurement pattern found elsewhere in the pack.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::StreamExt;

use crate::backend_pool::BackendPool;
use crate::config::PerfConfig;

pub struct MetricsLoop {
    pool: Arc<BackendPool>,
    config: PerfConfig,
}

impl MetricsLoop {
    pub fn new(pool: Arc<BackendPool>, config: PerfConfig) -> Self {
        Self { pool, config }
    }

    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        if !self.config.enabled {
            log::info!("performance metrics loop disabled by config");
            return Ok(());
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_probes_once().await,
                _ = shutdown.recv() => break,
            }
        }

        Ok(())
    }

    async fn run_probes_once(&self) {
        for backend in self.pool.healthy_backends() {
            let client = match backend.get_http_client() {
                Ok(client) => client,
                Err(e) => {
                    log::debug!("backend {} has no usable HTTP client: {}", backend.id, e);
                    continue;
                }
            };

            for (alias, url) in &self.config.latency_targets {
                let started = Instant::now();
                match client.head(url).send().await {
                    Ok(response) if response.status().is_success() || response.status().is_redirection() => {
                        let latency_ms = started.elapsed().as_millis() as u64;
                        backend.update_perf_metric(alias, Some(latency_ms), None, false);
                    }
                    _ => {
                        backend.update_perf_metric(alias, None, None, true);
                    }
                }
            }

            if let Some(url) = &self.config.speed_target_url {
                let speed_kbps = measure_speed_kbps(&client, url, self.config.speed_target_bytes).await;
                match speed_kbps {
                    Some(kbps) => backend.update_perf_metric("speed", None, Some(kbps), false),
                    None => backend.update_perf_metric("speed", None, None, true),
                }
            }
        }
    }
}

async fn measure_speed_kbps(client: &reqwest::Client, url: &str, max_bytes: u64) -> Option<f64> {
    let started = Instant::now();
    let response = client.get(url).send().await.ok()?;
    let mut stream = response.bytes_stream();

    let mut received: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.ok()?;
        received += chunk.len() as u64;
        if received >= max_bytes {
            break;
        }
    }

    let elapsed_secs = started.elapsed().as_secs_f64().max(0.001);
    Some((received as f64 / 1024.0) / elapsed_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perf_config_defaults_disable_the_loop() {
        let config = PerfConfig::default();
        assert!(!config.enabled);
    }
}
