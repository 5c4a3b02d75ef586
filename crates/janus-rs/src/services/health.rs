//! Background health probes for the upstream pool.
//!
//! Every `interval` each upstream gets a GET on the configured probe path
//! with its own timeout; only 2xx counts as healthy. Threshold logic lives
//! on the upstream itself ([`Upstream::record_probe`]); this module is just
//! the probe loop.
//!
//! [`Upstream::record_probe`]: super::upstream::Upstream::record_probe

use log::{info, warn};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::models::settings::HealthCheckSettings;

use super::upstream::UpstreamPool;

/// Runs the probe loop until `shutdown` fires.
pub async fn probe_loop(
    pool: UpstreamPool,
    settings: HealthCheckSettings,
    shutdown: CancellationToken,
) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_millis(settings.timeout))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!("Health prober could not build its client: {}", e);
            return;
        }
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(settings.interval));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        for upstream in pool.all() {
            let url = format!(
                "{}/{}",
                upstream.base_url(),
                settings.path.trim_start_matches('/')
            );
            let was_healthy = upstream.is_healthy();
            let success = matches!(
                client.get(&url).send().await,
                Ok(resp) if resp.status().is_success()
            );
            let now_healthy = upstream.record_probe(
                success,
                settings.unhealthy_threshold,
                settings.healthy_threshold,
            );
            if was_healthy && !now_healthy {
                warn!("Upstream {} marked unhealthy", upstream.key());
            } else if !was_healthy && now_healthy {
                info!("Upstream {} restored", upstream.key());
            }
        }
    }
}
