//! Dead-man-switch pings.
//!
//! When enabled, the monitor periodically GETs a ping URL (healthchecks.io
//! style). If the process dies, the pings stop and the external service
//! raises the alarm - covering the failure mode this monitor cannot report
//! on itself.

use reqwest_middleware::ClientWithMiddleware;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::models::HealthcheckConfig;

/// Pings `config.ping_url` every `config.ping_rate` until shutdown.
pub async fn run_pinger(
	config: HealthcheckConfig,
	http: ClientWithMiddleware,
	mut shutdown: watch::Receiver<bool>,
) {
	if !config.enabled || config.ping_url.is_empty() {
		return;
	}
	let mut ticker = tokio::time::interval(config.ping_rate);
	loop {
		tokio::select! {
			_ = shutdown.changed() => break,
			_ = ticker.tick() => {
				match http.get(&config.ping_url).send().await {
					Ok(resp) if resp.status().is_success() => {
						debug!("healthcheck ping sent");
					}
					Ok(resp) => warn!("healthcheck ping returned status {}", resp.status()),
					Err(e) => warn!("healthcheck ping failed: {e}"),
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::utils::http::{build_client, HttpClientConfig};
	use std::time::Duration;

	#[tokio::test]
	async fn pinger_hits_the_url() {
		let mut server = mockito::Server::new_async().await;
		let mock = server
			.mock("GET", "/ping")
			.with_status(200)
			.expect_at_least(1)
			.create_async()
			.await;

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let config = HealthcheckConfig {
			enabled: true,
			ping_url: format!("{}/ping", server.url()),
			ping_rate: Duration::from_millis(50),
		};
		let handle = tokio::spawn(run_pinger(
			config,
			build_client(&HttpClientConfig::default()),
			shutdown_rx,
		));
		tokio::time::sleep(Duration::from_millis(120)).await;
		shutdown_tx.send(true).unwrap();
		handle.await.unwrap();
		mock.assert_async().await;
	}

	#[tokio::test]
	async fn disabled_pinger_returns_immediately() {
		let (_tx, rx) = watch::channel(false);
		run_pinger(
			HealthcheckConfig::default(),
			build_client(&HttpClientConfig::default()),
			rx,
		)
		.await;
	}
}
