//! Public RPC discovery via the cosmos chain registry.
//!
//! When `public_fallback` is enabled for a chain, registry-listed RPC
//! endpoints are merged into the fleet as non-alerting extras. The list is
//! refreshed on startup and every twelve hours. Public endpoints are a last
//! resort; the wrong-chain check still applies to every one of them.

use std::sync::Arc;
use std::time::Duration;

use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::models::MonitorError;
use crate::services::rpc::EndpointFleet;

const REGISTRY_BASE: &str = "https://raw.githubusercontent.com/cosmos/chain-registry/master";
const REFRESH_INTERVAL: Duration = Duration::from_secs(12 * 3600);

#[derive(Debug, Deserialize)]
struct RegistryChain {
	#[serde(default)]
	chain_id: String,
	#[serde(default)]
	apis: RegistryApis,
}

#[derive(Debug, Default, Deserialize)]
struct RegistryApis {
	#[serde(default)]
	rpc: Vec<RegistryEndpoint>,
}

#[derive(Debug, Deserialize)]
struct RegistryEndpoint {
	address: String,
}

/// Best-effort guess of the registry directory for a chain id: the trailing
/// `-<number>` revision is dropped (`osmosis-1` -> `osmosis`).
pub fn registry_name(chain_id: &str) -> String {
	match chain_id.rsplit_once('-') {
		Some((name, rev)) if rev.chars().all(|c| c.is_ascii_digit()) => name.to_string(),
		_ => chain_id.to_string(),
	}
}

/// Fetches the registry RPC list for `chain_id`, returning only entries whose
/// registry file confirms the chain id.
pub async fn fetch_public_rpcs(
	http: &ClientWithMiddleware,
	chain_id: &str,
) -> Result<Vec<String>, MonitorError> {
	let name = registry_name(chain_id);
	let url = format!("{REGISTRY_BASE}/{name}/chain.json");
	let chain: RegistryChain = http
		.get(&url)
		.send()
		.await?
		.error_for_status()
		.map_err(MonitorError::from)?
		.json()
		.await
		.map_err(MonitorError::from)?;

	if chain.chain_id != chain_id {
		return Err(MonitorError::NotFound(format!(
			"registry entry {name} is for {}, not {chain_id}",
			chain.chain_id
		)));
	}

	Ok(chain
		.apis
		.rpc
		.into_iter()
		.map(|e| e.address.trim_end_matches('/').to_string())
		.filter(|a| a.starts_with("http://") || a.starts_with("https://"))
		.collect())
}

/// Keeps the fleet topped up with registry endpoints until shutdown.
pub async fn run_registry_refresh(
	fleet: Arc<EndpointFleet>,
	http: ClientWithMiddleware,
	mut shutdown: watch::Receiver<bool>,
) {
	let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
	loop {
		tokio::select! {
			_ = shutdown.changed() => break,
			_ = ticker.tick() => {
				match fetch_public_rpcs(&http, fleet.chain_id()).await {
					Ok(urls) => {
						info!(
							"refreshed chain registry for {}: {} public endpoints",
							fleet.chain_id(),
							urls.len()
						);
						fleet.add_fallback_nodes(urls).await;
					}
					Err(e) => warn!("could not refresh chain registry for {}: {e}", fleet.chain_id()),
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registry_name_strips_numeric_revision() {
		assert_eq!(registry_name("osmosis-1"), "osmosis");
		assert_eq!(registry_name("cosmoshub-4"), "cosmoshub");
		assert_eq!(registry_name("dydx-mainnet-1"), "dydx-mainnet");
		assert_eq!(registry_name("nochainrev"), "nochainrev");
	}
}
