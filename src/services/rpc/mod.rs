//! RPC endpoint fleet management.
//!
//! Each chain owns a fleet of configured endpoints. A health loop probes the
//! `/status` of every endpoint, verifies the advertised chain id, and tracks
//! up/down/syncing transitions. Selection always returns a healthy endpoint;
//! an endpoint that ever reports the wrong chain id is quarantined for the
//! rest of the session.

pub mod registry;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::models::{MonitorError, NodeConfig, NodeEndpoint};

/// How often every endpoint is probed.
const HEALTH_INTERVAL: Duration = Duration::from_secs(20);

/// Parsed `/status` response fields the monitor cares about.
#[derive(Debug, Clone)]
pub struct StatusInfo {
	pub chain_id: String,
	pub catching_up: bool,
	pub latest_block_height: i64,
}

#[derive(Debug, Deserialize)]
struct RawStatus {
	#[serde(default)]
	result: Option<RawStatusResult>,
	#[serde(default)]
	node_info: Option<RawNodeInfo>,
	#[serde(default)]
	sync_info: Option<RawSyncInfo>,
}

#[derive(Debug, Deserialize)]
struct RawStatusResult {
	node_info: RawNodeInfo,
	sync_info: RawSyncInfo,
}

#[derive(Debug, Deserialize)]
struct RawNodeInfo {
	network: String,
}

#[derive(Debug, Deserialize)]
struct RawSyncInfo {
	#[serde(default)]
	latest_block_height: String,
	#[serde(default)]
	catching_up: bool,
}

/// Health-checked pool of RPC endpoints for one chain.
pub struct EndpointFleet {
	chain_id: String,
	nodes: RwLock<Vec<NodeEndpoint>>,
	http: ClientWithMiddleware,
	no_endpoints: AtomicBool,
	no_endpoints_since: RwLock<Option<DateTime<Utc>>>,
	latest_height: AtomicI64,
}

impl EndpointFleet {
	pub fn new(chain_id: &str, nodes: &[NodeConfig], http: ClientWithMiddleware) -> Self {
		Self {
			chain_id: chain_id.to_string(),
			nodes: RwLock::new(
				nodes
					.iter()
					.map(|n| NodeEndpoint::new(n.url.trim_end_matches('/').to_string(), n.alert_if_down))
					.collect(),
			),
			http,
			no_endpoints: AtomicBool::new(false),
			no_endpoints_since: RwLock::new(None),
			latest_height: AtomicI64::new(0),
		}
	}

	pub fn chain_id(&self) -> &str {
		&self.chain_id
	}

	/// Latest block height reported by any healthy endpoint.
	pub fn latest_height(&self) -> i64 {
		self.latest_height.load(Ordering::Relaxed)
	}

	/// True while every endpoint is down or quarantined.
	pub fn no_endpoints(&self) -> bool {
		self.no_endpoints.load(Ordering::Relaxed)
	}

	pub async fn no_endpoints_since(&self) -> Option<DateTime<Utc>> {
		*self.no_endpoints_since.read().await
	}

	/// Returns the url of a healthy endpoint. Quarantined and down endpoints
	/// are never returned.
	pub async fn pick(&self) -> Result<String, MonitorError> {
		let nodes = self.nodes.read().await;
		nodes
			.iter()
			.find(|n| n.healthy())
			.or_else(|| nodes.iter().find(|n| !n.down && !n.wrong_chain))
			.map(|n| n.url.clone())
			.ok_or(MonitorError::NoEndpoints)
	}

	pub async fn mark_down(&self, url: &str, err: &MonitorError) {
		let mut nodes = self.nodes.write().await;
		if let Some(node) = nodes.iter_mut().find(|n| n.url == url) {
			if !node.down {
				warn!("rpc endpoint {url} is down: {err}");
				node.down_since = Some(Utc::now());
			}
			node.down = true;
			node.was_down = true;
			node.last_error = Some(err.to_string());
			if matches!(err, MonitorError::WrongChain { .. }) {
				node.wrong_chain = true;
			}
		}
		drop(nodes);
		self.update_no_endpoints().await;
	}

	pub async fn mark_up(&self, url: &str) {
		let mut nodes = self.nodes.write().await;
		if let Some(node) = nodes.iter_mut().find(|n| n.url == url && !n.wrong_chain) {
			if node.down {
				info!("rpc endpoint {url} is healthy again");
			}
			node.down = false;
			node.down_since = None;
			node.last_error = None;
		}
		drop(nodes);
		self.update_no_endpoints().await;
	}

	/// Clears the was-down marker once the node-down alert has resolved.
	pub async fn clear_was_down(&self, url: &str) {
		let mut nodes = self.nodes.write().await;
		if let Some(node) = nodes.iter_mut().find(|n| n.url == url) {
			node.was_down = false;
		}
	}

	pub async fn nodes_snapshot(&self) -> Vec<NodeEndpoint> {
		self.nodes.read().await.clone()
	}

	pub async fn healthy_count(&self) -> usize {
		self.nodes.read().await.iter().filter(|n| n.healthy()).count()
	}

	pub async fn total_count(&self) -> usize {
		self.nodes.read().await.len()
	}

	/// Marks endpoints that were down at the previous shutdown so alerts do
	/// not re-fire after a restart.
	pub async fn restore_down_state(&self, down_since: &std::collections::HashMap<String, DateTime<Utc>>) {
		let mut nodes = self.nodes.write().await;
		for node in nodes.iter_mut() {
			if let Some(since) = down_since.get(&node.url) {
				node.down = true;
				node.was_down = true;
				node.down_since = Some(*since);
			}
		}
		drop(nodes);
		self.update_no_endpoints().await;
	}

	/// Adds registry-discovered endpoints to the pool (non-alerting, skipping
	/// urls already present).
	pub async fn add_fallback_nodes(&self, urls: Vec<String>) {
		let mut nodes = self.nodes.write().await;
		for url in urls {
			let url = url.trim_end_matches('/').to_string();
			if nodes.iter().any(|n| n.url == url) {
				continue;
			}
			debug!("adding public fallback endpoint {url}");
			nodes.push(NodeEndpoint::new(url, false));
		}
	}

	/// Fetches and parses `/status` from one endpoint, verifying the chain id.
	pub async fn probe(&self, url: &str) -> Result<StatusInfo, MonitorError> {
		let raw: RawStatus = self
			.http
			.get(format!("{url}/status"))
			.send()
			.await?
			.error_for_status()
			.map_err(MonitorError::from)?
			.json()
			.await
			.map_err(MonitorError::from)?;

		let (node_info, sync_info) = match raw.result {
			Some(r) => (r.node_info, r.sync_info),
			None => match (raw.node_info, raw.sync_info) {
				(Some(n), Some(s)) => (n, s),
				_ => return Err(MonitorError::Parse("status response missing result".into())),
			},
		};

		if node_info.network != self.chain_id {
			return Err(MonitorError::WrongChain {
				expected: self.chain_id.clone(),
				actual: node_info.network,
			});
		}

		Ok(StatusInfo {
			chain_id: node_info.network,
			catching_up: sync_info.catching_up,
			latest_block_height: sync_info.latest_block_height.parse().unwrap_or(0),
		})
	}

	/// Probes every non-quarantined endpoint and applies the up/down/syncing
	/// transitions.
	pub async fn probe_all(&self) {
		let urls: Vec<String> = {
			let nodes = self.nodes.read().await;
			nodes
				.iter()
				.filter(|n| !n.wrong_chain)
				.map(|n| n.url.clone())
				.collect()
		};

		for url in urls {
			match self.probe(&url).await {
				Ok(status) => {
					if status.latest_block_height > self.latest_height() {
						self.latest_height
							.store(status.latest_block_height, Ordering::Relaxed);
					}
					{
						let mut nodes = self.nodes.write().await;
						if let Some(node) = nodes.iter_mut().find(|n| n.url == url) {
							node.syncing = status.catching_up;
						}
					}
					if status.catching_up {
						debug!("endpoint {url} is catching up, not using it");
					} else {
						self.mark_up(&url).await;
					}
				}
				Err(e) => self.mark_down(&url, &e).await,
			}
		}
		self.update_no_endpoints().await;
	}

	async fn update_no_endpoints(&self) {
		let any_healthy = self
			.nodes
			.read()
			.await
			.iter()
			.any(|n| !n.down && !n.wrong_chain);
		let was = self.no_endpoints.swap(!any_healthy, Ordering::Relaxed);
		let mut since = self.no_endpoints_since.write().await;
		if any_healthy {
			*since = None;
		} else if !was || since.is_none() {
			since.get_or_insert_with(Utc::now);
		}
	}

	/// Probes the fleet on a fixed interval until shutdown.
	pub async fn run_health_loop(&self, mut shutdown: watch::Receiver<bool>) {
		let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = shutdown.changed() => break,
				_ = ticker.tick() => self.probe_all().await,
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::utils::http::{build_client, HttpClientConfig};

	fn fleet_with(server_url: &str, chain_id: &str) -> EndpointFleet {
		EndpointFleet::new(
			chain_id,
			&[NodeConfig {
				url: server_url.to_string(),
				alert_if_down: true,
			}],
			build_client(&HttpClientConfig {
				max_retries: 0,
				..Default::default()
			}),
		)
	}

	fn status_body(network: &str, height: &str, catching_up: bool) -> String {
		format!(
			r#"{{"jsonrpc":"2.0","id":-1,"result":{{
				"node_info":{{"network":"{network}"}},
				"sync_info":{{"latest_block_height":"{height}","catching_up":{catching_up}}}
			}}}}"#
		)
	}

	#[tokio::test]
	async fn probe_accepts_matching_chain_id() {
		let mut server = mockito::Server::new_async().await;
		server
			.mock("GET", "/status")
			.with_body(status_body("test-1", "100", false))
			.create_async()
			.await;

		let fleet = fleet_with(&server.url(), "test-1");
		let status = fleet.probe(&server.url()).await.unwrap();
		assert_eq!(status.chain_id, "test-1");
		assert_eq!(status.latest_block_height, 100);
		assert!(!status.catching_up);
	}

	#[tokio::test]
	async fn wrong_chain_quarantines_for_the_session() {
		let mut server = mockito::Server::new_async().await;
		server
			.mock("GET", "/status")
			.with_body(status_body("bar-2", "5", false))
			.create_async()
			.await;

		let fleet = fleet_with(&server.url(), "foo-1");
		fleet.probe_all().await;

		let nodes = fleet.nodes_snapshot().await;
		assert!(nodes[0].wrong_chain);
		assert!(nodes[0].down);
		assert!(matches!(fleet.pick().await, Err(MonitorError::NoEndpoints)));

		// recovery never lifts the quarantine
		fleet.mark_up(&nodes[0].url).await;
		assert!(matches!(fleet.pick().await, Err(MonitorError::NoEndpoints)));
	}

	#[tokio::test]
	async fn failover_prefers_the_healthy_endpoint() {
		let mut good = mockito::Server::new_async().await;
		good.mock("GET", "/status")
			.with_body(status_body("foo-1", "10", false))
			.create_async()
			.await;
		let mut bad = mockito::Server::new_async().await;
		bad.mock("GET", "/status")
			.with_body(status_body("bar-2", "10", false))
			.create_async()
			.await;

		let fleet = EndpointFleet::new(
			"foo-1",
			&[
				NodeConfig {
					url: good.url(),
					alert_if_down: true,
				},
				NodeConfig {
					url: bad.url(),
					alert_if_down: true,
				},
			],
			build_client(&HttpClientConfig {
				max_retries: 0,
				..Default::default()
			}),
		);
		fleet.probe_all().await;

		assert_eq!(fleet.pick().await.unwrap(), good.url());
		assert_eq!(fleet.healthy_count().await, 1);
		assert!(!fleet.no_endpoints());
	}

	#[tokio::test]
	async fn no_endpoints_flag_rises_and_clears() {
		let fleet = fleet_with("http://127.0.0.1:1", "test-1");
		fleet
			.mark_down("http://127.0.0.1:1", &MonitorError::Network("refused".into()))
			.await;
		assert!(fleet.no_endpoints());
		assert!(fleet.no_endpoints_since().await.is_some());

		fleet.mark_up("http://127.0.0.1:1").await;
		assert!(!fleet.no_endpoints());
		assert!(fleet.no_endpoints_since().await.is_none());
	}

	#[tokio::test]
	async fn syncing_endpoint_is_not_picked() {
		let mut server = mockito::Server::new_async().await;
		server
			.mock("GET", "/status")
			.with_body(status_body("test-1", "50", true))
			.create_async()
			.await;

		let fleet = fleet_with(&server.url(), "test-1");
		fleet.probe_all().await;
		let nodes = fleet.nodes_snapshot().await;
		assert!(nodes[0].syncing);
		// pick falls back to a syncing-but-reachable node rather than failing
		assert!(fleet.pick().await.is_ok());
	}

	#[tokio::test]
	async fn restored_down_state_is_applied() {
		let fleet = fleet_with("http://127.0.0.1:1", "test-1");
		let mut saved = std::collections::HashMap::new();
		let since = Utc::now() - chrono::Duration::minutes(10);
		saved.insert("http://127.0.0.1:1".to_string(), since);
		fleet.restore_down_state(&saved).await;

		let nodes = fleet.nodes_snapshot().await;
		assert!(nodes[0].down);
		assert!(nodes[0].was_down);
		assert_eq!(nodes[0].down_since, Some(since));
		assert!(fleet.no_endpoints());
	}
}
