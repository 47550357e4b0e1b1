//! Monitoring services.
//!
//! - `rpc`: endpoint fleet health and selection
//! - `subscriber`: websocket event intake
//! - `blocks`: block tape updates and signing attribution
//! - `provider`: typed chain-data queries (ABCI or indexer backed)
//! - `refresher`: periodic validator-state refresh
//! - `alerts`: rule evaluation and the alarm cache
//! - `notification`: outbound sinks
//! - `dashboard`: websocket/pull status publishing

pub mod alerts;
pub mod blocks;
pub mod dashboard;
pub mod notification;
pub mod provider;
pub mod refresher;
pub mod rpc;
pub mod subscriber;

use std::sync::Arc;

use reqwest_middleware::ClientWithMiddleware;
use tokio::sync::{mpsc, RwLock};

use crate::models::{ChainConfig, ChainState, ChainStatus, Config, MonitorError};
use crate::services::alerts::{cache::AlarmCache, AlertMsg};
use crate::services::dashboard::DashboardHub;
use crate::services::rpc::EndpointFleet;
use crate::utils::metrics::{MetricKind, PromUpdate};
use crate::utils::PriceClient;

/// The per-chain aggregate: configuration plus every piece of runtime state
/// the chain's tasks share.
pub struct Chain {
	pub name: String,
	pub config: ChainConfig,
	pub state: RwLock<ChainState>,
	pub fleet: Arc<EndpointFleet>,
}

impl Chain {
	pub fn new(name: String, config: ChainConfig, http: ClientWithMiddleware) -> Arc<Self> {
		let fleet = Arc::new(EndpointFleet::new(&config.chain_id, &config.nodes, http));
		Arc::new(Self {
			name,
			config,
			state: RwLock::new(ChainState::default()),
			fleet,
		})
	}

	/// Display label used in alert messages.
	pub fn label(&self) -> String {
		format!("{} ({})", self.name, self.config.chain_id)
	}

	pub async fn set_last_error(&self, err: &MonitorError) {
		self.state.write().await.last_error = Some(err.to_string());
	}

	/// Builds a metric update carrying this chain's labels.
	pub fn mk_update(&self, moniker: &str, kind: MetricKind, value: f64, endpoint: &str) -> PromUpdate {
		PromUpdate {
			kind,
			value,
			chain_id: self.config.chain_id.clone(),
			moniker: moniker.to_string(),
			endpoint: endpoint.to_string(),
		}
	}

	/// Builds the full dashboard status snapshot for this chain.
	pub async fn status(&self, active_alerts: usize) -> ChainStatus {
		let healthy = self.fleet.healthy_count().await;
		let total = self.fleet.total_count().await;
		let state = self.state.read().await;
		ChainStatus {
			msg_type: "status".to_string(),
			name: self.name.clone(),
			chain_id: self.config.chain_id.clone(),
			moniker: state.val.moniker.clone(),
			bonded: state.val.bonded,
			jailed: state.val.jailed,
			tombstoned: state.val.tombstoned,
			missed: state.val.missed,
			window: state.val.window,
			min_signed_per_window: state.val.min_signed_fraction,
			nodes: total,
			healthy_nodes: healthy,
			active_alerts,
			height: state.last_block_num,
			last_error: state.last_error.clone().unwrap_or_default(),
			unvoted_open_gov_proposals: state.unvoted_proposals.len(),
			total_bonded_tokens: state.economics.total_bonded_tokens,
			total_supply: state.economics.total_supply,
			community_tax: state.economics.community_tax,
			inflation_rate: state.economics.inflation_rate,
			base_apr: state.economics.base_apr,
			validator_apr: state.val.validator_apr,
			projected_30d_rewards: state.val.projected_30d_rewards,
			voting_power_percent: state.val.voting_power_percent,
			delegated_tokens: state.val.delegated_tokens,
			commission_rate: state.val.commission_rate,
			self_delegation_rewards: state.val.self_delegation_rewards.clone(),
			commission: state.val.commission.clone(),
			crypto_price: state.crypto_price.clone(),
			denom_metadata: state.denom_metadata.clone(),
			blocks: state.tape.snapshot(),
		}
	}
}

/// Process-wide shared handles. One per process, created at bootstrap and
/// dropped after the drain window.
pub struct App {
	pub cfg: Config,
	pub alarms: AlarmCache,
	pub alert_tx: mpsc::Sender<AlertMsg>,
	pub stats_tx: Option<mpsc::Sender<PromUpdate>>,
	pub dashboard: Arc<DashboardHub>,
	pub price: Option<Arc<PriceClient>>,
	pub http: ClientWithMiddleware,
}

impl App {
	/// Emits a metric update if the exporter is enabled. Never blocks the
	/// monitoring path: a full channel drops the sample.
	pub fn stat(&self, update: PromUpdate) {
		if let Some(tx) = &self.stats_tx {
			let _ = tx.try_send(update);
		}
	}

	/// Pushes a fresh status snapshot for `chain` to the dashboard and the
	/// active-alert gauge.
	pub async fn publish_status(&self, chain: &Chain) {
		let active = self.alarms.active_count(&chain.name).await;
		{
			let mut state = chain.state.write().await;
			state.active_alerts = active;
		}
		let status = chain.status(active).await;
		self.stat(chain.mk_update(
			&status.moniker,
			MetricKind::ActiveAlerts,
			active as f64,
			"",
		));
		self.stat(chain.mk_update(
			&status.moniker,
			MetricKind::HealthyNodes,
			status.healthy_nodes as f64,
			"",
		));
		self.dashboard.publish_status(status).await;
	}
}
