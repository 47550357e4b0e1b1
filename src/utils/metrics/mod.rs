//! Prometheus metrics.
//!
//! Monitoring tasks do not touch gauges directly; they push `PromUpdate`
//! messages onto a channel and a single collector task applies them. That
//! keeps label handling in one place and the hot paths free of registry
//! locks.

pub mod server;

use prometheus::{GaugeVec, Opts, Registry, TextEncoder};
use tokio::sync::{mpsc, watch};

/// Which gauge an update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
	/// Seconds since the last observed block, finalized or not.
	LastBlockSeconds,
	/// Seconds a given RPC endpoint has been down.
	NodeDownSeconds,
	/// Slashing window size in blocks.
	WindowSize,
	/// Blocks missed within the slashing window.
	WindowMissed,
	/// Number of configured RPC endpoints.
	TotalNodes,
	/// Number of currently healthy RPC endpoints.
	HealthyNodes,
	/// Open governance proposals the validator has not voted on.
	UnvotedProposals,
	/// Open alerts for the chain.
	ActiveAlerts,
}

/// One gauge update emitted by a monitoring task.
#[derive(Debug, Clone)]
pub struct PromUpdate {
	pub kind: MetricKind,
	pub value: f64,
	pub chain_id: String,
	pub moniker: String,
	/// Only meaningful for per-endpoint metrics.
	pub endpoint: String,
}

/// The registry and the gauges exported on `/metrics`.
pub struct Metrics {
	registry: Registry,
	last_block_seconds: GaugeVec,
	node_down_seconds: GaugeVec,
	window_size: GaugeVec,
	window_missed: GaugeVec,
	total_nodes: GaugeVec,
	healthy_nodes: GaugeVec,
	unvoted_proposals: GaugeVec,
	active_alerts: GaugeVec,
}

impl Metrics {
	pub fn new() -> Result<Self, prometheus::Error> {
		let registry = Registry::new();
		let chain_labels = ["chain_id", "moniker"];

		let mk = |name: &str, help: &str, labels: &[&str]| -> Result<GaugeVec, prometheus::Error> {
			let gv = GaugeVec::new(Opts::new(name, help), labels)?;
			registry.register(Box::new(gv.clone()))?;
			Ok(gv)
		};

		Ok(Self {
			last_block_seconds: mk(
				"cometwatch_seconds_since_last_block",
				"Seconds since the most recent block was observed",
				&chain_labels,
			)?,
			node_down_seconds: mk(
				"cometwatch_node_down_seconds",
				"Seconds an RPC endpoint has been unreachable",
				&["chain_id", "moniker", "endpoint"],
			)?,
			window_size: mk(
				"cometwatch_signing_window_size",
				"Size of the slashing window in blocks",
				&chain_labels,
			)?,
			window_missed: mk(
				"cometwatch_window_missed_blocks",
				"Blocks missed inside the slashing window",
				&chain_labels,
			)?,
			total_nodes: mk(
				"cometwatch_total_nodes",
				"Configured RPC endpoints",
				&chain_labels,
			)?,
			healthy_nodes: mk(
				"cometwatch_healthy_nodes",
				"RPC endpoints currently passing health checks",
				&chain_labels,
			)?,
			unvoted_proposals: mk(
				"cometwatch_unvoted_open_proposals",
				"Open governance proposals without a vote from the validator",
				&chain_labels,
			)?,
			active_alerts: mk(
				"cometwatch_active_alerts",
				"Currently firing alerts",
				&chain_labels,
			)?,
			registry,
		})
	}

	pub fn apply(&self, update: &PromUpdate) {
		let chain = [update.chain_id.as_str(), update.moniker.as_str()];
		match update.kind {
			MetricKind::LastBlockSeconds => {
				self.last_block_seconds
					.with_label_values(&chain)
					.set(update.value);
			}
			MetricKind::NodeDownSeconds => {
				self.node_down_seconds
					.with_label_values(&[
						update.chain_id.as_str(),
						update.moniker.as_str(),
						update.endpoint.as_str(),
					])
					.set(update.value);
			}
			MetricKind::WindowSize => {
				self.window_size.with_label_values(&chain).set(update.value);
			}
			MetricKind::WindowMissed => {
				self.window_missed.with_label_values(&chain).set(update.value);
			}
			MetricKind::TotalNodes => {
				self.total_nodes.with_label_values(&chain).set(update.value);
			}
			MetricKind::HealthyNodes => {
				self.healthy_nodes.with_label_values(&chain).set(update.value);
			}
			MetricKind::UnvotedProposals => {
				self.unvoted_proposals
					.with_label_values(&chain)
					.set(update.value);
			}
			MetricKind::ActiveAlerts => {
				self.active_alerts.with_label_values(&chain).set(update.value);
			}
		}
	}

	/// Renders the registry in the Prometheus text exposition format.
	pub fn gather(&self) -> Result<String, prometheus::Error> {
		TextEncoder::new().encode_to_string(&self.registry.gather())
	}
}

/// Drains the stats channel into the registry until shutdown.
pub async fn run_collector(
	metrics: std::sync::Arc<Metrics>,
	mut rx: mpsc::Receiver<PromUpdate>,
	mut shutdown: watch::Receiver<bool>,
) {
	loop {
		tokio::select! {
			_ = shutdown.changed() => break,
			update = rx.recv() => match update {
				Some(u) => metrics.apply(&u),
				None => break,
			},
		}
	}
}
