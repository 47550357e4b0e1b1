//! Rule evaluation.
//!
//! A per-chain evaluator runs every two seconds and applies each rule
//! independently against the chain's current state. Rule firing state is
//! derived from the canonical alarm map, so it survives restarts: a rule
//! fires when its condition holds and no alert is open under its id, and
//! resolves when the condition clears while one is.

pub mod cache;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

use crate::models::{ProposalRef, Severity, TapeCounters, ValInfo};
use crate::services::{App, Chain};
use crate::utils::metrics::MetricKind;

/// Rule name prefixes; alert ids are `<rule>_<valoper>[_<qualifier>]`.
pub const STALLED_RULE: &str = "ChainStalled";
pub const NO_ENDPOINTS_RULE: &str = "NoRPCEndpoints";
pub const INACTIVE_RULE: &str = "ValidatorInactive";
pub const CONSECUTIVE_RULE: &str = "ConsecutiveBlocksMissed";
pub const PERCENTAGE_RULE: &str = "PercentageBlocksMissed";
pub const CONSECUTIVE_EMPTY_RULE: &str = "ConsecutiveEmptyBlocks";
pub const PERCENTAGE_EMPTY_RULE: &str = "PercentageEmptyBlocks";
pub const NODE_DOWN_RULE: &str = "RPCNodeDown";
pub const STAKE_CHANGE_RULE: &str = "StakeChange";
pub const UNCLAIMED_REWARDS_RULE: &str = "UnclaimedRewards";
pub const GOVERNANCE_RULE: &str = "UnvotedGovernanceProposal";

const EVALUATION_INTERVAL: Duration = Duration::from_secs(2);

/// Delivery coordinates for the paging sink.
#[derive(Debug, Clone)]
pub struct PagerdutyRoute {
	pub api_key: String,
	pub threshold: Severity,
}

/// Delivery coordinates for a webhook-style chat sink.
#[derive(Debug, Clone)]
pub struct WebhookRoute {
	pub webhook: String,
	pub mentions: String,
	pub threshold: Severity,
}

/// Delivery coordinates for the Telegram bot sink.
#[derive(Debug, Clone)]
pub struct TelegramRoute {
	pub api_key: String,
	pub channel: String,
	pub mentions: String,
	pub threshold: Severity,
}

/// A fire or resolve on its way to the notifier fan-out.
#[derive(Debug, Clone)]
pub struct AlertMsg {
	pub chain_name: String,
	pub chain_label: String,
	pub alert_id: String,
	pub message: String,
	pub severity: Severity,
	pub resolved: bool,
	pub pagerduty: Option<PagerdutyRoute>,
	pub discord: Option<WebhookRoute>,
	pub telegram: Option<TelegramRoute>,
	pub slack: Option<WebhookRoute>,
}

/// Point-in-time copy of the fields the rules consume.
struct Snapshot {
	val: ValInfo,
	last_val: Option<ValInfo>,
	counters: TapeCounters,
	last_block_time: Option<DateTime<Utc>>,
	unvoted: Vec<ProposalRef>,
}

/// The per-chain rule evaluator.
pub struct AlertEngine {
	chain: Arc<Chain>,
	app: Arc<App>,
}

impl AlertEngine {
	pub fn new(chain: Arc<Chain>, app: Arc<App>) -> Self {
		Self { chain, app }
	}

	/// Evaluates on a fixed cadence until shutdown.
	pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
		let mut ticker = tokio::time::interval(EVALUATION_INTERVAL);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = shutdown.changed() => break,
				_ = ticker.tick() => self.evaluate(Utc::now()).await,
			}
		}
	}

	/// The identity used in alert ids.
	fn val_key(&self) -> &str {
		if self.chain.config.valoper_address.is_empty() {
			&self.chain.config.valcons_override
		} else {
			&self.chain.config.valoper_address
		}
	}

	fn routes(
		&self,
	) -> (
		Option<PagerdutyRoute>,
		Option<WebhookRoute>,
		Option<TelegramRoute>,
		Option<WebhookRoute>,
	) {
		let defaults = &self.app.cfg.default_alert_config;
		let alerts = &self.chain.config.alerts;
		let on = |d: &Option<bool>, c: &Option<bool>| d.unwrap_or(false) && c.unwrap_or(false);
		let join = |m: &Option<Vec<String>>| m.clone().unwrap_or_default().join(" ");

		let pagerduty = (on(&defaults.pagerduty.enabled, &alerts.pagerduty.enabled))
			.then(|| alerts.pagerduty.api_key.clone().unwrap_or_default())
			.filter(|key| !key.is_empty())
			.map(|api_key| PagerdutyRoute {
				api_key,
				threshold: alerts.pagerduty.severity_threshold.unwrap_or(Severity::Info),
			});

		let discord = (on(&defaults.discord.enabled, &alerts.discord.enabled))
			.then(|| alerts.discord.webhook.clone().unwrap_or_default())
			.filter(|hook| !hook.is_empty())
			.map(|webhook| WebhookRoute {
				webhook,
				mentions: join(&alerts.discord.mentions),
				threshold: alerts.discord.severity_threshold.unwrap_or(Severity::Info),
			});

		let telegram = (on(&defaults.telegram.enabled, &alerts.telegram.enabled))
			.then(|| alerts.telegram.api_key.clone().unwrap_or_default())
			.filter(|key| !key.is_empty())
			.map(|api_key| TelegramRoute {
				api_key,
				channel: alerts.telegram.channel.clone().unwrap_or_default(),
				mentions: join(&alerts.telegram.mentions),
				threshold: alerts.telegram.severity_threshold.unwrap_or(Severity::Info),
			});

		let slack = (on(&defaults.slack.enabled, &alerts.slack.enabled))
			.then(|| alerts.slack.webhook.clone().unwrap_or_default())
			.filter(|hook| !hook.is_empty())
			.map(|webhook| WebhookRoute {
				webhook,
				mentions: join(&alerts.slack.mentions),
				threshold: alerts.slack.severity_threshold.unwrap_or(Severity::Info),
			});

		(pagerduty, discord, telegram, slack)
	}

	/// Records the transition in the canonical map and forwards the alert to
	/// the notifier channel. Resolves with no open alert are discarded.
	async fn dispatch(
		&self,
		alert_id: String,
		message: String,
		severity: Severity,
		resolved: bool,
		now: DateTime<Utc>,
	) {
		if resolved {
			if !self.app.alarms.record_resolve(&self.chain.name, &alert_id).await {
				debug!(
					"ignoring resolve for {alert_id} on {}: nothing is firing",
					self.chain.name
				);
				return;
			}
		} else {
			self.app
				.alarms
				.record_fire(&self.chain.name, &alert_id, &message, now)
				.await;
		}

		let (pagerduty, discord, telegram, slack) = self.routes();
		let msg = AlertMsg {
			chain_name: self.chain.name.clone(),
			chain_label: self.chain.label(),
			alert_id,
			message,
			severity,
			resolved,
			pagerduty,
			discord,
			telegram,
			slack,
		};
		// bounded channel: a saturated notifier applies backpressure here
		if self.app.alert_tx.send(msg).await.is_err() {
			debug!("alert channel closed, dropping alert");
		}
	}

	/// Fires or resolves a simple threshold rule based on the canonical map.
	async fn transition(
		&self,
		alert_id: String,
		message: String,
		severity: Severity,
		firing: bool,
		now: DateTime<Utc>,
	) {
		let open = self.app.alarms.contains(&self.chain.name, &alert_id).await;
		if firing && !open {
			self.dispatch(alert_id, message, severity, false, now).await;
		} else if !firing && open {
			self.dispatch(alert_id, message, severity, true, now).await;
		}
	}

	/// Runs every rule once against the current state.
	pub async fn evaluate(&self, now: DateTime<Utc>) {
		let snap = {
			let state = self.chain.state.read().await;
			Snapshot {
				val: state.val.clone(),
				last_val: state.last_val.clone(),
				counters: state.tape.counters,
				last_block_time: state.last_block_time,
				unvoted: state.unvoted_proposals.clone(),
			}
		};
		let alerts = self.chain.config.alerts.clone();
		let chain_id = &self.chain.config.chain_id;
		let val = self.val_key().to_string();

		// chain stalled
		if alerts.stalled_enabled.unwrap_or(false) {
			if let Some(last) = snap.last_block_time {
				let minutes = alerts.stalled_minutes.unwrap_or(10);
				let stalled = now - last >= chrono::Duration::minutes(minutes);
				self.transition(
					format!("{STALLED_RULE}_{val}"),
					format!("stalled: no new blocks on {chain_id} in {minutes} minutes"),
					Severity::Critical,
					stalled,
					now,
				)
				.await;
			}
		}

		// every endpoint down
		if alerts.alert_if_no_servers.unwrap_or(false) {
			let sustained = match self.chain.fleet.no_endpoints_since().await {
				Some(since) => {
					now - since >= chrono::Duration::minutes(self.app.cfg.node_down_alert_minutes)
				}
				None => false,
			};
			self.transition(
				format!("{NO_ENDPOINTS_RULE}_{val}"),
				format!("no RPC endpoints are working for {chain_id}"),
				Severity::Critical,
				sustained,
				now,
			)
			.await;
		}

		// validator left or rejoined the active set
		if alerts.alert_if_inactive.unwrap_or(false) {
			if let Some(last) = &snap.last_val {
				// guard against comparing snapshots of different validators
				if last.moniker == snap.val.moniker {
					let id = format!("{INACTIVE_RULE}_{val}");
					let state_word = if snap.val.tombstoned {
						"tombstoned"
					} else {
						"jailed"
					};
					if last.bonded && !snap.val.bonded {
						self.dispatch(
							id,
							format!(
								"{} is no longer active: validator {val} is {state_word} on {chain_id}",
								snap.val.moniker
							),
							Severity::Critical,
							false,
							now,
						)
						.await;
					} else if !last.bonded && snap.val.bonded {
						self.dispatch(
							id,
							format!(
								"{} is no longer active: validator {val} is {state_word} on {chain_id}",
								snap.val.moniker
							),
							Severity::Critical,
							true,
							now,
						)
						.await;
					}
				}
			}
		}

		// consecutive missed blocks
		if alerts.consecutive_enabled.unwrap_or(false) {
			let threshold = alerts.consecutive_missed.unwrap_or(5).max(1) as u64;
			self.transition(
				format!("{CONSECUTIVE_RULE}_{val}"),
				format!(
					"{} has missed {threshold} consecutive blocks on {chain_id}",
					snap.val.moniker
				),
				alerts.consecutive_priority.unwrap_or(Severity::Critical),
				snap.counters.consecutive_missed >= threshold,
				now,
			)
			.await;
		}

		// percentage of the slashing window missed
		if alerts.percentage_enabled.unwrap_or(false) && snap.val.window > 0 {
			let threshold = alerts.percentage_missed.unwrap_or(10);
			let pct = 100.0 * snap.val.missed as f64 / snap.val.window as f64;
			self.transition(
				format!("{PERCENTAGE_RULE}_{val}"),
				format!(
					"{} has missed more than {threshold}% of the slashing window on {chain_id}",
					snap.val.moniker
				),
				alerts.percentage_priority.unwrap_or(Severity::Warning),
				pct >= threshold as f64,
				now,
			)
			.await;
		}

		// consecutive empty proposals
		if alerts.consecutive_empty_enabled.unwrap_or(false) {
			let threshold = alerts.consecutive_empty.unwrap_or(5).max(1) as u64;
			self.transition(
				format!("{CONSECUTIVE_EMPTY_RULE}_{val}"),
				format!(
					"{} has proposed {threshold} consecutive empty blocks on {chain_id}",
					snap.val.moniker
				),
				alerts
					.consecutive_empty_priority
					.unwrap_or(Severity::Warning),
				snap.counters.consecutive_empty >= threshold,
				now,
			)
			.await;
		}

		// percentage of proposals empty
		if alerts.empty_percentage_enabled.unwrap_or(false) && snap.counters.total_proposed > 0 {
			let threshold = alerts.empty_percentage.unwrap_or(25);
			self.transition(
				format!("{PERCENTAGE_EMPTY_RULE}_{val}"),
				format!(
					"{} has more than {threshold}% empty blocks ({} of {} proposed) on {chain_id}",
					snap.val.moniker,
					snap.counters.total_proposed_empty,
					snap.counters.total_proposed
				),
				alerts.empty_percentage_priority.unwrap_or(Severity::Warning),
				snap.counters.empty_percent() >= threshold as f64,
				now,
			)
			.await;
		}

		// individual endpoints down
		let node_down_severity = self
			.app
			.cfg
			.node_down_alert_severity
			.unwrap_or(Severity::Critical);
		for node in self.chain.fleet.nodes_snapshot().await {
			if !node.alert_if_down {
				continue;
			}
			let id = format!("{NODE_DOWN_RULE}_{val}_{}", node.url);
			let message = format!(
				"RPC node {} has been down for more than {} minutes on {chain_id}",
				node.url, self.app.cfg.node_down_alert_minutes
			);
			let open = self.app.alarms.contains(&self.chain.name, &id).await;
			let overdue = node.down
				&& node
					.down_since
					.map(|since| {
						now - since
							>= chrono::Duration::minutes(self.app.cfg.node_down_alert_minutes)
					})
					.unwrap_or(false);
			if overdue && !open {
				self.dispatch(id, message, node_down_severity, false, now).await;
			} else if !node.down && open {
				self.dispatch(id, message, node_down_severity, true, now).await;
				self.chain.fleet.clear_was_down(&node.url).await;
			}
		}

		// stake moved more than the configured share
		if alerts.stake_change_alerts.unwrap_or(false) {
			if let Some(last) = &snap.last_val {
				if last.delegated_tokens > 0.0 && snap.val.delegated_tokens > 0.0 {
					let change =
						(snap.val.delegated_tokens - last.delegated_tokens) / last.delegated_tokens;
					let (trend, threshold) = if change < 0.0 {
						("dropped", alerts.stake_change_drop_threshold.unwrap_or(0.05))
					} else {
						(
							"increased",
							alerts.stake_change_increase_threshold.unwrap_or(0.05),
						)
					};
					self.transition(
						format!("{STAKE_CHANGE_RULE}_{val}"),
						format!(
							"{}'s stake has {trend} more than {:.1}% since the previous check",
							snap.val.moniker,
							threshold * 100.0
						),
						Severity::Warning,
						change.abs() >= threshold,
						now,
					)
					.await;
				}
			}
		}

		// unclaimed rewards above the fiat threshold
		if alerts.unclaimed_rewards_alerts.unwrap_or(false) {
			if let Some(price_client) = &self.app.price {
				if !self.chain.config.slug.is_empty() {
					match price_client.price(&self.chain.config.slug).await {
						Ok(price) => {
							let total: f64 = snap
								.val
								.self_delegation_rewards
								.iter()
								.chain(snap.val.commission.iter())
								.map(|c| c.amount)
								.sum();
							let fiat = total * price.price;
							let threshold = alerts
								.unclaimed_rewards_threshold_in_fiat_currency
								.unwrap_or(1000.0);
							self.transition(
								format!("{UNCLAIMED_REWARDS_RULE}_{val}"),
								format!(
									"{} has more than {threshold:.0} {} in unclaimed rewards on {}",
									snap.val.moniker,
									price_client.currency(),
									self.chain.name
								),
								Severity::Warning,
								fiat > threshold,
								now,
							)
							.await;
						}
						Err(e) => debug!("skipping unclaimed-rewards check: {e}"),
					}
				}
			}
		}

		// unvoted governance proposals: fire per open proposal, resolve ids
		// whose proposal left the unvoted set
		if alerts.governance_alerts.unwrap_or(false) {
			let prefix = format!("{GOVERNANCE_RULE}_{val}_");
			for proposal in &snap.unvoted {
				let id = format!("{prefix}{}", proposal.proposal_id);
				let deadline = proposal
					.voting_end_time
					.map(|t| format!(", deadline: {} UTC", t.format("%Y-%m-%d %H:%M")))
					.unwrap_or_default();
				// dispatched every cycle; the per-sink mirrors reduce this to
				// the initial send plus interval reminders
				self.dispatch(
					id,
					format!(
						"open proposal #{} has not been voted on by {} on {}{deadline}",
						proposal.proposal_id, snap.val.moniker, self.chain.name
					),
					Severity::Warning,
					false,
					now,
				)
				.await;
			}

			for id in self.app.alarms.active_ids(&self.chain.name).await {
				let Some(raw) = id.strip_prefix(&prefix) else {
					continue;
				};
				let Ok(proposal_id) = raw.parse::<u64>() else {
					continue;
				};
				if !snap.unvoted.iter().any(|p| p.proposal_id == proposal_id) {
					self.dispatch(
						id,
						format!(
							"open proposal #{proposal_id} has not been voted on by {} on {}",
							snap.val.moniker, self.chain.name
						),
						Severity::Warning,
						true,
						now,
					)
					.await;
				}
			}
		}

		// metrics that track wall-clock state
		if let Some(last) = snap.last_block_time {
			self.app.stat(self.chain.mk_update(
				&snap.val.moniker,
				MetricKind::LastBlockSeconds,
				(now - last).num_milliseconds() as f64 / 1000.0,
				"",
			));
		}
		for node in self.chain.fleet.nodes_snapshot().await {
			if node.down {
				if let Some(since) = node.down_since {
					self.app.stat(self.chain.mk_update(
						&snap.val.moniker,
						MetricKind::NodeDownSeconds,
						(now - since).num_milliseconds() as f64 / 1000.0,
						&node.url,
					));
				}
			}
		}

		self.app.publish_status(&self.chain).await;
	}
}
