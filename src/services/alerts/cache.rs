//! The process-wide alarm cache.
//!
//! Tracks which alerts are open per chain (the canonical map) and which have
//! actually been delivered per sink (the mirrors). The mirrors are what stop
//! duplicate notifications: an alert id present in a sink's mirror means that
//! sink already saw the fire and must not see it again until it resolves.
//!
//! Invariant: at most one open instance of a given alert id per chain. A
//! resolve is deliverable on a sink if and only if that sink delivered the
//! corresponding fire.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::models::Severity;
use crate::services::alerts::{AlertMsg, GOVERNANCE_RULE};

/// How long a repeated fire of the same id is considered flapping on the
/// paging sink.
const FLAP_WINDOW_MINUTES: i64 = 5;

/// The notification sinks with dedup mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
	Pagerduty,
	Telegram,
	Discord,
	Slack,
}

impl Sink {
	pub fn name(self) -> &'static str {
		match self {
			Sink::Pagerduty => "PagerDuty",
			Sink::Telegram => "Telegram",
			Sink::Discord => "Discord",
			Sink::Slack => "Slack",
		}
	}
}

/// A delivered or open alert as stored in the cache and the state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEntry {
	pub message: String,
	pub sent_time: DateTime<Utc>,
}

/// Serialized form of the cache, embedded in the persisted state file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedAlarms {
	#[serde(default)]
	pub sent_pd_alarms: HashMap<String, AlarmEntry>,
	#[serde(default)]
	pub sent_tg_alarms: HashMap<String, AlarmEntry>,
	#[serde(default)]
	pub sent_di_alarms: HashMap<String, AlarmEntry>,
	#[serde(default)]
	pub sent_slk_alarms: HashMap<String, AlarmEntry>,
	#[serde(default)]
	pub sent_all_alarms: HashMap<String, HashMap<String, AlarmEntry>>,
}

impl SavedAlarms {
	/// Drops entries older than `max_age`. Anything that stale is
	/// re-evaluated from scratch after a restart.
	pub fn prune_stale(&mut self, now: DateTime<Utc>, max_age: Duration) {
		let cutoff = now - max_age;
		let keep = |map: &mut HashMap<String, AlarmEntry>| {
			map.retain(|id, entry| {
				if entry.sent_time < cutoff {
					info!("not restoring stale alarm {id}");
					false
				} else {
					true
				}
			});
		};
		keep(&mut self.sent_pd_alarms);
		keep(&mut self.sent_tg_alarms);
		keep(&mut self.sent_di_alarms);
		keep(&mut self.sent_slk_alarms);
		for chain in self.sent_all_alarms.values_mut() {
			keep(chain);
		}
		self.sent_all_alarms.retain(|_, v| !v.is_empty());
	}
}

#[derive(Default)]
struct Inner {
	sent_pd: HashMap<String, AlarmEntry>,
	sent_tg: HashMap<String, AlarmEntry>,
	sent_di: HashMap<String, AlarmEntry>,
	sent_slk: HashMap<String, AlarmEntry>,
	/// chain name -> alert id -> entry
	all: HashMap<String, HashMap<String, AlarmEntry>>,
	/// "{chain}/{alert id}" -> last fire attempt; not persisted
	flapping: HashMap<String, DateTime<Utc>>,
}

impl Inner {
	fn mirror_mut(&mut self, sink: Sink) -> &mut HashMap<String, AlarmEntry> {
		match sink {
			Sink::Pagerduty => &mut self.sent_pd,
			Sink::Telegram => &mut self.sent_tg,
			Sink::Discord => &mut self.sent_di,
			Sink::Slack => &mut self.sent_slk,
		}
	}
}

/// Shared dedup state for every chain and sink. One per process.
#[derive(Default)]
pub struct AlarmCache {
	inner: RwLock<Inner>,
}

impl AlarmCache {
	pub fn new() -> Self {
		Self::default()
	}

	/// Decides whether `msg` should actually be sent on `sink`, updating the
	/// sink mirror as a side effect.
	///
	/// * fires below the sink's severity threshold are dropped;
	/// * duplicate fires are dropped, except governance reminders older than
	///   `reminder_interval`, which are re-sent;
	/// * fires repeated within five minutes are suppressed as flapping on the
	///   paging sink;
	/// * resolves pass only when the mirror holds the corresponding fire
	///   (which also exempts them from the severity filter).
	pub async fn should_notify(
		&self,
		msg: &AlertMsg,
		sink: Sink,
		threshold: Severity,
		reminder_interval: Duration,
		now: DateTime<Utc>,
	) -> bool {
		let mut inner = self.inner.write().await;

		if msg.resolved {
			let mirror = inner.mirror_mut(sink);
			return match mirror.remove(&msg.alert_id) {
				Some(_) => {
					info!(
						"resolved alarm on {} ({}) - notifying {}",
						msg.chain_label,
						msg.message,
						sink.name()
					);
					true
				}
				None => {
					debug!(
						"not clearing alarm on {} ({}) - no corresponding alert was sent to {}",
						msg.chain_label,
						msg.message,
						sink.name()
					);
					false
				}
			};
		}

		if msg.severity < threshold {
			return false;
		}

		let flap_key = format!("{}/{}", msg.chain_name, msg.alert_id);
		if let Some(entry) = inner.mirror_mut(sink).get(&msg.alert_id).cloned() {
			// already firing; only governance reminders are re-sent
			let is_reminder = msg.alert_id.starts_with(GOVERNANCE_RULE)
				&& now - entry.sent_time >= reminder_interval;
			if is_reminder {
				info!(
					"re-sending alert on {} ({}) - notifying {}",
					msg.chain_label,
					msg.message,
					sink.name()
				);
				inner.mirror_mut(sink).insert(
					msg.alert_id.clone(),
					AlarmEntry {
						message: msg.message.clone(),
						sent_time: now,
					},
				);
				return true;
			}
			return false;
		}

		if sink == Sink::Pagerduty {
			if let Some(last) = inner.flapping.get(&flap_key) {
				if now - *last < Duration::minutes(FLAP_WINDOW_MINUTES) {
					warn!(
						"flapping detected - suppressing pagerduty notification: {} {}",
						msg.chain_label, msg.message
					);
					return false;
				}
			}
			inner.flapping.insert(flap_key, now);
		}

		info!(
			"ALERT: new alarm on {} ({}) - notifying {}",
			msg.chain_label,
			msg.message,
			sink.name()
		);
		inner.mirror_mut(sink).insert(
			msg.alert_id.clone(),
			AlarmEntry {
				message: msg.message.clone(),
				sent_time: now,
			},
		);
		true
	}

	/// Records a fire in the canonical per-chain map. Returns false when the
	/// alert was already open (an idempotent no-op).
	pub async fn record_fire(
		&self,
		chain: &str,
		alert_id: &str,
		message: &str,
		now: DateTime<Utc>,
	) -> bool {
		let mut inner = self.inner.write().await;
		let chain_map = inner.all.entry(chain.to_string()).or_default();
		if chain_map.contains_key(alert_id) {
			return false;
		}
		chain_map.insert(
			alert_id.to_string(),
			AlarmEntry {
				message: message.to_string(),
				sent_time: now,
			},
		);
		true
	}

	/// Removes a fire from the canonical map. Returns false when nothing was
	/// open under the id.
	pub async fn record_resolve(&self, chain: &str, alert_id: &str) -> bool {
		let mut inner = self.inner.write().await;
		inner
			.all
			.get_mut(chain)
			.map(|m| m.remove(alert_id).is_some())
			.unwrap_or(false)
	}

	pub async fn contains(&self, chain: &str, alert_id: &str) -> bool {
		self.inner
			.read()
			.await
			.all
			.get(chain)
			.map(|m| m.contains_key(alert_id))
			.unwrap_or(false)
	}

	pub async fn active_count(&self, chain: &str) -> usize {
		self.inner
			.read()
			.await
			.all
			.get(chain)
			.map(|m| m.len())
			.unwrap_or(0)
	}

	/// Open alert ids for a chain, used by the governance rule to resolve
	/// proposals that left the unvoted set.
	pub async fn active_ids(&self, chain: &str) -> Vec<String> {
		self.inner
			.read()
			.await
			.all
			.get(chain)
			.map(|m| m.keys().cloned().collect())
			.unwrap_or_default()
	}

	/// Open alert messages for a chain, shown on the dashboard.
	pub async fn active_messages(&self, chain: &str) -> Vec<String> {
		self.inner
			.read()
			.await
			.all
			.get(chain)
			.map(|m| m.values().map(|e| e.message.clone()).collect())
			.unwrap_or_default()
	}

	/// Serializes the cache for the state file.
	pub async fn snapshot(&self) -> SavedAlarms {
		let inner = self.inner.read().await;
		SavedAlarms {
			sent_pd_alarms: inner.sent_pd.clone(),
			sent_tg_alarms: inner.sent_tg.clone(),
			sent_di_alarms: inner.sent_di.clone(),
			sent_slk_alarms: inner.sent_slk.clone(),
			sent_all_alarms: inner.all.clone(),
		}
	}

	/// Replaces the cache contents with a restored snapshot. Callers prune
	/// stale entries first.
	pub async fn restore(&self, saved: SavedAlarms) {
		let mut inner = self.inner.write().await;
		inner.sent_pd = saved.sent_pd_alarms;
		inner.sent_tg = saved.sent_tg_alarms;
		inner.sent_di = saved.sent_di_alarms;
		inner.sent_slk = saved.sent_slk_alarms;
		inner.all = saved.sent_all_alarms;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn msg(id: &str, severity: Severity, resolved: bool) -> AlertMsg {
		AlertMsg {
			chain_name: "testchain".into(),
			chain_label: "testchain (test-1)".into(),
			alert_id: id.into(),
			message: format!("message for {id}"),
			severity,
			resolved,
			pagerduty: None,
			discord: None,
			telegram: None,
			slack: None,
		}
	}

	fn now() -> DateTime<Utc> {
		Utc::now()
	}

	const REMINDER: fn() -> Duration = || Duration::hours(6);

	#[tokio::test]
	async fn duplicate_fire_is_suppressed() {
		let cache = AlarmCache::new();
		let m = msg("ConsecutiveBlocksMissed_val1", Severity::Critical, false);
		assert!(
			cache
				.should_notify(&m, Sink::Telegram, Severity::Info, REMINDER(), now())
				.await
		);
		assert!(
			!cache
				.should_notify(&m, Sink::Telegram, Severity::Info, REMINDER(), now())
				.await
		);
	}

	#[tokio::test]
	async fn severity_threshold_filters_fires_per_sink() {
		let cache = AlarmCache::new();
		let m = msg("PercentageBlocksMissed_val1", Severity::Warning, false);
		assert!(
			!cache
				.should_notify(&m, Sink::Pagerduty, Severity::Critical, REMINDER(), now())
				.await
		);
		assert!(
			cache
				.should_notify(&m, Sink::Slack, Severity::Info, REMINDER(), now())
				.await
		);
	}

	#[tokio::test]
	async fn resolve_requires_prior_delivery() {
		let cache = AlarmCache::new();
		let fire = msg("PercentageBlocksMissed_val1", Severity::Warning, false);
		let resolve = msg("PercentageBlocksMissed_val1", Severity::Warning, true);

		// the paging sink never saw the fire, so it must not see the resolve
		assert!(
			!cache
				.should_notify(&fire, Sink::Pagerduty, Severity::Critical, REMINDER(), now())
				.await
		);
		assert!(
			!cache
				.should_notify(&resolve, Sink::Pagerduty, Severity::Critical, REMINDER(), now())
				.await
		);

		// the chat sink saw the fire, so the resolve passes even though the
		// severity is below nothing in particular
		assert!(
			cache
				.should_notify(&fire, Sink::Slack, Severity::Info, REMINDER(), now())
				.await
		);
		assert!(
			cache
				.should_notify(&resolve, Sink::Slack, Severity::Info, REMINDER(), now())
				.await
		);
		// and only once
		assert!(
			!cache
				.should_notify(&resolve, Sink::Slack, Severity::Info, REMINDER(), now())
				.await
		);
	}

	#[tokio::test]
	async fn pagerduty_flap_suppression() {
		let cache = AlarmCache::new();
		let fire = msg("RPCNodeDown_val1_http://x", Severity::Critical, false);
		let resolve = msg("RPCNodeDown_val1_http://x", Severity::Critical, true);
		let t0 = now();

		assert!(
			cache
				.should_notify(&fire, Sink::Pagerduty, Severity::Info, REMINDER(), t0)
				.await
		);
		assert!(
			cache
				.should_notify(&resolve, Sink::Pagerduty, Severity::Info, REMINDER(), t0)
				.await
		);
		// immediate re-fire inside the flap window is suppressed
		assert!(
			!cache
				.should_notify(&fire, Sink::Pagerduty, Severity::Info, REMINDER(), t0)
				.await
		);
		// after the window has passed it fires again
		let later = t0 + Duration::minutes(FLAP_WINDOW_MINUTES + 1);
		assert!(
			cache
				.should_notify(&fire, Sink::Pagerduty, Severity::Info, REMINDER(), later)
				.await
		);
	}

	#[tokio::test]
	async fn governance_reminder_cadence() {
		let cache = AlarmCache::new();
		let m = msg(
			&format!("{GOVERNANCE_RULE}_val1_42"),
			Severity::Warning,
			false,
		);
		let t0 = now();
		assert!(
			cache
				.should_notify(&m, Sink::Discord, Severity::Info, REMINDER(), t0)
				.await
		);
		// before the reminder interval: suppressed
		assert!(
			!cache
				.should_notify(&m, Sink::Discord, Severity::Info, REMINDER(), t0 + Duration::hours(5))
				.await
		);
		// after: re-sent
		assert!(
			cache
				.should_notify(&m, Sink::Discord, Severity::Info, REMINDER(), t0 + Duration::hours(6))
				.await
		);
		// the reminder clock restarts
		assert!(
			!cache
				.should_notify(&m, Sink::Discord, Severity::Info, REMINDER(), t0 + Duration::hours(7))
				.await
		);
	}

	#[tokio::test]
	async fn canonical_map_is_idempotent() {
		let cache = AlarmCache::new();
		assert!(cache.record_fire("c", "A_v", "m", now()).await);
		assert!(!cache.record_fire("c", "A_v", "m", now()).await);
		assert_eq!(cache.active_count("c").await, 1);
		assert!(cache.record_resolve("c", "A_v").await);
		assert!(!cache.record_resolve("c", "A_v").await);
		assert_eq!(cache.active_count("c").await, 0);
	}

	#[tokio::test]
	async fn snapshot_restore_round_trip() {
		let cache = AlarmCache::new();
		let m = msg("ValidatorInactive_val1", Severity::Critical, false);
		cache
			.should_notify(&m, Sink::Telegram, Severity::Info, REMINDER(), now())
			.await;
		cache.record_fire("testchain", &m.alert_id, &m.message, now()).await;

		let snap = cache.snapshot().await;
		let other = AlarmCache::new();
		other.restore(snap.clone()).await;
		assert_eq!(other.snapshot().await, snap);
		assert!(other.contains("testchain", "ValidatorInactive_val1").await);

		// restored mirror still dedups the fire and delivers the resolve
		assert!(
			!other
				.should_notify(&m, Sink::Telegram, Severity::Info, REMINDER(), now())
				.await
		);
		let resolve = msg("ValidatorInactive_val1", Severity::Critical, true);
		assert!(
			other
				.should_notify(&resolve, Sink::Telegram, Severity::Info, REMINDER(), now())
				.await
		);
	}

	#[tokio::test]
	async fn stale_entries_are_pruned() {
		let cache = AlarmCache::new();
		let m = msg("ChainStalled_val1", Severity::Critical, false);
		let old = now() - Duration::hours(30);
		cache
			.should_notify(&m, Sink::Slack, Severity::Info, REMINDER(), old)
			.await;
		cache.record_fire("testchain", &m.alert_id, &m.message, old).await;

		let mut snap = cache.snapshot().await;
		snap.prune_stale(now(), Duration::hours(24));
		assert!(snap.sent_slk_alarms.is_empty());
		assert!(snap.sent_all_alarms.is_empty());
	}
}
