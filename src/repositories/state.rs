//! Durable monitor state.
//!
//! A JSON snapshot of the alarm cache, the block tapes, and the node-down
//! bookkeeping is written at shutdown and on a best-effort timer, and read
//! back at startup. Restoring it prevents duplicate alerts across restarts
//! and keeps the dashboard tape populated. Alarm entries older than 24 hours
//! are considered stale and dropped on load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::models::blocks::BlockTape;
use crate::services::alerts::cache::SavedAlarms;
use crate::services::{App, Chain};

/// Alarm entries older than this are not restored.
const STALE_HOURS: i64 = 24;
/// Cadence of the best-effort background save.
const SAVE_INTERVAL: Duration = Duration::from_secs(300);

/// Everything the monitor persists between runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SavedState {
	#[serde(default)]
	pub alarms: SavedAlarms,
	/// chain name -> tape snapshot, oldest outcome first.
	#[serde(default)]
	pub blocks: HashMap<String, Vec<i8>>,
	/// chain name -> endpoint url -> down-since timestamp.
	#[serde(default)]
	pub nodes_down: HashMap<String, HashMap<String, DateTime<Utc>>>,
}

/// Reads the state file. Any failure is logged and treated as a cold start.
pub fn load(path: &Path) -> Option<SavedState> {
	let raw = match std::fs::read_to_string(path) {
		Ok(raw) => raw,
		Err(e) => {
			info!("no saved state at {}: {e}", path.display());
			return None;
		}
	};
	match serde_json::from_str(&raw) {
		Ok(state) => Some(state),
		Err(e) => {
			warn!("could not parse saved state {}: {e}", path.display());
			None
		}
	}
}

/// Writes the state file via a temp-and-rename so a crash mid-write never
/// truncates the previous snapshot.
pub fn write(path: &Path, state: &SavedState) -> std::io::Result<()> {
	let json = serde_json::to_vec_pretty(state)?;
	let tmp = path.with_extension("tmp");
	std::fs::write(&tmp, json)?;
	std::fs::rename(&tmp, path)
}

/// Gathers the current process state into a serializable snapshot.
pub async fn collect(app: &App, chains: &[Arc<Chain>]) -> SavedState {
	let mut state = SavedState {
		alarms: app.alarms.snapshot().await,
		..Default::default()
	};
	for chain in chains {
		let tape = chain.state.read().await.tape.snapshot();
		state.blocks.insert(chain.name.clone(), tape);

		let mut down = HashMap::new();
		for node in chain.fleet.nodes_snapshot().await {
			if node.down {
				if let Some(since) = node.down_since {
					down.insert(node.url.clone(), since);
				}
			}
		}
		if !down.is_empty() {
			state.nodes_down.insert(chain.name.clone(), down);
		}
	}
	state
}

/// Applies a saved snapshot at startup: restores the alarm cache (minus
/// stale entries), the block tapes, and the node-down markers.
pub async fn restore(app: &App, chains: &[Arc<Chain>], path: &Path) {
	let Some(mut saved) = load(path) else {
		return;
	};
	saved
		.alarms
		.prune_stale(Utc::now(), chrono::Duration::hours(STALE_HOURS));
	app.alarms.restore(saved.alarms).await;

	for chain in chains {
		if let Some(codes) = saved.blocks.get(&chain.name) {
			let mut state = chain.state.write().await;
			state.tape = BlockTape::from_snapshot(codes);
			state.anchored = false;
		}
		if let Some(down) = saved.nodes_down.get(&chain.name) {
			chain.fleet.restore_down_state(down).await;
		}
	}
	info!("restored monitor state from {}", path.display());
}

/// Saves on a timer and once more at shutdown.
pub async fn run_saver(
	app: Arc<App>,
	chains: Vec<Arc<Chain>>,
	path: PathBuf,
	mut shutdown: watch::Receiver<bool>,
) {
	let mut ticker = tokio::time::interval(SAVE_INTERVAL);
	ticker.tick().await;
	loop {
		tokio::select! {
			_ = shutdown.changed() => break,
			_ = ticker.tick() => {
				let state = collect(&app, &chains).await;
				if let Err(e) = write(&path, &state) {
					warn!("could not save state to {}: {e}", path.display());
				}
			}
		}
	}
	let state = collect(&app, &chains).await;
	match write(&path, &state) {
		Ok(()) => info!("saved monitor state to {}", path.display()),
		Err(e) => warn!("could not save state to {}: {e}", path.display()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::services::alerts::cache::AlarmEntry;

	fn entry(age_hours: i64) -> AlarmEntry {
		AlarmEntry {
			message: "m".into(),
			sent_time: Utc::now() - chrono::Duration::hours(age_hours),
		}
	}

	#[test]
	fn round_trip_through_disk() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("state.json");

		let mut state = SavedState::default();
		state
			.alarms
			.sent_pd_alarms
			.insert("ChainStalled_val1".into(), entry(1));
		state.blocks.insert("testchain".into(), vec![3, 3, 4, -1]);
		state
			.nodes_down
			.entry("testchain".into())
			.or_default()
			.insert("http://localhost:26657".into(), Utc::now());

		write(&path, &state).unwrap();
		let loaded = load(&path).unwrap();
		assert_eq!(loaded.alarms.sent_pd_alarms.len(), 1);
		assert_eq!(loaded.blocks["testchain"], vec![3, 3, 4, -1]);
		assert_eq!(loaded.nodes_down["testchain"].len(), 1);
	}

	#[test]
	fn state_file_uses_the_documented_keys() {
		let mut state = SavedState::default();
		state
			.alarms
			.sent_all_alarms
			.entry("testchain".into())
			.or_default()
			.insert("ValidatorInactive_val1".into(), entry(0));

		let json = serde_json::to_value(&state).unwrap();
		assert!(json["alarms"]["sent_pd_alarms"].is_object());
		assert!(json["alarms"]["sent_tg_alarms"].is_object());
		assert!(json["alarms"]["sent_di_alarms"].is_object());
		assert!(json["alarms"]["sent_slk_alarms"].is_object());
		assert!(
			json["alarms"]["sent_all_alarms"]["testchain"]["ValidatorInactive_val1"]["sent_time"]
				.is_string()
		);
		assert!(json["blocks"].is_object());
		assert!(json["nodes_down"].is_object());
	}

	#[test]
	fn stale_entries_dropped_on_prune() {
		let mut alarms = SavedAlarms::default();
		alarms.sent_pd_alarms.insert("old".into(), entry(30));
		alarms.sent_pd_alarms.insert("fresh".into(), entry(1));
		alarms
			.sent_all_alarms
			.entry("c".into())
			.or_default()
			.insert("old".into(), entry(30));

		alarms.prune_stale(Utc::now(), chrono::Duration::hours(STALE_HOURS));
		assert!(alarms.sent_pd_alarms.contains_key("fresh"));
		assert!(!alarms.sent_pd_alarms.contains_key("old"));
		assert!(alarms.sent_all_alarms.is_empty());
	}

	#[test]
	fn unparsable_state_is_a_cold_start() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("state.json");
		std::fs::write(&path, "{ not json").unwrap();
		assert!(load(&path).is_none());
		assert!(load(&dir.path().join("missing.json")).is_none());
	}
}
