//! Runtime state for a monitored chain and the status snapshot pushed to the
//! dashboard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::blocks::BlockTape;

/// Snapshot of validator attributes, refreshed roughly once a minute. Two
/// copies are kept per chain (`current` and `previous`) so rules can detect
/// transitions such as leaving the active set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValInfo {
	pub moniker: String,
	pub bonded: bool,
	pub jailed: bool,
	pub tombstoned: bool,
	/// Blocks missed inside the slashing window.
	pub missed: i64,
	/// Size of the slashing window in blocks.
	pub window: i64,
	/// Fraction of the window that must be signed to avoid jailing.
	pub min_signed_fraction: f64,
	/// 20-byte consensus address hash, the identity found in block signatures.
	#[serde(with = "hex::serde")]
	pub conspub: Vec<u8>,
	/// Bech32 consensus address.
	pub valcons: String,
	pub delegated_tokens: f64,
	pub voting_power_percent: f64,
	pub commission_rate: f64,
	pub self_delegation_rewards: Vec<DisplayCoin>,
	pub commission: Vec<DisplayCoin>,
	pub validator_apr: f64,
	pub projected_30d_rewards: f64,
}

impl Default for ValInfo {
	fn default() -> Self {
		Self {
			moniker: "not connected".to_string(),
			bonded: false,
			jailed: false,
			tombstoned: false,
			missed: 0,
			window: 0,
			min_signed_fraction: 0.0,
			conspub: Vec::new(),
			valcons: String::new(),
			delegated_tokens: 0.0,
			voting_power_percent: 0.0,
			commission_rate: 0.0,
			self_delegation_rewards: Vec::new(),
			commission: Vec::new(),
			validator_apr: 0.0,
			projected_30d_rewards: 0.0,
		}
	}
}

/// An amount already converted to the chain's display denomination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayCoin {
	pub denom: String,
	pub amount: f64,
}

/// Denomination metadata from the bank module, reduced to the fields the
/// dashboard and unit conversion need.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DenomMetadata {
	pub base: String,
	pub display: String,
	pub symbol: String,
	pub denom_units: Vec<DenomUnit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenomUnit {
	pub denom: String,
	pub exponent: u32,
}

impl DenomMetadata {
	/// Exponent of the display unit relative to the base unit. Defaults to 6,
	/// the overwhelmingly common choice on Cosmos chains, when the metadata is
	/// missing or inconsistent.
	pub fn display_exponent(&self) -> u32 {
		let display = if self.display.is_empty() {
			&self.base
		} else {
			&self.display
		};
		self.denom_units
			.iter()
			.find(|u| &u.denom == display)
			.map(|u| u.exponent)
			.unwrap_or(6)
	}
}

/// A configured RPC endpoint and its health bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEndpoint {
	pub url: String,
	pub alert_if_down: bool,
	#[serde(default)]
	pub down: bool,
	#[serde(default)]
	pub was_down: bool,
	#[serde(default)]
	pub syncing: bool,
	/// Reported a chain id other than the configured one; quarantined for the
	/// rest of the session and never selected again.
	#[serde(default)]
	pub wrong_chain: bool,
	#[serde(default)]
	pub down_since: Option<DateTime<Utc>>,
	#[serde(default)]
	pub last_error: Option<String>,
}

impl NodeEndpoint {
	pub fn new(url: String, alert_if_down: bool) -> Self {
		Self {
			url,
			alert_if_down,
			down: false,
			was_down: false,
			syncing: false,
			wrong_chain: false,
			down_since: None,
			last_error: None,
		}
	}

	pub fn healthy(&self) -> bool {
		!self.down && !self.syncing && !self.wrong_chain
	}
}

/// An open governance proposal the validator has not voted on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalRef {
	pub proposal_id: u64,
	/// May be approximate for indexer-backed chains.
	pub voting_end_time: Option<DateTime<Utc>>,
}

/// Chain-level economics used for APR figures on the dashboard.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChainEconomics {
	pub total_bonded_tokens: f64,
	pub total_supply: f64,
	pub community_tax: f64,
	pub inflation_rate: f64,
	pub base_apr: f64,
}

/// A cached fiat price for the chain's token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSnapshot {
	pub name: String,
	pub slug: String,
	pub symbol: String,
	pub currency: String,
	pub price: f64,
	pub last_updated: DateTime<Utc>,
}

/// Mutable per-chain monitoring state. Guarded by a `RwLock` on the chain
/// aggregate; the tape consumer and refresher write, the alert evaluator and
/// dashboard read.
#[derive(Debug, Default)]
pub struct ChainState {
	pub val: ValInfo,
	pub last_val: Option<ValInfo>,
	pub tape: BlockTape,
	/// Set once the first live block of this session has been committed; a
	/// restored tape is re-anchored at that point.
	pub anchored: bool,
	pub last_block_time: Option<DateTime<Utc>>,
	pub last_block_num: i64,
	pub last_error: Option<String>,
	pub active_alerts: usize,
	pub unvoted_proposals: Vec<ProposalRef>,
	pub denom_metadata: Option<DenomMetadata>,
	pub economics: ChainEconomics,
	pub crypto_price: Option<PriceSnapshot>,
}

/// Complete status for one chain, pushed over the dashboard websocket and
/// returned by the pull endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStatus {
	#[serde(rename = "msgType")]
	pub msg_type: String,
	pub name: String,
	pub chain_id: String,
	pub moniker: String,
	pub bonded: bool,
	pub jailed: bool,
	pub tombstoned: bool,
	pub missed: i64,
	pub window: i64,
	pub min_signed_per_window: f64,
	pub nodes: usize,
	pub healthy_nodes: usize,
	pub active_alerts: usize,
	pub height: i64,
	pub last_error: String,
	pub unvoted_open_gov_proposals: usize,
	pub total_bonded_tokens: f64,
	pub total_supply: f64,
	pub community_tax: f64,
	pub inflation_rate: f64,
	pub base_apr: f64,
	pub validator_apr: f64,
	pub projected_30d_rewards: f64,
	pub voting_power_percent: f64,
	pub delegated_tokens: f64,
	pub commission_rate: f64,
	pub self_delegation_rewards: Vec<DisplayCoin>,
	pub commission: Vec<DisplayCoin>,
	pub crypto_price: Option<PriceSnapshot>,
	pub denom_metadata: Option<DenomMetadata>,
	pub blocks: Vec<i8>,
}

/// A log line mirrored onto the dashboard stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
	#[serde(rename = "msgType")]
	pub msg_type: String,
	pub ts: i64,
	pub msg: String,
}

impl LogMessage {
	pub fn now(msg: impl Into<String>) -> Self {
		Self {
			msg_type: "log".to_string(),
			ts: Utc::now().timestamp(),
			msg: msg.into(),
		}
	}
}
