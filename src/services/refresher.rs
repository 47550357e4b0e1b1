//! Periodic validator-state refresh.
//!
//! Runs once at startup and then every minute: pulls the validator record,
//! signing info, slashing window, staking pool, rewards, denom metadata,
//! chain economics, and the open-governance set, and swaps the chain's
//! `ValInfo` pair so the evaluator can detect transitions. Individual query
//! failures are logged and skipped; the next cycle retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::models::{DisplayCoin, MonitorError, ValInfo};
use crate::services::provider::{BaseCoin, ChainDataProvider, ValidatorRecord};
use crate::services::{App, Chain};
use crate::utils::address;
use crate::utils::metrics::MetricKind;

const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

pub struct ValidatorRefresher {
	chain: Arc<Chain>,
	app: Arc<App>,
	provider: Box<dyn ChainDataProvider>,
}

impl ValidatorRefresher {
	pub fn new(chain: Arc<Chain>, app: Arc<App>, provider: Box<dyn ChainDataProvider>) -> Self {
		Self {
			chain,
			app,
			provider,
		}
	}

	/// Refreshes immediately, then on the interval until shutdown.
	pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
		if let Err(e) = self.refresh(true).await {
			warn!("initial validator refresh for {} failed: {e}", self.chain.name);
			self.chain.set_last_error(&e).await;
		}
		let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
		ticker.tick().await; // the immediate tick; the first refresh just ran
		loop {
			tokio::select! {
				_ = shutdown.changed() => break,
				_ = ticker.tick() => {
					if let Err(e) = self.refresh(false).await {
						warn!("validator refresh for {} failed: {e}", self.chain.name);
						self.chain.set_last_error(&e).await;
					}
				}
			}
		}
	}

	/// The validator record, honoring a directly-configured consensus
	/// address.
	async fn fetch_record(&self) -> Result<ValidatorRecord, MonitorError> {
		let valoper = &self.chain.config.valoper_address;
		if valoper.contains("valcons") {
			// consensus address given directly; the staking record is not
			// reachable through it
			return Ok(ValidatorRecord {
				address_hash: address::decode_bytes(valoper)?,
				moniker: valoper.clone(),
				bonded: true,
				..Default::default()
			});
		}
		self.provider.query_validator().await
	}

	/// Derives the bech32 consensus address and the matching 20-byte hash.
	fn derive_valcons(&self, record: &ValidatorRecord) -> Result<(String, Vec<u8>), MonitorError> {
		let over = &self.chain.config.valcons_override;
		if !over.is_empty() {
			return Ok((over.clone(), address::decode_bytes(over)?));
		}
		let valoper = &self.chain.config.valoper_address;
		if valoper.contains("valcons") {
			return Ok((valoper.clone(), address::decode_bytes(valoper)?));
		}
		if record.address_hash.is_empty() {
			return Err(MonitorError::NotFound(format!(
				"no consensus address for {valoper}; set valcons_override"
			)));
		}
		let valcons = address::valcons_from_valoper(valoper, &record.address_hash)?;
		Ok((valcons, record.address_hash.clone()))
	}

	fn to_display(coins: &[BaseCoin], exponent: u32, display_denom: &str) -> Vec<DisplayCoin> {
		let scale = 10f64.powi(exponent as i32);
		coins
			.iter()
			.map(|c| DisplayCoin {
				denom: if display_denom.is_empty() {
					c.denom.clone()
				} else {
					display_denom.to_string()
				},
				amount: c.amount / scale,
			})
			.collect()
	}

	pub async fn refresh(&self, first: bool) -> Result<(), MonitorError> {
		let record = self.fetch_record().await?;
		let (valcons, conspub) = self.derive_valcons(&record)?;

		if first {
			if record.bonded {
				info!(
					"found {} ({}) in the active set",
					self.chain.config.valoper_address, record.moniker
				);
			} else {
				warn!(
					"{} ({}) is NOT in the active set",
					self.chain.config.valoper_address, record.moniker
				);
			}
			info!("{} is using consensus address {valcons}", self.chain.name);
		}

		// denom metadata is fetched once; the reward denom tells us which
		// metadata to ask for
		let mut denom_metadata = self.chain.state.read().await.denom_metadata.clone();

		let rewards_commission = match self.provider.query_rewards_commission().await {
			Ok(rc) => Some(rc),
			Err(MonitorError::NotSupported(_)) => None,
			Err(e) => {
				warn!("rewards query for {} failed: {e}", self.chain.name);
				None
			}
		};

		if denom_metadata.is_none() {
			if let Some(rc) = &rewards_commission {
				let denom = rc
					.commission
					.first()
					.or_else(|| rc.rewards.first())
					.map(|c| c.denom.clone())
					.unwrap_or_default();
				if !denom.is_empty() {
					match self.provider.query_denom_metadata(&denom).await {
						Ok(meta) => denom_metadata = Some(meta),
						Err(MonitorError::NotSupported(_)) => {}
						Err(e) => warn!("denom metadata for {} failed: {e}", self.chain.name),
					}
				}
			}
		}
		let exponent = denom_metadata
			.as_ref()
			.map(|m| m.display_exponent())
			.unwrap_or(6);
		let display_denom = denom_metadata
			.as_ref()
			.map(|m| {
				if m.display.is_empty() {
					m.base.clone()
				} else {
					m.display.clone()
				}
			})
			.unwrap_or_default();
		let scale = 10f64.powi(exponent as i32);

		let signing = match self.provider.query_signing_info(&valcons).await {
			Ok(s) => Some(s),
			Err(MonitorError::NotSupported(_)) => None,
			Err(e) => {
				warn!("signing info for {} failed: {e}", self.chain.name);
				None
			}
		};

		let window = match self.provider.query_slashing_params().await {
			Ok(w) => Some(w),
			Err(MonitorError::NotSupported(_)) => None,
			Err(e) => {
				warn!("slashing params for {} failed: {e}", self.chain.name);
				None
			}
		};

		let pool = match self.provider.query_pool().await {
			Ok(p) => Some(p),
			Err(MonitorError::NotSupported(_)) => None,
			Err(e) => {
				warn!("staking pool for {} failed: {e}", self.chain.name);
				None
			}
		};

		let base_denom = denom_metadata
			.as_ref()
			.map(|m| m.base.clone())
			.unwrap_or_default();
		let chain_info = match self.provider.query_chain_info(&base_denom).await {
			Ok(ci) => Some(ci),
			Err(MonitorError::NotSupported(_)) => None,
			Err(e) => {
				warn!("chain info for {} failed: {e}", self.chain.name);
				None
			}
		};

		// governance set; a vote-lookup failure leaves the proposal in the
		// unvoted set rather than dropping the alert
		let unvoted = match self.provider.query_open_proposals().await {
			Ok(proposals) => {
				let mut unvoted = Vec::new();
				for proposal in proposals {
					match self.provider.query_has_voted(proposal.proposal_id).await {
						Ok(true) => {}
						Ok(false) => unvoted.push(proposal),
						Err(e) => {
							warn!(
								"vote lookup for proposal {} on {} failed: {e}",
								proposal.proposal_id, self.chain.name
							);
							unvoted.push(proposal);
						}
					}
				}
				Some(unvoted)
			}
			Err(MonitorError::NotSupported(_)) => None,
			Err(e) => {
				warn!("governance query for {} failed: {e}", self.chain.name);
				None
			}
		};

		// fiat price for the dashboard, served from the TTL cache; fetched
		// before taking the state lock
		let crypto_price = match &self.app.price {
			Some(price_client) if !self.chain.config.slug.is_empty() => {
				price_client.price(&self.chain.config.slug).await.ok()
			}
			_ => None,
		};

		let mut state = self.chain.state.write().await;
		let previous = state.val.clone();

		let mut val = ValInfo {
			moniker: record.moniker.clone(),
			bonded: record.bonded,
			jailed: record.jailed,
			tombstoned: previous.tombstoned,
			missed: previous.missed,
			window: previous.window,
			min_signed_fraction: previous.min_signed_fraction,
			conspub,
			valcons,
			delegated_tokens: record.tokens / scale,
			voting_power_percent: previous.voting_power_percent,
			commission_rate: record.commission_rate,
			self_delegation_rewards: previous.self_delegation_rewards.clone(),
			commission: previous.commission.clone(),
			validator_apr: previous.validator_apr,
			projected_30d_rewards: previous.projected_30d_rewards,
		};

		if let Some(signing) = signing {
			val.missed = signing.missed_blocks;
			val.tombstoned = signing.tombstoned;
			if signing.tombstoned && !previous.tombstoned {
				warn!(
					"{} ({}) is tombstoned",
					self.chain.config.valoper_address, record.moniker
				);
			}
		}
		if let Some(window) = window {
			val.window = window.signed_blocks_window;
			val.min_signed_fraction = window.min_signed_per_window;
		}
		if let Some(pool) = pool {
			if pool.bonded_tokens > 0.0 {
				val.voting_power_percent = 100.0 * record.tokens / pool.bonded_tokens;
			}
			state.economics.total_bonded_tokens = pool.bonded_tokens / scale;
		}
		if let Some(rc) = &rewards_commission {
			val.self_delegation_rewards = Self::to_display(&rc.rewards, exponent, &display_denom);
			val.commission = Self::to_display(&rc.commission, exponent, &display_denom);
		}
		if let Some(ci) = chain_info {
			state.economics.total_supply = ci.total_supply / scale;
			state.economics.community_tax = ci.community_tax;
			state.economics.inflation_rate = if self.chain.config.inflation_rate > 0.0 {
				self.chain.config.inflation_rate
			} else {
				ci.inflation_rate
			};
			if state.economics.total_bonded_tokens > 0.0 {
				state.economics.base_apr = state.economics.total_supply
					* state.economics.inflation_rate
					* (1.0 - state.economics.community_tax)
					/ state.economics.total_bonded_tokens;
				val.validator_apr = state.economics.base_apr * (1.0 - val.commission_rate);
				val.projected_30d_rewards = val.delegated_tokens * val.validator_apr / 12.0;
			}
		}

		if let Some(unvoted) = unvoted {
			state.unvoted_proposals = unvoted;
		}

		state.denom_metadata = denom_metadata;
		// keep a real previous snapshot only once we have seen the validator
		state.last_val = (previous.moniker != ValInfo::default().moniker).then_some(previous);
		state.val = val;
		state.last_error = None;
		if crypto_price.is_some() {
			state.crypto_price = crypto_price;
		}

		let moniker = state.val.moniker.clone();
		let missed = state.val.missed;
		let window_size = state.val.window;
		let unvoted_count = state.unvoted_proposals.len();
		drop(state);

		self.app.stat(self.chain.mk_update(
			&moniker,
			MetricKind::WindowMissed,
			missed as f64,
			"",
		));
		self.app.stat(self.chain.mk_update(
			&moniker,
			MetricKind::WindowSize,
			window_size as f64,
			"",
		));
		self.app.stat(self.chain.mk_update(
			&moniker,
			MetricKind::UnvotedProposals,
			unvoted_count as f64,
			"",
		));
		if first {
			self.app.stat(self.chain.mk_update(
				&moniker,
				MetricKind::TotalNodes,
				self.chain.fleet.total_count().await as f64,
				"",
			));
		}

		self.app.publish_status(&self.chain).await;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn display_conversion_scales_by_exponent() {
		let coins = vec![BaseCoin {
			denom: "uatom".into(),
			amount: 2_500_000.0,
		}];
		let display = ValidatorRefresher::to_display(&coins, 6, "atom");
		assert_eq!(
			display,
			vec![DisplayCoin {
				denom: "atom".into(),
				amount: 2.5,
			}]
		);
	}

	#[test]
	fn display_conversion_keeps_denom_when_unknown() {
		let coins = vec![BaseCoin {
			denom: "unam".into(),
			amount: 1_000_000.0,
		}];
		let display = ValidatorRefresher::to_display(&coins, 6, "");
		assert_eq!(display[0].denom, "unam");
		assert_eq!(display[0].amount, 1.0);
	}
}
