//! Typed chain-data queries.
//!
//! Two provider variants expose the same capability set: the default variant
//! speaks ABCI over the fleet's JSON-RPC endpoints, the indexer variant
//! queries HTTP JSON indexers with failover. Methods a variant cannot answer
//! return `NotSupported`; callers treat any failure as a skipped cycle, never
//! as fatal.

pub mod default;
pub mod indexer;

use async_trait::async_trait;

use crate::models::{DenomMetadata, MonitorError, ProposalRef, ProviderConfig};

/// The validator record as the staking layer sees it.
#[derive(Debug, Clone, Default)]
pub struct ValidatorRecord {
	/// 20-byte consensus address hash (may be empty when the backend cannot
	/// produce it; the caller then falls back to the configured override).
	pub address_hash: Vec<u8>,
	pub moniker: String,
	pub jailed: bool,
	pub bonded: bool,
	/// Delegated stake in base units.
	pub tokens: f64,
	pub commission_rate: f64,
}

/// Signing-info fields relevant to downtime alerts.
#[derive(Debug, Clone, Copy, Default)]
pub struct SigningStatus {
	pub missed_blocks: i64,
	pub tombstoned: bool,
}

/// Slashing-module parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlashingWindow {
	pub signed_blocks_window: i64,
	pub min_signed_per_window: f64,
}

/// The staking pool totals.
#[derive(Debug, Clone, Copy, Default)]
pub struct StakingPool {
	pub bonded_tokens: f64,
	pub not_bonded_tokens: f64,
}

/// An amount in base units, not yet converted for display.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseCoin {
	pub denom: String,
	pub amount: f64,
}

/// Outstanding self-delegation rewards and validator commission.
#[derive(Debug, Clone, Default)]
pub struct RewardsCommission {
	pub rewards: Vec<BaseCoin>,
	pub commission: Vec<BaseCoin>,
}

/// Chain-level figures for APR derivation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainInfo {
	pub total_supply: f64,
	pub community_tax: f64,
	pub inflation_rate: f64,
}

/// The fixed capability set both provider variants implement.
#[async_trait]
pub trait ChainDataProvider: Send + Sync {
	async fn query_validator(&self) -> Result<ValidatorRecord, MonitorError>;
	async fn query_signing_info(&self, valcons: &str) -> Result<SigningStatus, MonitorError>;
	async fn query_slashing_params(&self) -> Result<SlashingWindow, MonitorError>;
	async fn query_pool(&self) -> Result<StakingPool, MonitorError>;
	async fn query_rewards_commission(&self) -> Result<RewardsCommission, MonitorError>;
	async fn query_denom_metadata(&self, denom: &str) -> Result<DenomMetadata, MonitorError>;
	async fn query_open_proposals(&self) -> Result<Vec<ProposalRef>, MonitorError>;
	async fn query_has_voted(&self, proposal_id: u64) -> Result<bool, MonitorError>;
	/// Chain economics. `denom` (the base denom, when known) selects the
	/// supply to report; an empty denom skips the supply lookup.
	async fn query_chain_info(&self, denom: &str) -> Result<ChainInfo, MonitorError>;
}

/// Settings extracted from a validated `provider.configs` map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexerSettings {
	pub validator_address: String,
	pub indexers: Vec<String>,
}

/// Validates the typed-erased `provider.configs` shape for the indexer
/// variant. Fails fast at construction so a bad config never reaches the
/// refresh loop.
pub fn parse_indexer_settings(config: &ProviderConfig) -> Result<IndexerSettings, MonitorError> {
	let mapping = config
		.configs
		.as_mapping()
		.ok_or_else(|| MonitorError::Config("provider.configs must be a mapping".into()))?;

	let validator_address = mapping
		.get(&serde_yaml::Value::from("validator_address"))
		.and_then(|v| v.as_str())
		.ok_or_else(|| {
			MonitorError::Config("provider.configs.validator_address must be a string".into())
		})?
		.to_string();

	let indexers = mapping
		.get(&serde_yaml::Value::from("indexers"))
		.and_then(|v| v.as_sequence())
		.ok_or_else(|| MonitorError::Config("provider.configs.indexers must be a list".into()))?
		.iter()
		.map(|v| {
			v.as_str().map(|s| s.trim_end_matches('/').to_string()).ok_or_else(|| {
				MonitorError::Config("provider.configs.indexers entries must be strings".into())
			})
		})
		.collect::<Result<Vec<_>, _>>()?;

	if indexers.is_empty() {
		return Err(MonitorError::Config(
			"provider.configs.indexers must not be empty".into(),
		));
	}

	Ok(IndexerSettings {
		validator_address,
		indexers,
	})
}

/// Constructs the provider named by the chain's config, validating the
/// free-form settings up front.
pub fn build(
	chain: &crate::services::Chain,
	http: reqwest_middleware::ClientWithMiddleware,
) -> Result<Box<dyn ChainDataProvider>, MonitorError> {
	match chain.config.provider.name.as_str() {
		"" | "default" => Ok(Box::new(default::DefaultProvider::new(
			chain.fleet.clone(),
			http,
			chain.config.valoper_address.clone(),
		))),
		"indexer" => {
			let settings = parse_indexer_settings(&chain.config.provider)?;
			Ok(Box::new(indexer::IndexerProvider::new(http, settings)))
		}
		other => Err(MonitorError::Config(format!(
			"unknown provider {other:?} for chain {}",
			chain.name
		))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn provider_config(yaml: &str) -> ProviderConfig {
		serde_yaml::from_str(yaml).unwrap()
	}

	#[test]
	fn indexer_settings_parse() {
		let cfg = provider_config(
			r#"
name: indexer
configs:
  validator_address: tnam1abcdef
  indexers:
    - https://indexer-one.example/
    - https://indexer-two.example
"#,
		);
		let settings = parse_indexer_settings(&cfg).unwrap();
		assert_eq!(settings.validator_address, "tnam1abcdef");
		assert_eq!(
			settings.indexers,
			vec![
				"https://indexer-one.example".to_string(),
				"https://indexer-two.example".to_string()
			]
		);
	}

	#[test]
	fn indexer_settings_reject_bad_shapes() {
		for bad in [
			"name: indexer\nconfigs: 7",
			"name: indexer\nconfigs:\n  indexers: [a]",
			"name: indexer\nconfigs:\n  validator_address: x\n  indexers: wat",
			"name: indexer\nconfigs:\n  validator_address: x\n  indexers: [1, 2]",
			"name: indexer\nconfigs:\n  validator_address: x\n  indexers: []",
		] {
			let cfg = provider_config(bad);
			assert!(
				matches!(parse_indexer_settings(&cfg), Err(MonitorError::Config(_))),
				"accepted: {bad}"
			);
		}
	}
}
