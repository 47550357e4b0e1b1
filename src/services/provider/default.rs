//! The default chain-data provider: ABCI queries over the fleet's JSON-RPC
//! endpoints.
//!
//! Requests are protobuf-encoded, carried in `abci_query` calls, and decoded
//! from the base64 `response.value`. Vote lookups use `tx_search` across all
//! endpoints: the first endpoint reporting a matching transaction wins.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::DateTime;
use prost::Message;
use reqwest_middleware::ClientWithMiddleware;
use serde_json::Value;
use tracing::debug;

use crate::models::cosmos::{self, dec_from_text, int_from_text};
use crate::models::{DenomMetadata, DenomUnit, MonitorError, ProposalRef};
use crate::services::provider::{
	BaseCoin, ChainDataProvider, ChainInfo, RewardsCommission, SigningStatus, SlashingWindow,
	StakingPool, ValidatorRecord,
};
use crate::services::rpc::EndpointFleet;
use crate::utils::address;

pub struct DefaultProvider {
	fleet: Arc<EndpointFleet>,
	http: ClientWithMiddleware,
	valoper: String,
}

impl DefaultProvider {
	pub fn new(fleet: Arc<EndpointFleet>, http: ClientWithMiddleware, valoper: String) -> Self {
		Self {
			fleet,
			http,
			valoper,
		}
	}

	/// Performs one ABCI query against the currently-picked endpoint and
	/// returns the decoded response value.
	async fn abci_query(&self, path: &str, data: &[u8]) -> Result<Vec<u8>, MonitorError> {
		let url = self.fleet.pick().await?;
		let payload = serde_json::json!({
			"jsonrpc": "2.0",
			"id": 1,
			"method": "abci_query",
			"params": {
				"path": path,
				"data": hex::encode(data),
				"prove": false,
			},
		});
		let resp: Value = self
			.http
			.post(&url)
			.json(&payload)
			.send()
			.await
			.map_err(MonitorError::from)?
			.json()
			.await
			.map_err(MonitorError::from)?;

		let response = resp
			.pointer("/result/response")
			.ok_or_else(|| MonitorError::Parse(format!("abci_query {path} returned no result")))?;

		let code = response.get("code").and_then(Value::as_i64).unwrap_or(0);
		if code != 0 {
			let log = response
				.get("log")
				.and_then(Value::as_str)
				.unwrap_or_default();
			return Err(MonitorError::NotFound(format!(
				"abci_query {path} failed with code {code}: {log}"
			)));
		}

		match response.get("value").and_then(Value::as_str) {
			Some(b64) if !b64.is_empty() => BASE64
				.decode(b64)
				.map_err(|e| MonitorError::Parse(format!("abci_query {path}: bad base64: {e}"))),
			_ => Err(MonitorError::NotFound(format!(
				"abci_query {path} returned an empty value"
			))),
		}
	}

	fn dec_coins(coins: Vec<cosmos::DecCoin>) -> Vec<BaseCoin> {
		coins
			.into_iter()
			.filter_map(|c| {
				dec_from_text(c.amount.as_bytes()).ok().map(|amount| BaseCoin {
					denom: c.denom,
					amount,
				})
			})
			.collect()
	}
}

#[async_trait]
impl ChainDataProvider for DefaultProvider {
	async fn query_validator(&self) -> Result<ValidatorRecord, MonitorError> {
		let req = cosmos::QueryValidatorRequest {
			validator_addr: self.valoper.clone(),
		};
		let raw = self
			.abci_query("/cosmos.staking.v1beta1.Query/Validator", &req.encode_to_vec())
			.await?;
		let resp = cosmos::QueryValidatorResponse::decode(raw.as_slice())?;
		let val = resp
			.validator
			.ok_or_else(|| MonitorError::NotFound(format!("validator {}", self.valoper)))?;

		let pubkey = val
			.consensus_pubkey
			.ok_or_else(|| MonitorError::Parse("validator has no consensus pubkey".into()))?;
		let key = cosmos::RawPubKey::decode(pubkey.value.as_slice())?;
		let address_hash = address::pubkey_to_address(&pubkey.type_url, &key.key)?;

		Ok(ValidatorRecord {
			address_hash,
			moniker: val.description.map(|d| d.moniker).unwrap_or_default(),
			jailed: val.jailed,
			bonded: val.status == cosmos::BOND_STATUS_BONDED,
			tokens: int_from_text(&val.tokens)?,
			commission_rate: val
				.commission
				.and_then(|c| c.commission_rates)
				.map(|r| dec_from_text(r.rate.as_bytes()))
				.transpose()?
				.unwrap_or(0.0),
		})
	}

	async fn query_signing_info(&self, valcons: &str) -> Result<SigningStatus, MonitorError> {
		let req = cosmos::QuerySigningInfoRequest {
			cons_address: valcons.to_string(),
		};
		let raw = self
			.abci_query(
				"/cosmos.slashing.v1beta1.Query/SigningInfo",
				&req.encode_to_vec(),
			)
			.await?;
		let resp = cosmos::QuerySigningInfoResponse::decode(raw.as_slice())?;
		let info = resp
			.val_signing_info
			.ok_or_else(|| MonitorError::NotFound(format!("signing info for {valcons}")))?;
		Ok(SigningStatus {
			missed_blocks: info.missed_blocks_counter,
			tombstoned: info.tombstoned,
		})
	}

	async fn query_slashing_params(&self) -> Result<SlashingWindow, MonitorError> {
		let raw = self
			.abci_query(
				"/cosmos.slashing.v1beta1.Query/Params",
				&cosmos::QuerySlashingParamsRequest {}.encode_to_vec(),
			)
			.await?;
		let resp = cosmos::QuerySlashingParamsResponse::decode(raw.as_slice())?;
		let params = resp
			.params
			.ok_or_else(|| MonitorError::NotFound("slashing params".into()))?;
		Ok(SlashingWindow {
			signed_blocks_window: params.signed_blocks_window,
			min_signed_per_window: dec_from_text(&params.min_signed_per_window)?,
		})
	}

	async fn query_pool(&self) -> Result<StakingPool, MonitorError> {
		let raw = self
			.abci_query(
				"/cosmos.staking.v1beta1.Query/Pool",
				&cosmos::QueryPoolRequest {}.encode_to_vec(),
			)
			.await?;
		let resp = cosmos::QueryPoolResponse::decode(raw.as_slice())?;
		let pool = resp
			.pool
			.ok_or_else(|| MonitorError::NotFound("staking pool".into()))?;
		Ok(StakingPool {
			bonded_tokens: int_from_text(&pool.bonded_tokens)?,
			not_bonded_tokens: int_from_text(&pool.not_bonded_tokens)?,
		})
	}

	async fn query_rewards_commission(&self) -> Result<RewardsCommission, MonitorError> {
		let delegator = address::account_from_valoper(&self.valoper)?;

		let rewards_req = cosmos::QueryDelegationRewardsRequest {
			delegator_address: delegator,
			validator_address: self.valoper.clone(),
		};
		let rewards = match self
			.abci_query(
				"/cosmos.distribution.v1beta1.Query/DelegationRewards",
				&rewards_req.encode_to_vec(),
			)
			.await
		{
			Ok(raw) => Self::dec_coins(
				cosmos::QueryDelegationRewardsResponse::decode(raw.as_slice())?.rewards,
			),
			// a validator with no self-delegation simply has no rewards
			Err(MonitorError::NotFound(_)) => Vec::new(),
			Err(e) => return Err(e),
		};

		let commission_req = cosmos::QueryValidatorCommissionRequest {
			validator_address: self.valoper.clone(),
		};
		let raw = self
			.abci_query(
				"/cosmos.distribution.v1beta1.Query/ValidatorCommission",
				&commission_req.encode_to_vec(),
			)
			.await?;
		let commission = cosmos::QueryValidatorCommissionResponse::decode(raw.as_slice())?
			.commission
			.map(|c| Self::dec_coins(c.commission))
			.unwrap_or_default();

		Ok(RewardsCommission {
			rewards,
			commission,
		})
	}

	async fn query_denom_metadata(&self, denom: &str) -> Result<DenomMetadata, MonitorError> {
		let req = cosmos::QueryDenomMetadataRequest {
			denom: denom.to_string(),
		};
		let raw = self
			.abci_query(
				"/cosmos.bank.v1beta1.Query/DenomMetadata",
				&req.encode_to_vec(),
			)
			.await?;
		let resp = cosmos::QueryDenomMetadataResponse::decode(raw.as_slice())?;
		let meta = resp
			.metadata
			.ok_or_else(|| MonitorError::NotFound(format!("denom metadata for {denom}")))?;
		Ok(DenomMetadata {
			base: meta.base,
			display: meta.display,
			symbol: meta.symbol,
			denom_units: meta
				.denom_units
				.into_iter()
				.map(|u| DenomUnit {
					denom: u.denom,
					exponent: u.exponent,
				})
				.collect(),
		})
	}

	async fn query_open_proposals(&self) -> Result<Vec<ProposalRef>, MonitorError> {
		let req = cosmos::QueryProposalsRequest {
			proposal_status: cosmos::PROPOSAL_STATUS_VOTING_PERIOD,
		};
		let raw = self
			.abci_query("/cosmos.gov.v1.Query/Proposals", &req.encode_to_vec())
			.await?;
		let resp = cosmos::QueryProposalsResponse::decode(raw.as_slice())?;
		Ok(resp
			.proposals
			.into_iter()
			.filter(|p| p.status == cosmos::PROPOSAL_STATUS_VOTING_PERIOD)
			.map(|p| ProposalRef {
				proposal_id: p.id,
				voting_end_time: p
					.voting_end_time
					.and_then(|t| DateTime::from_timestamp(t.seconds, t.nanos.max(0) as u32)),
			})
			.collect())
	}

	async fn query_has_voted(&self, proposal_id: u64) -> Result<bool, MonitorError> {
		let voter = address::account_from_valoper(&self.valoper)?;
		let query = format!(
			"\"proposal_vote.proposal_id='{proposal_id}' AND proposal_vote.voter='{voter}'\""
		);

		let mut last_err: Option<MonitorError> = None;
		let mut answered = 0usize;
		for node in self.fleet.nodes_snapshot().await {
			if node.wrong_chain {
				continue;
			}
			let result: Result<Value, MonitorError> = async {
				let resp = self
					.http
					.get(format!("{}/tx_search", node.url))
					.query(&[
						("query", query.as_str()),
						("prove", "false"),
						("page", "1"),
						("per_page", "1"),
					])
					.send()
					.await
					.map_err(MonitorError::from)?;
				resp.json().await.map_err(MonitorError::from)
			}
			.await;

			match result {
				Ok(body) => {
					answered += 1;
					let txs = body
						.pointer("/result/txs")
						.and_then(Value::as_array)
						.map(|t| t.len())
						.unwrap_or(0);
					if txs > 0 {
						return Ok(true);
					}
				}
				Err(e) => {
					debug!("tx_search on {} failed: {e}", node.url);
					last_err = Some(e);
				}
			}
		}

		match last_err {
			// every endpoint errored; surface it so the caller skips the cycle
			Some(e) if answered == 0 => Err(e),
			_ => Ok(false),
		}
	}

	async fn query_chain_info(&self, denom: &str) -> Result<ChainInfo, MonitorError> {
		let mut info = ChainInfo::default();

		let raw = self
			.abci_query(
				"/cosmos.distribution.v1beta1.Query/Params",
				&cosmos::QueryDistributionParamsRequest {}.encode_to_vec(),
			)
			.await?;
		if let Some(params) = cosmos::QueryDistributionParamsResponse::decode(raw.as_slice())?.params
		{
			info.community_tax = dec_from_text(params.community_tax.as_bytes())?;
		}

		let raw = self
			.abci_query(
				"/cosmos.mint.v1beta1.Query/Inflation",
				&cosmos::QueryInflationRequest {}.encode_to_vec(),
			)
			.await?;
		info.inflation_rate =
			dec_from_text(&cosmos::QueryInflationResponse::decode(raw.as_slice())?.inflation)?;

		if !denom.is_empty() {
			let req = cosmos::QuerySupplyOfRequest {
				denom: denom.to_string(),
			};
			let raw = self
				.abci_query("/cosmos.bank.v1beta1.Query/SupplyOf", &req.encode_to_vec())
				.await?;
			let resp = cosmos::QuerySupplyOfResponse::decode(raw.as_slice())?;
			info.total_supply = resp
				.amount
				.map(|c| int_from_text(&c.amount))
				.transpose()?
				.unwrap_or(0.0);
		}

		Ok(info)
	}
}
