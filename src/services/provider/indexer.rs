//! The indexer chain-data provider.
//!
//! For chains whose ABCI query surface does not expose the standard Cosmos
//! paths, the same information is derived from HTTP JSON indexers. Every
//! query tries the configured indexers in order and returns the first usable
//! answer. Queries with no indexer equivalent return `NotSupported` and the
//! caller skips that capability.

use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde_json::Value;
use tracing::debug;

use crate::models::{DenomMetadata, MonitorError, ProposalRef};
use crate::services::provider::{
	BaseCoin, ChainDataProvider, ChainInfo, IndexerSettings, RewardsCommission, SigningStatus,
	SlashingWindow, StakingPool, ValidatorRecord,
};

/// Indexer stake figures are reported in millionths.
const STAKE_SCALE: f64 = 1e6;

pub struct IndexerProvider {
	http: ClientWithMiddleware,
	settings: IndexerSettings,
}

impl IndexerProvider {
	pub fn new(http: ClientWithMiddleware, settings: IndexerSettings) -> Self {
		Self { http, settings }
	}

	/// GETs `path` from each indexer in turn, returning the first JSON body
	/// that arrives. Only errors out when every indexer failed.
	async fn get_json(&self, path: &str) -> Result<Value, MonitorError> {
		let mut last_err = MonitorError::NoEndpoints;
		for indexer in &self.settings.indexers {
			let url = format!("{indexer}{path}");
			let result: Result<Value, MonitorError> = async {
				let resp = self
					.http
					.get(&url)
					.send()
					.await
					.map_err(MonitorError::from)?
					.error_for_status()
					.map_err(MonitorError::from)?;
				resp.json().await.map_err(MonitorError::from)
			}
			.await;
			match result {
				Ok(v) => return Ok(v),
				Err(e) => {
					debug!("indexer {indexer} failed for {path}: {e}");
					last_err = e;
				}
			}
		}
		Err(last_err)
	}

	fn number(v: &Value) -> Option<f64> {
		match v {
			Value::Number(n) => n.as_f64(),
			Value::String(s) => s.parse().ok(),
			_ => None,
		}
	}
}

#[async_trait]
impl ChainDataProvider for IndexerProvider {
	async fn query_validator(&self) -> Result<ValidatorRecord, MonitorError> {
		let addr = &self.settings.validator_address;

		let state = self
			.get_json(&format!("/api/v1/pos/validator/state/{addr}"))
			.await?;
		let state_str = state
			.get("state")
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_ascii_lowercase();
		let bonded = state_str == "consensus" || state_str == "bonded";
		let jailed = state_str == "jailed";

		let mut record = ValidatorRecord {
			bonded,
			jailed,
			..Default::default()
		};

		if let Ok(meta) = self
			.get_json(&format!("/api/v1/pos/validator/metadata/{addr}"))
			.await
		{
			record.moniker = meta
				.pointer("/metadata/name")
				.or_else(|| meta.get("name"))
				.and_then(Value::as_str)
				.unwrap_or_default()
				.to_string();
		}

		if let Ok(stake) = self
			.get_json(&format!("/api/v1/pos/validator/stake/{addr}"))
			.await
		{
			if let Some(v) = stake.get("stake").map(Self::number).flatten() {
				record.tokens = v / STAKE_SCALE;
			}
		}

		if let Ok(commission) = self
			.get_json(&format!("/api/v1/pos/validator/commission/{addr}"))
			.await
		{
			record.commission_rate = commission
				.get("commissionRate")
				.map(Self::number)
				.flatten()
				.unwrap_or(0.0);
		}

		Ok(record)
	}

	async fn query_signing_info(&self, _valcons: &str) -> Result<SigningStatus, MonitorError> {
		Err(MonitorError::NotSupported("signing info"))
	}

	async fn query_slashing_params(&self) -> Result<SlashingWindow, MonitorError> {
		Err(MonitorError::NotSupported("slashing params"))
	}

	async fn query_pool(&self) -> Result<StakingPool, MonitorError> {
		let body = self.get_json("/api/v1/pos/voting-power").await?;
		let total = body
			.get("totalVotingPower")
			.map(Self::number)
			.flatten()
			.ok_or_else(|| MonitorError::Parse("voting-power response missing total".into()))?;
		Ok(StakingPool {
			bonded_tokens: total,
			not_bonded_tokens: 0.0,
		})
	}

	async fn query_rewards_commission(&self) -> Result<RewardsCommission, MonitorError> {
		let addr = &self.settings.validator_address;
		let body = self.get_json(&format!("/api/v1/pos/reward/{addr}")).await?;
		let amount = body
			.as_array()
			.and_then(|entries| entries.first())
			.and_then(|e| e.get("minDenomAmount"))
			.map(Self::number)
			.flatten()
			.unwrap_or(0.0);
		// indexers report accumulated commission only; self-delegation rewards
		// are not exposed
		Ok(RewardsCommission {
			rewards: Vec::new(),
			commission: vec![BaseCoin {
				denom: String::new(),
				amount,
			}],
		})
	}

	async fn query_denom_metadata(&self, _denom: &str) -> Result<DenomMetadata, MonitorError> {
		Err(MonitorError::NotSupported("denom metadata"))
	}

	async fn query_open_proposals(&self) -> Result<Vec<ProposalRef>, MonitorError> {
		let body = self
			.get_json("/api/v1/gov/proposal?status=votingPeriod")
			.await?;
		let results = body
			.get("results")
			.and_then(Value::as_array)
			.cloned()
			.unwrap_or_default();

		let mut proposals = Vec::with_capacity(results.len());
		for p in results {
			let Some(id) = p.get("id").map(Self::number).flatten() else {
				continue;
			};
			// the end time is epoch-derived and may be approximate or absent
			let voting_end_time = p
				.get("endTime")
				.and_then(Value::as_str)
				.and_then(|s| s.parse().ok());
			proposals.push(ProposalRef {
				proposal_id: id as u64,
				voting_end_time,
			});
		}
		Ok(proposals)
	}

	async fn query_has_voted(&self, proposal_id: u64) -> Result<bool, MonitorError> {
		let addr = &self.settings.validator_address;
		let body = self
			.get_json(&format!("/api/v1/gov/voter/{addr}/votes"))
			.await?;
		let votes = body.as_array().cloned().unwrap_or_default();
		Ok(votes.iter().any(|v| {
			v.get("proposalId")
				.map(Self::number)
				.flatten()
				.map(|id| id as u64 == proposal_id)
				.unwrap_or(false)
		}))
	}

	async fn query_chain_info(&self, _denom: &str) -> Result<ChainInfo, MonitorError> {
		Err(MonitorError::NotSupported("chain info"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::utils::http::{build_client, HttpClientConfig};

	fn provider(servers: Vec<String>) -> IndexerProvider {
		IndexerProvider::new(
			build_client(&HttpClientConfig {
				max_retries: 0,
				..Default::default()
			}),
			IndexerSettings {
				validator_address: "tnam1val".into(),
				indexers: servers,
			},
		)
	}

	#[tokio::test]
	async fn validator_state_and_stake() {
		let mut server = mockito::Server::new_async().await;
		server
			.mock("GET", "/api/v1/pos/validator/state/tnam1val")
			.with_body(r#"{"state": "consensus"}"#)
			.create_async()
			.await;
		server
			.mock("GET", "/api/v1/pos/validator/metadata/tnam1val")
			.with_body(r#"{"metadata": {"name": "indexed-val"}}"#)
			.create_async()
			.await;
		server
			.mock("GET", "/api/v1/pos/validator/stake/tnam1val")
			.with_body(r#"{"stake": "5000000"}"#)
			.create_async()
			.await;
		server
			.mock("GET", "/api/v1/pos/validator/commission/tnam1val")
			.with_body(r#"{"commissionRate": "0.07"}"#)
			.create_async()
			.await;

		let p = provider(vec![server.url()]);
		let record = p.query_validator().await.unwrap();
		assert!(record.bonded);
		assert!(!record.jailed);
		assert_eq!(record.moniker, "indexed-val");
		assert_eq!(record.tokens, 5.0);
		assert_eq!(record.commission_rate, 0.07);
	}

	#[tokio::test]
	async fn failover_to_second_indexer() {
		let mut bad = mockito::Server::new_async().await;
		bad.mock("GET", "/api/v1/pos/voting-power")
			.with_status(500)
			.create_async()
			.await;
		let mut good = mockito::Server::new_async().await;
		good.mock("GET", "/api/v1/pos/voting-power")
			.with_body(r#"{"totalVotingPower": "123456"}"#)
			.create_async()
			.await;

		let p = provider(vec![bad.url(), good.url()]);
		let pool = p.query_pool().await.unwrap();
		assert_eq!(pool.bonded_tokens, 123_456.0);
	}

	#[tokio::test]
	async fn votes_lookup() {
		let mut server = mockito::Server::new_async().await;
		server
			.mock("GET", "/api/v1/gov/voter/tnam1val/votes")
			.with_body(r#"[{"proposalId": 7}, {"proposalId": 42}]"#)
			.expect(2)
			.create_async()
			.await;

		let p = provider(vec![server.url()]);
		assert!(p.query_has_voted(42).await.unwrap());
		assert!(!p.query_has_voted(1).await.unwrap());
	}

	#[tokio::test]
	async fn unsupported_queries_say_so() {
		let p = provider(vec!["http://127.0.0.1:1".into()]);
		assert!(matches!(
			p.query_slashing_params().await,
			Err(MonitorError::NotSupported(_))
		));
		assert!(matches!(
			p.query_chain_info("").await,
			Err(MonitorError::NotSupported(_))
		));
	}

	#[tokio::test]
	async fn open_proposals_parse_with_optional_end_time() {
		let mut server = mockito::Server::new_async().await;
		server
			.mock(
				"GET",
				mockito::Matcher::Regex(r"^/api/v1/gov/proposal.*$".to_string()),
			)
			.with_body(
				r#"{"results": [
					{"id": "12", "endTime": "2025-06-01T00:00:00Z"},
					{"id": "13"}
				]}"#,
			)
			.create_async()
			.await;

		let p = provider(vec![server.url()]);
		let proposals = p.query_open_proposals().await.unwrap();
		assert_eq!(proposals.len(), 2);
		assert_eq!(proposals[0].proposal_id, 12);
		assert!(proposals[0].voting_end_time.is_some());
		assert!(proposals[1].voting_end_time.is_none());
	}
}
