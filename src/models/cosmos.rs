//! Hand-declared protobuf messages for the Cosmos SDK queries this monitor
//! performs over ABCI.
//!
//! Only the fields we read are declared; protobuf skips unknown tags, so the
//! full upstream schemas are unnecessary. `Dec` values arrive on the wire as
//! the textual 18-decimal mantissa of the underlying big integer (so `0.05`
//! is transported as `"50000000000000000"`), in either a string or a bytes
//! field depending on the message.

use prost::Message;

use crate::models::error::MonitorError;

/// Scale factor of the SDK's legacy decimal type.
const DEC_SCALE: f64 = 1e18;

/// Parses a `Dec` mantissa (bytes or string field contents) into an `f64`.
pub fn dec_from_text(raw: &[u8]) -> Result<f64, MonitorError> {
	let s = std::str::from_utf8(raw)
		.map_err(|_| MonitorError::Parse("decimal field is not utf-8".into()))?
		.trim();
	if s.is_empty() {
		return Ok(0.0);
	}
	let mantissa: f64 = s
		.parse()
		.map_err(|_| MonitorError::Parse(format!("bad decimal mantissa {s:?}")))?;
	Ok(mantissa / DEC_SCALE)
}

/// Parses an SDK `Int` (plain integer string) into an `f64`.
pub fn int_from_text(s: &str) -> Result<f64, MonitorError> {
	let s = s.trim();
	if s.is_empty() {
		return Ok(0.0);
	}
	s.parse()
		.map_err(|_| MonitorError::Parse(format!("bad integer amount {s:?}")))
}

/// `google.protobuf.Any`, carrying the consensus pubkey.
#[derive(Clone, PartialEq, Message)]
pub struct Any {
	#[prost(string, tag = "1")]
	pub type_url: String,
	#[prost(bytes = "vec", tag = "2")]
	pub value: Vec<u8>,
}

/// `google.protobuf.Timestamp`.
#[derive(Clone, Copy, PartialEq, Message)]
pub struct Timestamp {
	#[prost(int64, tag = "1")]
	pub seconds: i64,
	#[prost(int32, tag = "2")]
	pub nanos: i32,
}

/// Both supported consensus key types wrap the raw key the same way.
#[derive(Clone, PartialEq, Message)]
pub struct RawPubKey {
	#[prost(bytes = "vec", tag = "1")]
	pub key: Vec<u8>,
}

pub const ED25519_TYPE_URL: &str = "/cosmos.crypto.ed25519.PubKey";
pub const SECP256K1_TYPE_URL: &str = "/cosmos.crypto.secp256k1.PubKey";

// ---- staking -----------------------------------------------------------

/// `BondStatus::Bonded` in `cosmos.staking.v1beta1`.
pub const BOND_STATUS_BONDED: i32 = 3;

#[derive(Clone, PartialEq, Message)]
pub struct QueryValidatorRequest {
	#[prost(string, tag = "1")]
	pub validator_addr: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryValidatorResponse {
	#[prost(message, optional, tag = "1")]
	pub validator: Option<Validator>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Validator {
	#[prost(string, tag = "1")]
	pub operator_address: String,
	#[prost(message, optional, tag = "2")]
	pub consensus_pubkey: Option<Any>,
	#[prost(bool, tag = "3")]
	pub jailed: bool,
	#[prost(int32, tag = "4")]
	pub status: i32,
	#[prost(string, tag = "5")]
	pub tokens: String,
	#[prost(message, optional, tag = "7")]
	pub description: Option<Description>,
	#[prost(message, optional, tag = "10")]
	pub commission: Option<Commission>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Description {
	#[prost(string, tag = "1")]
	pub moniker: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Commission {
	#[prost(message, optional, tag = "1")]
	pub commission_rates: Option<CommissionRates>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CommissionRates {
	/// Dec mantissa text.
	#[prost(string, tag = "1")]
	pub rate: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryPoolRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct QueryPoolResponse {
	#[prost(message, optional, tag = "1")]
	pub pool: Option<Pool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Pool {
	#[prost(string, tag = "1")]
	pub not_bonded_tokens: String,
	#[prost(string, tag = "2")]
	pub bonded_tokens: String,
}

// ---- slashing ----------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct QuerySlashingParamsRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct QuerySlashingParamsResponse {
	#[prost(message, optional, tag = "1")]
	pub params: Option<SlashingParams>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SlashingParams {
	#[prost(int64, tag = "1")]
	pub signed_blocks_window: i64,
	/// Dec mantissa bytes.
	#[prost(bytes = "vec", tag = "2")]
	pub min_signed_per_window: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct QuerySigningInfoRequest {
	#[prost(string, tag = "1")]
	pub cons_address: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct QuerySigningInfoResponse {
	#[prost(message, optional, tag = "1")]
	pub val_signing_info: Option<ValidatorSigningInfo>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValidatorSigningInfo {
	#[prost(string, tag = "1")]
	pub address: String,
	#[prost(int64, tag = "2")]
	pub start_height: i64,
	#[prost(int64, tag = "3")]
	pub index_offset: i64,
	#[prost(bool, tag = "5")]
	pub tombstoned: bool,
	#[prost(int64, tag = "6")]
	pub missed_blocks_counter: i64,
}

// ---- gov (v1) ----------------------------------------------------------

/// `ProposalStatus::VotingPeriod` in `cosmos.gov.v1`.
pub const PROPOSAL_STATUS_VOTING_PERIOD: i32 = 2;

#[derive(Clone, PartialEq, Message)]
pub struct QueryProposalsRequest {
	#[prost(int32, tag = "1")]
	pub proposal_status: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryProposalsResponse {
	#[prost(message, repeated, tag = "1")]
	pub proposals: Vec<Proposal>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Proposal {
	#[prost(uint64, tag = "1")]
	pub id: u64,
	#[prost(int32, tag = "3")]
	pub status: i32,
	#[prost(message, optional, tag = "9")]
	pub voting_end_time: Option<Timestamp>,
}

// ---- bank --------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct QueryDenomMetadataRequest {
	#[prost(string, tag = "1")]
	pub denom: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryDenomMetadataResponse {
	#[prost(message, optional, tag = "1")]
	pub metadata: Option<Metadata>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Metadata {
	#[prost(string, tag = "1")]
	pub description: String,
	#[prost(message, repeated, tag = "2")]
	pub denom_units: Vec<DenomUnit>,
	#[prost(string, tag = "3")]
	pub base: String,
	#[prost(string, tag = "4")]
	pub display: String,
	#[prost(string, tag = "5")]
	pub name: String,
	#[prost(string, tag = "6")]
	pub symbol: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct DenomUnit {
	#[prost(string, tag = "1")]
	pub denom: String,
	#[prost(uint32, tag = "2")]
	pub exponent: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct QuerySupplyOfRequest {
	#[prost(string, tag = "1")]
	pub denom: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct QuerySupplyOfResponse {
	#[prost(message, optional, tag = "1")]
	pub amount: Option<Coin>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Coin {
	#[prost(string, tag = "1")]
	pub denom: String,
	/// Int text.
	#[prost(string, tag = "2")]
	pub amount: String,
}

// ---- distribution ------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct QueryDistributionParamsRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct QueryDistributionParamsResponse {
	#[prost(message, optional, tag = "1")]
	pub params: Option<DistributionParams>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DistributionParams {
	/// Dec mantissa text.
	#[prost(string, tag = "1")]
	pub community_tax: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryDelegationRewardsRequest {
	#[prost(string, tag = "1")]
	pub delegator_address: String,
	#[prost(string, tag = "2")]
	pub validator_address: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryDelegationRewardsResponse {
	#[prost(message, repeated, tag = "1")]
	pub rewards: Vec<DecCoin>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DecCoin {
	#[prost(string, tag = "1")]
	pub denom: String,
	/// Dec mantissa text.
	#[prost(string, tag = "2")]
	pub amount: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryValidatorCommissionRequest {
	#[prost(string, tag = "1")]
	pub validator_address: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryValidatorCommissionResponse {
	#[prost(message, optional, tag = "1")]
	pub commission: Option<ValidatorAccumulatedCommission>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValidatorAccumulatedCommission {
	#[prost(message, repeated, tag = "1")]
	pub commission: Vec<DecCoin>,
}

// ---- mint --------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct QueryInflationRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct QueryInflationResponse {
	/// Dec mantissa bytes.
	#[prost(bytes = "vec", tag = "1")]
	pub inflation: Vec<u8>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dec_mantissa_scaling() {
		assert_eq!(dec_from_text(b"50000000000000000").unwrap(), 0.05);
		assert_eq!(dec_from_text(b"1000000000000000000").unwrap(), 1.0);
		assert_eq!(dec_from_text(b"").unwrap(), 0.0);
		assert!(dec_from_text(b"abc").is_err());
	}

	#[test]
	fn int_text_parse() {
		assert_eq!(int_from_text("1234567").unwrap(), 1_234_567.0);
		assert_eq!(int_from_text("").unwrap(), 0.0);
		assert!(int_from_text("12x").is_err());
	}

	#[test]
	fn validator_round_trip_skips_unknown_fields() {
		let val = Validator {
			operator_address: "cosmosvaloper1abc".into(),
			consensus_pubkey: Some(Any {
				type_url: ED25519_TYPE_URL.into(),
				value: vec![1; 34],
			}),
			jailed: false,
			status: BOND_STATUS_BONDED,
			tokens: "1000000".into(),
			description: Some(Description {
				moniker: "test-val".into(),
			}),
			commission: Some(Commission {
				commission_rates: Some(CommissionRates {
					rate: "50000000000000000".into(),
				}),
			}),
		};
		let resp = QueryValidatorResponse {
			validator: Some(val.clone()),
		};
		let bytes = resp.encode_to_vec();
		let decoded = QueryValidatorResponse::decode(bytes.as_slice()).unwrap();
		assert_eq!(decoded.validator, Some(val));
	}

	#[test]
	fn proposal_decode() {
		let resp = QueryProposalsResponse {
			proposals: vec![Proposal {
				id: 42,
				status: PROPOSAL_STATUS_VOTING_PERIOD,
				voting_end_time: Some(Timestamp {
					seconds: 1_700_000_000,
					nanos: 0,
				}),
			}],
		};
		let decoded = QueryProposalsResponse::decode(resp.encode_to_vec().as_slice()).unwrap();
		assert_eq!(decoded.proposals[0].id, 42);
	}
}
