//! Domain models and data structures for validator monitoring.
//!
//! - `blocks`: per-block outcomes and the fixed-length block tape
//! - `chain`: runtime chain state, validator info, dashboard status
//! - `config`: YAML configuration loading and validation
//! - `cosmos`: protobuf messages for the ABCI query surface
//! - `error`: the shared error enum

pub mod blocks;
pub mod chain;
pub mod config;
pub mod cosmos;
pub mod error;

pub use blocks::{attribute, BlockOutcome, BlockTape, TapeCounters, VoteEvidence, TAPE_LEN};
pub use chain::{
	ChainEconomics, ChainState, ChainStatus, DenomMetadata, DenomUnit, DisplayCoin, LogMessage,
	NodeEndpoint, PriceSnapshot, ProposalRef, ValInfo,
};
pub use config::{
	AlertConfig, ChainConfig, Config, HealthcheckConfig, NodeConfig, PriceConversionConfig,
	ProviderConfig, Severity,
};
pub use error::MonitorError;
