//! Error types shared across the monitor.
//!
//! A single enum covers every failure class the services produce. Provider and
//! transport errors are returned to the caller and logged there; they never
//! terminate a task. Only `Config` errors raised during startup are fatal.

use thiserror::Error;

/// Errors produced by configuration loading, chain queries, and notification
/// delivery.
#[derive(Debug, Error)]
pub enum MonitorError {
	/// The configuration cannot support monitoring at all.
	#[error("invalid configuration: {0}")]
	Config(String),

	/// Connectivity failures: refused connections, DNS, dropped sockets.
	#[error("network error: {0}")]
	Network(String),

	/// A response arrived but could not be decoded.
	#[error("parse error: {0}")]
	Parse(String),

	/// An endpoint reports a chain id other than the configured one.
	#[error("wrong chain: endpoint reports {actual}, expected {expected}")]
	WrongChain { expected: String, actual: String },

	/// The queried object does not exist on the chain.
	#[error("not found: {0}")]
	NotFound(String),

	/// An external API rejected our credentials.
	#[error("authentication failed: {0}")]
	Auth(String),

	/// An external API asked us to back off.
	#[error("rate limited: {0}")]
	RateLimited(String),

	/// An I/O deadline elapsed.
	#[error("timed out: {0}")]
	Timeout(String),

	/// The surrounding task was asked to shut down mid-operation.
	#[error("canceled")]
	Canceled,

	/// The provider variant has no way to answer this query.
	#[error("not supported by this provider: {0}")]
	NotSupported(&'static str),

	/// Every endpoint in the fleet is down or quarantined.
	#[error("no usable rpc endpoints")]
	NoEndpoints,
}

impl MonitorError {
	/// True for failures a later cycle may clear on its own.
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			MonitorError::Network(_)
				| MonitorError::Timeout(_)
				| MonitorError::RateLimited(_)
				| MonitorError::NoEndpoints
		)
	}
}

impl From<reqwest::Error> for MonitorError {
	fn from(err: reqwest::Error) -> Self {
		if err.is_timeout() {
			MonitorError::Timeout(err.to_string())
		} else if err.is_status() {
			match err.status() {
				Some(s) if s.as_u16() == 429 => MonitorError::RateLimited(err.to_string()),
				Some(s) if s.as_u16() == 401 || s.as_u16() == 403 => {
					MonitorError::Auth(err.to_string())
				}
				_ => MonitorError::Network(err.to_string()),
			}
		} else {
			MonitorError::Network(err.to_string())
		}
	}
}

impl From<reqwest_middleware::Error> for MonitorError {
	fn from(err: reqwest_middleware::Error) -> Self {
		match err {
			reqwest_middleware::Error::Reqwest(e) => e.into(),
			reqwest_middleware::Error::Middleware(e) => MonitorError::Network(e.to_string()),
		}
	}
}

impl From<serde_json::Error> for MonitorError {
	fn from(err: serde_json::Error) -> Self {
		MonitorError::Parse(err.to_string())
	}
}

impl From<prost::DecodeError> for MonitorError {
	fn from(err: prost::DecodeError) -> Self {
		MonitorError::Parse(err.to_string())
	}
}
