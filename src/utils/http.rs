//! Shared HTTP client construction.
//!
//! Every outbound HTTP call in the monitor goes through a `reqwest` client
//! wrapped with jittered exponential-backoff retry middleware. Endpoint
//! probing uses a shorter timeout than the slower governance/indexer paths.

use std::time::Duration;

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, Jitter, RetryTransientMiddleware};

/// Retry/timeout knobs for an HTTP client.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
	pub timeout: Duration,
	pub max_retries: u32,
	pub tls_skip_verify: bool,
}

impl Default for HttpClientConfig {
	fn default() -> Self {
		Self {
			timeout: Duration::from_secs(10),
			max_retries: 2,
			tls_skip_verify: false,
		}
	}
}

/// Builds the middleware-wrapped client used for RPC, indexer, and sink
/// traffic.
pub fn build_client(config: &HttpClientConfig) -> ClientWithMiddleware {
	let base = reqwest::Client::builder()
		.timeout(config.timeout)
		.danger_accept_invalid_certs(config.tls_skip_verify)
		.build()
		.unwrap_or_default();

	let retry_policy = ExponentialBackoff::builder()
		.retry_bounds(Duration::from_millis(250), Duration::from_secs(5))
		.jitter(Jitter::Full)
		.build_with_max_retries(config.max_retries);

	ClientBuilder::new(base)
		.with(RetryTransientMiddleware::new_with_policy(retry_policy))
		.build()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_builds() {
		let _ = build_client(&HttpClientConfig::default());
	}

	#[test]
	fn skip_verify_config_builds() {
		let _ = build_client(&HttpClientConfig {
			tls_skip_verify: true,
			..Default::default()
		});
	}
}
