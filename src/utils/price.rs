//! CoinMarketCap price client with a TTL cache.
//!
//! Prices back the unclaimed-rewards alert and the fiat figures on the
//! dashboard. One fetch covers every configured slug; individual lookups are
//! served from the cache until it expires.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::models::{MonitorError, PriceSnapshot};

const DEFAULT_API_ENDPOINT: &str = "https://pro-api.coinmarketcap.com";

#[derive(Debug, Deserialize)]
struct CmcResponse {
	status: CmcStatus,
	#[serde(default)]
	data: HashMap<String, CmcEntry>,
}

#[derive(Debug, Deserialize)]
struct CmcStatus {
	#[serde(default)]
	error_code: i64,
	#[serde(default)]
	error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CmcEntry {
	#[serde(default)]
	name: String,
	#[serde(default)]
	symbol: String,
	#[serde(default)]
	slug: String,
	#[serde(default)]
	quote: HashMap<String, CmcQuote>,
}

#[derive(Debug, Deserialize)]
struct CmcQuote {
	#[serde(default)]
	price: f64,
	#[serde(default)]
	last_updated: Option<DateTime<Utc>>,
}

struct PriceCache {
	prices: HashMap<String, PriceSnapshot>,
	fetched_at: Option<Instant>,
}

/// CoinMarketCap quote client. Cheap to share behind an `Arc`.
pub struct PriceClient {
	api_key: String,
	currency: String,
	ttl: Duration,
	slugs: Vec<String>,
	endpoint: String,
	http: ClientWithMiddleware,
	cache: RwLock<PriceCache>,
}

impl PriceClient {
	pub fn new(
		http: ClientWithMiddleware,
		api_key: String,
		currency: String,
		cache_hours: i64,
		slugs: Vec<String>,
	) -> Self {
		Self {
			api_key,
			currency,
			ttl: Duration::from_secs(cache_hours.max(1) as u64 * 3600),
			slugs,
			endpoint: DEFAULT_API_ENDPOINT.to_string(),
			http,
			cache: RwLock::new(PriceCache {
				prices: HashMap::new(),
				fetched_at: None,
			}),
		}
	}

	#[cfg(test)]
	pub fn with_endpoint(mut self, endpoint: String) -> Self {
		self.endpoint = endpoint;
		self
	}

	pub fn currency(&self) -> &str {
		&self.currency
	}

	/// All configured prices, fetched if the cache is cold or stale.
	pub async fn prices(&self) -> Result<HashMap<String, PriceSnapshot>, MonitorError> {
		{
			let cache = self.cache.read().await;
			if let Some(at) = cache.fetched_at {
				if at.elapsed() < self.ttl {
					return Ok(cache.prices.clone());
				}
			}
		}
		let fresh = self.fetch().await?;
		let mut cache = self.cache.write().await;
		cache.prices = fresh.clone();
		cache.fetched_at = Some(Instant::now());
		Ok(fresh)
	}

	/// Price for a single slug.
	pub async fn price(&self, slug: &str) -> Result<PriceSnapshot, MonitorError> {
		let prices = self.prices().await?;
		prices
			.get(&slug.to_ascii_lowercase())
			.cloned()
			.ok_or_else(|| MonitorError::NotFound(format!("no price for slug {slug:?}")))
	}

	async fn fetch(&self) -> Result<HashMap<String, PriceSnapshot>, MonitorError> {
		let url = format!("{}/v2/cryptocurrency/quotes/latest", self.endpoint);
		let resp = self
			.http
			.get(&url)
			.header("X-CMC_PRO_API_KEY", &self.api_key)
			.header("Accept", "application/json")
			.query(&[
				("slug", self.slugs.join(",")),
				("convert", self.currency.clone()),
			])
			.send()
			.await?;

		match resp.status().as_u16() {
			401 | 403 => {
				return Err(MonitorError::Auth("CoinMarketCap rejected the API key".into()))
			}
			429 => return Err(MonitorError::RateLimited("CoinMarketCap".into())),
			s if s >= 400 => {
				return Err(MonitorError::Network(format!(
					"CoinMarketCap returned status {s}"
				)))
			}
			_ => {}
		}

		let body: CmcResponse = resp.json().await.map_err(MonitorError::from)?;
		if body.status.error_code != 0 {
			return Err(MonitorError::Network(format!(
				"CoinMarketCap error {}: {}",
				body.status.error_code,
				body.status.error_message.unwrap_or_default()
			)));
		}

		let mut out = HashMap::with_capacity(body.data.len());
		for entry in body.data.into_values() {
			let Some(quote) = entry.quote.get(&self.currency) else {
				continue;
			};
			out.insert(
				entry.slug.to_ascii_lowercase(),
				PriceSnapshot {
					name: entry.name,
					symbol: entry.symbol,
					slug: entry.slug.to_ascii_lowercase(),
					currency: self.currency.clone(),
					price: quote.price,
					last_updated: quote.last_updated.unwrap_or_else(Utc::now),
				},
			);
		}
		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::utils::http::{build_client, HttpClientConfig};

	fn client_for(server: &mockito::ServerGuard) -> PriceClient {
		PriceClient::new(
			build_client(&HttpClientConfig::default()),
			"test-key".into(),
			"USD".into(),
			1,
			vec!["osmosis".into()],
		)
		.with_endpoint(server.url())
	}

	#[tokio::test]
	async fn fetch_parses_and_caches() {
		let mut server = mockito::Server::new_async().await;
		let mock = server
			.mock("GET", "/v2/cryptocurrency/quotes/latest")
			.match_query(mockito::Matcher::Any)
			.with_body(
				r#"{
					"status": {"error_code": 0},
					"data": {"123": {
						"name": "Osmosis", "symbol": "OSMO", "slug": "osmosis",
						"quote": {"USD": {"price": 0.42, "last_updated": "2025-01-01T00:00:00Z"}}
					}}
				}"#,
			)
			.expect(1)
			.create_async()
			.await;

		let client = client_for(&server);
		let price = client.price("osmosis").await.unwrap();
		assert_eq!(price.price, 0.42);
		assert_eq!(price.currency, "USD");

		// second lookup is served from cache, the mock allows one hit only
		let again = client.price("osmosis").await.unwrap();
		assert_eq!(again.price, 0.42);
		mock.assert_async().await;
	}

	#[tokio::test]
	async fn api_error_code_is_surfaced() {
		let mut server = mockito::Server::new_async().await;
		server
			.mock("GET", "/v2/cryptocurrency/quotes/latest")
			.match_query(mockito::Matcher::Any)
			.with_body(r#"{"status": {"error_code": 1002, "error_message": "API key missing"}}"#)
			.create_async()
			.await;

		let client = client_for(&server);
		let err = client.prices().await.unwrap_err();
		assert!(matches!(err, MonitorError::Network(_)), "{err:?}");
	}

	#[tokio::test]
	async fn unknown_slug_is_not_found() {
		let mut server = mockito::Server::new_async().await;
		server
			.mock("GET", "/v2/cryptocurrency/quotes/latest")
			.match_query(mockito::Matcher::Any)
			.with_body(r#"{"status": {"error_code": 0}, "data": {}}"#)
			.create_async()
			.await;

		let client = client_for(&server);
		assert!(matches!(
			client.price("nope").await,
			Err(MonitorError::NotFound(_))
		));
	}
}
