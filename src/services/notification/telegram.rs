//! Telegram bot sink.

use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::Serialize;
use serde_json::Value;

use crate::models::MonitorError;
use crate::services::alerts::AlertMsg;
use crate::services::notification::{prefix, Notifier};

const API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Serialize)]
struct SendMessage {
	chat_id: String,
	text: String,
}

pub struct TelegramNotifier {
	http: ClientWithMiddleware,
	api_base: String,
}

impl TelegramNotifier {
	pub fn new(http: ClientWithMiddleware) -> Self {
		Self {
			http,
			api_base: API_BASE.to_string(),
		}
	}

	#[cfg(test)]
	pub fn with_api_base(mut self, base: String) -> Self {
		self.api_base = base;
		self
	}

	fn build_message(msg: &AlertMsg, channel: &str, mentions: &str) -> SendMessage {
		let mut text = format!("{}{} - {}", prefix(msg.resolved), msg.chain_label, msg.message);
		if !mentions.is_empty() {
			text.push(' ');
			text.push_str(mentions);
		}
		SendMessage {
			chat_id: channel.to_string(),
			text,
		}
	}
}

#[async_trait]
impl Notifier for TelegramNotifier {
	fn name(&self) -> &'static str {
		"Telegram"
	}

	async fn notify(&self, msg: &AlertMsg) -> Result<(), MonitorError> {
		let route = msg
			.telegram
			.as_ref()
			.ok_or_else(|| MonitorError::Config("telegram sink has no route".into()))?;

		let payload = Self::build_message(msg, &route.channel, &route.mentions);
		let url = format!("{}/bot{}/sendMessage", self.api_base, route.api_key);
		let resp = self
			.http
			.post(&url)
			.json(&payload)
			.send()
			.await
			.map_err(MonitorError::from)?;

		let status = resp.status();
		match status.as_u16() {
			200 => Ok(()),
			401 | 403 => Err(MonitorError::Auth("telegram rejected the bot token".into())),
			429 => Err(MonitorError::RateLimited("telegram".into())),
			code => {
				let description = resp
					.json::<Value>()
					.await
					.ok()
					.and_then(|v| v.get("description").and_then(Value::as_str).map(String::from))
					.unwrap_or_default();
				Err(MonitorError::Network(format!(
					"telegram returned status {code}: {description}"
				)))
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::services::notification::testutil::alert_with_routes;
	use crate::utils::http::{build_client, HttpClientConfig};

	#[test]
	fn message_includes_prefix_and_mentions() {
		let msg = alert_with_routes("http://x", false);
		let built = TelegramNotifier::build_message(&msg, "@alerts", "@a @b");
		assert_eq!(built.chat_id, "@alerts");
		assert!(built.text.starts_with("ALERT: testchain (test-1) - "));
		assert!(built.text.ends_with("@a @b"));

		let resolved = alert_with_routes("http://x", true);
		let built = TelegramNotifier::build_message(&resolved, "@alerts", "");
		assert!(built.text.starts_with("Resolved: "));
	}

	#[tokio::test]
	async fn send_hits_bot_endpoint() {
		let mut server = mockito::Server::new_async().await;
		let mock = server
			.mock("POST", "/bottg-key/sendMessage")
			.with_body(r#"{"ok":true}"#)
			.create_async()
			.await;

		let notifier = TelegramNotifier::new(build_client(&HttpClientConfig {
			max_retries: 0,
			..Default::default()
		}))
		.with_api_base(server.url());
		let result = notifier.notify(&alert_with_routes("http://x", false)).await;
		assert!(result.is_ok());
		mock.assert_async().await;
	}

	#[tokio::test]
	async fn api_error_is_reported() {
		let mut server = mockito::Server::new_async().await;
		server
			.mock("POST", "/bottg-key/sendMessage")
			.with_status(400)
			.with_body(r#"{"ok":false,"description":"chat not found"}"#)
			.create_async()
			.await;

		let notifier = TelegramNotifier::new(build_client(&HttpClientConfig {
			max_retries: 0,
			..Default::default()
		}))
		.with_api_base(server.url());
		let err = notifier
			.notify(&alert_with_routes("http://x", false))
			.await
			.unwrap_err();
		assert!(err.to_string().contains("chat not found"), "{err}");
	}
}
