//! Discord webhook sink.

use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::Serialize;

use crate::models::MonitorError;
use crate::services::alerts::AlertMsg;
use crate::services::notification::{prefix, Notifier};

#[derive(Debug, Serialize)]
struct DiscordMessage {
	#[serde(skip_serializing_if = "Option::is_none")]
	username: Option<String>,
	content: String,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	embeds: Vec<DiscordEmbed>,
}

#[derive(Debug, Serialize)]
struct DiscordEmbed {
	description: String,
	color: u32,
}

/// Red for fires, green for resolutions.
const COLOR_ALERT: u32 = 0x00ed_4245;
const COLOR_RESOLVED: u32 = 0x0057_f287;

pub struct DiscordNotifier {
	http: ClientWithMiddleware,
}

impl DiscordNotifier {
	pub fn new(http: ClientWithMiddleware) -> Self {
		Self { http }
	}

	fn build_message(msg: &AlertMsg, mentions: &str) -> DiscordMessage {
		let mut content = format!("{}{}", prefix(msg.resolved), msg.chain_label);
		if !mentions.is_empty() {
			content.push(' ');
			content.push_str(mentions);
		}
		DiscordMessage {
			username: Some("cometwatch".to_string()),
			content,
			embeds: vec![DiscordEmbed {
				description: msg.message.clone(),
				color: if msg.resolved {
					COLOR_RESOLVED
				} else {
					COLOR_ALERT
				},
			}],
		}
	}
}

#[async_trait]
impl Notifier for DiscordNotifier {
	fn name(&self) -> &'static str {
		"Discord"
	}

	async fn notify(&self, msg: &AlertMsg) -> Result<(), MonitorError> {
		let route = msg
			.discord
			.as_ref()
			.ok_or_else(|| MonitorError::Config("discord sink has no route".into()))?;

		let payload = Self::build_message(msg, &route.mentions);
		let resp = self
			.http
			.post(&route.webhook)
			.json(&payload)
			.send()
			.await
			.map_err(MonitorError::from)?;

		match resp.status().as_u16() {
			200 | 204 => Ok(()),
			401 | 403 => Err(MonitorError::Auth("discord rejected the webhook".into())),
			429 => Err(MonitorError::RateLimited("discord".into())),
			code => Err(MonitorError::Network(format!(
				"discord returned status {code}"
			))),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::services::notification::testutil::alert_with_routes;
	use crate::utils::http::{build_client, HttpClientConfig};

	#[test]
	fn embeds_carry_the_message() {
		let msg = alert_with_routes("http://x", false);
		let built = DiscordNotifier::build_message(&msg, "@here");
		assert_eq!(built.content, "ALERT: testchain (test-1) @here");
		assert_eq!(built.embeds[0].description, msg.message);
		assert_eq!(built.embeds[0].color, COLOR_ALERT);

		let resolved = alert_with_routes("http://x", true);
		let built = DiscordNotifier::build_message(&resolved, "");
		assert_eq!(built.embeds[0].color, COLOR_RESOLVED);
	}

	#[tokio::test]
	async fn webhook_success_is_ok() {
		let mut server = mockito::Server::new_async().await;
		let mock = server
			.mock("POST", "/discord")
			.with_status(204)
			.create_async()
			.await;

		let notifier = DiscordNotifier::new(build_client(&HttpClientConfig {
			max_retries: 0,
			..Default::default()
		}));
		let result = notifier
			.notify(&alert_with_routes(&server.url(), false))
			.await;
		assert!(result.is_ok());
		mock.assert_async().await;
	}

	#[tokio::test]
	async fn webhook_failure_is_an_error() {
		let mut server = mockito::Server::new_async().await;
		server
			.mock("POST", "/discord")
			.with_status(404)
			.create_async()
			.await;

		let notifier = DiscordNotifier::new(build_client(&HttpClientConfig {
			max_retries: 0,
			..Default::default()
		}));
		assert!(notifier
			.notify(&alert_with_routes(&server.url(), false))
			.await
			.is_err());
	}
}
