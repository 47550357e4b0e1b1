//! Slack webhook sink.

use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::Serialize;

use crate::models::MonitorError;
use crate::services::alerts::AlertMsg;
use crate::services::notification::{prefix, Notifier};

#[derive(Debug, Serialize)]
struct SlackMessage {
	text: String,
	attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
	title: String,
	color: &'static str,
}

pub struct SlackNotifier {
	http: ClientWithMiddleware,
}

impl SlackNotifier {
	pub fn new(http: ClientWithMiddleware) -> Self {
		Self { http }
	}

	fn build_message(msg: &AlertMsg, mentions: &str) -> SlackMessage {
		let text = if msg.resolved {
			format!("OK: {}", msg.message)
		} else {
			msg.message.clone()
		};
		SlackMessage {
			text,
			attachments: vec![SlackAttachment {
				title: format!("{}{} {mentions}", prefix(msg.resolved), msg.chain_label)
					.trim_end()
					.to_string(),
				color: if msg.resolved { "good" } else { "danger" },
			}],
		}
	}
}

#[async_trait]
impl Notifier for SlackNotifier {
	fn name(&self) -> &'static str {
		"Slack"
	}

	async fn notify(&self, msg: &AlertMsg) -> Result<(), MonitorError> {
		let route = msg
			.slack
			.as_ref()
			.ok_or_else(|| MonitorError::Config("slack sink has no route".into()))?;

		let payload = Self::build_message(msg, &route.mentions);
		let resp = self
			.http
			.post(&route.webhook)
			.json(&payload)
			.send()
			.await
			.map_err(MonitorError::from)?;

		match resp.status().as_u16() {
			200 => Ok(()),
			401 | 403 => Err(MonitorError::Auth("slack rejected the webhook".into())),
			429 => Err(MonitorError::RateLimited("slack".into())),
			code => Err(MonitorError::Network(format!(
				"slack returned status {code}"
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
	fn resolved_messages_flip_color_and_text() {
		let fire = alert_with_routes("http://x", false);
		let built = SlackNotifier::build_message(&fire, "@oncall");
		assert_eq!(built.attachments[0].color, "danger");
		assert_eq!(built.attachments[0].title, "ALERT: testchain (test-1) @oncall");
		assert_eq!(built.text, fire.message);

		let resolve = alert_with_routes("http://x", true);
		let built = SlackNotifier::build_message(&resolve, "");
		assert_eq!(built.attachments[0].color, "good");
		assert!(built.text.starts_with("OK: "));
	}

	#[tokio::test]
	async fn webhook_round_trip() {
		let mut server = mockito::Server::new_async().await;
		let mock = server
			.mock("POST", "/slack")
			.match_body(mockito::Matcher::PartialJsonString(
				r#"{"attachments": [{"color": "danger"}]}"#.to_string(),
			))
			.with_status(200)
			.with_body("ok")
			.create_async()
			.await;

		let notifier = SlackNotifier::new(build_client(&HttpClientConfig {
			max_retries: 0,
			..Default::default()
		}));
		let result = notifier
			.notify(&alert_with_routes(&server.url(), false))
			.await;
		assert!(result.is_ok());
		mock.assert_async().await;
	}
}
