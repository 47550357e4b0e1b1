//! PagerDuty Events v2 sink.
//!
//! Fires map to `trigger`, resolutions to `resolve`, and the alert id doubles
//! as the external dedup key, so PagerDuty collapses repeats on its side as
//! well.

use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::Serialize;

use crate::models::MonitorError;
use crate::services::alerts::AlertMsg;
use crate::services::notification::Notifier;

const EVENTS_URL: &str = "https://events.pagerduty.com/v2/enqueue";

/// The routing key from PagerDuty's own documentation examples; sending with
/// it would only spam their API.
const EXAMPLE_KEY: &str = "aaaaaaaaaaaabbbbbbbbbbbbbcccccccccccc";

#[derive(Debug, Serialize)]
struct EventPayload {
	summary: String,
	source: String,
	severity: String,
}

#[derive(Debug, Serialize)]
struct Event {
	routing_key: String,
	event_action: &'static str,
	dedup_key: String,
	payload: EventPayload,
}

pub struct PagerdutyNotifier {
	http: ClientWithMiddleware,
	events_url: String,
}

impl PagerdutyNotifier {
	pub fn new(http: ClientWithMiddleware) -> Self {
		Self {
			http,
			events_url: EVENTS_URL.to_string(),
		}
	}

	#[cfg(test)]
	pub fn with_events_url(mut self, url: String) -> Self {
		self.events_url = url;
		self
	}

	fn build_event(msg: &AlertMsg, routing_key: String) -> Event {
		Event {
			routing_key,
			event_action: if msg.resolved { "resolve" } else { "trigger" },
			dedup_key: msg.alert_id.clone(),
			payload: EventPayload {
				summary: msg.message.clone(),
				source: msg.alert_id.clone(),
				severity: msg.severity.to_string(),
			},
		}
	}
}

#[async_trait]
impl Notifier for PagerdutyNotifier {
	fn name(&self) -> &'static str {
		"PagerDuty"
	}

	async fn notify(&self, msg: &AlertMsg) -> Result<(), MonitorError> {
		let route = msg
			.pagerduty
			.as_ref()
			.ok_or_else(|| MonitorError::Config("pagerduty sink has no route".into()))?;
		if route.api_key == EXAMPLE_KEY {
			return Err(MonitorError::Auth("refusing to use the example key".into()));
		}

		let event = Self::build_event(msg, route.api_key.clone());
		let resp = self
			.http
			.post(&self.events_url)
			.json(&event)
			.send()
			.await
			.map_err(MonitorError::from)?;

		match resp.status().as_u16() {
			202 => Ok(()),
			401 | 403 => Err(MonitorError::Auth("pagerduty rejected the routing key".into())),
			429 => Err(MonitorError::RateLimited("pagerduty".into())),
			code => Err(MonitorError::Network(format!(
				"pagerduty returned status {code}"
			))),
		}
	}
}
