//! Outbound notification sinks.
//!
//! A single worker drains the alert channel and fans each message out to the
//! sinks the alert carries routes for. Per-sink dedup, severity filtering,
//! and flap suppression live in the alarm cache; by the time a sink's
//! `notify` runs, the decision to send has already been made. Send failures
//! are logged and never retried - the next evaluation cycle is the retry.

pub mod discord;
pub mod pagerduty;
pub mod slack;
pub mod telegram;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::models::MonitorError;
use crate::services::alerts::cache::Sink;
use crate::services::alerts::AlertMsg;
use crate::services::App;
use crate::utils::http::{build_client, HttpClientConfig};

pub use discord::DiscordNotifier;
pub use pagerduty::PagerdutyNotifier;
pub use slack::SlackNotifier;
pub use telegram::TelegramNotifier;

/// Deadline for a single notification send.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// A notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
	fn name(&self) -> &'static str;
	async fn notify(&self, msg: &AlertMsg) -> Result<(), MonitorError>;
}

/// Owns the sink implementations and the fan-out loop.
pub struct NotificationService {
	pagerduty: PagerdutyNotifier,
	telegram: TelegramNotifier,
	discord: DiscordNotifier,
	slack: SlackNotifier,
}

impl NotificationService {
	pub fn new(tls_skip_verify: bool) -> Self {
		let http = build_client(&HttpClientConfig {
			timeout: SEND_TIMEOUT,
			max_retries: 0,
			tls_skip_verify,
		});
		Self {
			pagerduty: PagerdutyNotifier::new(http.clone()),
			telegram: TelegramNotifier::new(http.clone()),
			discord: DiscordNotifier::new(http.clone()),
			slack: SlackNotifier::new(http),
		}
	}

	/// Fans one alert out to every sink it carries a route for, consulting
	/// the alarm cache per sink.
	pub async fn deliver(&self, app: &App, msg: &AlertMsg) {
		let reminder =
			chrono::Duration::hours(app.cfg.governance_alerts_reminder_interval.max(1));
		let now = Utc::now();

		let sends: [(Sink, Option<crate::models::Severity>, &dyn Notifier); 4] = [
			(
				Sink::Pagerduty,
				msg.pagerduty.as_ref().map(|r| r.threshold),
				&self.pagerduty,
			),
			(
				Sink::Telegram,
				msg.telegram.as_ref().map(|r| r.threshold),
				&self.telegram,
			),
			(
				Sink::Discord,
				msg.discord.as_ref().map(|r| r.threshold),
				&self.discord,
			),
			(Sink::Slack, msg.slack.as_ref().map(|r| r.threshold), &self.slack),
		];

		for (sink, threshold, notifier) in sends {
			let Some(threshold) = threshold else {
				continue;
			};
			if !app
				.alarms
				.should_notify(msg, sink, threshold, reminder, now)
				.await
			{
				continue;
			}
			if let Err(e) = notifier.notify(msg).await {
				error!(
					"could not notify {} for {} ({}): {e}",
					notifier.name(),
					msg.chain_label,
					msg.alert_id
				);
				app.dashboard
					.log(format!("notification to {} failed: {e}", notifier.name()))
					.await;
			}
		}
	}
}

/// Drains the alert channel until it closes or shutdown is signaled.
pub async fn run_worker(
	app: Arc<App>,
	service: NotificationService,
	mut rx: mpsc::Receiver<AlertMsg>,
	mut shutdown: watch::Receiver<bool>,
) {
	loop {
		tokio::select! {
			_ = shutdown.changed() => break,
			msg = rx.recv() => match msg {
				Some(msg) => service.deliver(&app, &msg).await,
				None => break,
			},
		}
	}
	info!("notification worker stopped");
}

/// Message prefix shared by the chat sinks.
pub(crate) fn prefix(resolved: bool) -> &'static str {
	if resolved {
		"Resolved: "
	} else {
		"ALERT: "
	}
}
