//! Dashboard publishing.
//!
//! The hub is a pure sink: monitoring tasks push status snapshots and log
//! lines into it, and it fans them out to websocket subscribers while keeping
//! the latest state for the pull endpoint. Nothing here ever drives
//! monitoring behavior.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use actix_web::{web, App as ActixApp, HttpRequest, HttpResponse, HttpServer, Responder};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::models::{ChainStatus, LogMessage, MonitorError};

/// Log lines retained for the pull endpoint.
const LOG_RING_SIZE: usize = 256;
/// Broadcast buffer per subscriber; slow readers skip ahead.
const BROADCAST_CAPACITY: usize = 512;

/// One frame on the dashboard websocket.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum DashboardFrame {
	Status(Box<ChainStatus>),
	Log(LogMessage),
}

/// Pull-endpoint payload: current state plus recent logs.
#[derive(Debug, Serialize)]
pub struct DashboardSnapshot {
	pub chains: Vec<ChainStatus>,
	pub logs: Vec<LogMessage>,
}

/// Shared fan-out point for dashboard consumers.
pub struct DashboardHub {
	tx: broadcast::Sender<DashboardFrame>,
	statuses: RwLock<BTreeMap<String, ChainStatus>>,
	logs: RwLock<VecDeque<LogMessage>>,
	hide_logs: bool,
}

impl DashboardHub {
	pub fn new(hide_logs: bool) -> Arc<Self> {
		let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
		Arc::new(Self {
			tx,
			statuses: RwLock::new(BTreeMap::new()),
			logs: RwLock::new(VecDeque::with_capacity(LOG_RING_SIZE)),
			hide_logs,
		})
	}

	/// Stores the latest status for a chain and broadcasts it.
	pub async fn publish_status(&self, status: ChainStatus) {
		self.statuses
			.write()
			.await
			.insert(status.name.clone(), status.clone());
		let _ = self.tx.send(DashboardFrame::Status(Box::new(status)));
	}

	/// Mirrors a log line to dashboard subscribers. The operator stream has
	/// already logged it; with `hide_logs` the dashboard copy is dropped.
	pub async fn log(&self, msg: impl Into<String>) {
		if self.hide_logs {
			return;
		}
		let entry = LogMessage::now(msg);
		{
			let mut logs = self.logs.write().await;
			if logs.len() == LOG_RING_SIZE {
				logs.pop_front();
			}
			logs.push_back(entry.clone());
		}
		let _ = self.tx.send(DashboardFrame::Log(entry));
	}

	pub fn subscribe(&self) -> broadcast::Receiver<DashboardFrame> {
		self.tx.subscribe()
	}

	pub async fn snapshot(&self) -> DashboardSnapshot {
		DashboardSnapshot {
			chains: self.statuses.read().await.values().cloned().collect(),
			logs: self.logs.read().await.iter().cloned().collect(),
		}
	}
}

async fn state_handler(hub: web::Data<Arc<DashboardHub>>) -> impl Responder {
	HttpResponse::Ok().json(hub.snapshot().await)
}

async fn ws_handler(
	req: HttpRequest,
	body: web::Payload,
	hub: web::Data<Arc<DashboardHub>>,
) -> actix_web::Result<HttpResponse> {
	let (response, mut session, mut msg_stream) = actix_ws::handle(&req, body)?;
	let hub = hub.get_ref().clone();

	actix_web::rt::spawn(async move {
		let mut rx = hub.subscribe();

		// replay the current state so new clients render immediately
		for status in hub.snapshot().await.chains {
			let frame = DashboardFrame::Status(Box::new(status));
			if send_frame(&mut session, &frame).await.is_err() {
				return;
			}
		}

		loop {
			tokio::select! {
				frame = rx.recv() => match frame {
					Ok(frame) => {
						if send_frame(&mut session, &frame).await.is_err() {
							break;
						}
					}
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						debug!("dashboard client lagged, skipped {skipped} frames");
					}
					Err(broadcast::error::RecvError::Closed) => break,
				},
				msg = msg_stream.next() => match msg {
					Some(Ok(actix_ws::Message::Ping(bytes))) => {
						if session.pong(&bytes).await.is_err() {
							break;
						}
					}
					Some(Ok(actix_ws::Message::Close(_))) | None => break,
					Some(Ok(_)) => {}
					Some(Err(_)) => break,
				},
			}
		}
		let _ = session.close(None).await;
	});

	Ok(response)
}

async fn send_frame(
	session: &mut actix_ws::Session,
	frame: &DashboardFrame,
) -> Result<(), actix_ws::Closed> {
	match serde_json::to_string(frame) {
		Ok(json) => session.text(json).await,
		Err(_) => Ok(()),
	}
}

/// Builds the dashboard HTTP server from the configured listen URL
/// (e.g. `http://0.0.0.0:8888`).
pub fn create_dashboard_server(
	listen: &str,
	hub: Arc<DashboardHub>,
) -> Result<actix_web::dev::Server, MonitorError> {
	let parsed = url::Url::parse(listen)
		.map_err(|e| MonitorError::Config(format!("bad dashboard listen URL {listen:?}: {e}")))?;
	let host = parsed.host_str().unwrap_or("0.0.0.0").to_string();
	let port = parsed
		.port_or_known_default()
		.ok_or_else(|| MonitorError::Config(format!("no port in listen URL {listen:?}")))?;

	info!("dashboard listening on {host}:{port}");
	HttpServer::new(move || {
		ActixApp::new()
			.app_data(web::Data::new(hub.clone()))
			.route("/state", web::get().to(state_handler))
			.route("/ws", web::get().to(ws_handler))
	})
	.workers(2)
	.bind((host, port))
	.map_err(|e| MonitorError::Config(format!("cannot bind dashboard: {e}")))
	.map(|s| s.shutdown_timeout(5).run())
}

#[cfg(test)]
mod tests {
	use super::*;
	use actix_web::test;

	fn status(name: &str) -> ChainStatus {
		ChainStatus {
			msg_type: "status".into(),
			name: name.into(),
			chain_id: "test-1".into(),
			moniker: "val".into(),
			bonded: true,
			jailed: false,
			tombstoned: false,
			missed: 0,
			window: 10_000,
			min_signed_per_window: 0.05,
			nodes: 1,
			healthy_nodes: 1,
			active_alerts: 0,
			height: 42,
			last_error: String::new(),
			unvoted_open_gov_proposals: 0,
			total_bonded_tokens: 0.0,
			total_supply: 0.0,
			community_tax: 0.0,
			inflation_rate: 0.0,
			base_apr: 0.0,
			validator_apr: 0.0,
			projected_30d_rewards: 0.0,
			voting_power_percent: 0.0,
			delegated_tokens: 0.0,
			commission_rate: 0.0,
			self_delegation_rewards: vec![],
			commission: vec![],
			crypto_price: None,
			denom_metadata: None,
			blocks: vec![-1; crate::models::TAPE_LEN],
		}
	}

	#[tokio::test]
	async fn hub_keeps_latest_status_per_chain() {
		let hub = DashboardHub::new(false);
		hub.publish_status(status("a")).await;
		let mut second = status("a");
		second.height = 43;
		hub.publish_status(second).await;
		hub.publish_status(status("b")).await;

		let snap = hub.snapshot().await;
		assert_eq!(snap.chains.len(), 2);
		assert_eq!(snap.chains[0].height, 43);
	}

	#[tokio::test]
	async fn log_ring_is_bounded_and_hide_logs_suppresses() {
		let hub = DashboardHub::new(false);
		for i in 0..(LOG_RING_SIZE + 10) {
			hub.log(format!("line {i}")).await;
		}
		let snap = hub.snapshot().await;
		assert_eq!(snap.logs.len(), LOG_RING_SIZE);
		assert_eq!(snap.logs[0].msg, "line 10");

		let hidden = DashboardHub::new(true);
		hidden.log("secret").await;
		assert!(hidden.snapshot().await.logs.is_empty());
	}

	#[tokio::test]
	async fn subscribers_receive_published_frames() {
		let hub = DashboardHub::new(false);
		let mut rx = hub.subscribe();
		hub.publish_status(status("a")).await;
		match rx.recv().await.unwrap() {
			DashboardFrame::Status(s) => assert_eq!(s.name, "a"),
			other => panic!("unexpected frame {other:?}"),
		}
	}

	#[actix_web::test]
	async fn state_endpoint_serves_snapshot() {
		let hub = DashboardHub::new(false);
		hub.publish_status(status("a")).await;
		hub.log("hello").await;

		let app = test::init_service(
			ActixApp::new()
				.app_data(web::Data::new(hub.clone()))
				.route("/state", web::get().to(state_handler)),
		)
		.await;
		let resp =
			test::call_service(&app, test::TestRequest::get().uri("/state").to_request()).await;
		assert!(resp.status().is_success());
		let body: serde_json::Value = test::read_body_json(resp).await;
		assert_eq!(body["chains"][0]["name"], "a");
		assert_eq!(body["chains"][0]["msgType"], "status");
		assert_eq!(body["logs"][0]["msg"], "hello");
	}
}
