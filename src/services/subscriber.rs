//! Websocket event intake.
//!
//! One connection per chain, subscribed to `NewBlock` and `Vote` events.
//! Parsed frames are pushed onto a bounded channel; a slow consumer blocks
//! the reader, applying backpressure to the socket. On any error the
//! subscriber backs off (exponentially, capped at 30 s), re-picks an endpoint
//! from the fleet, resubscribes, and emits a `Resync` frame so the tape can
//! blank the gap.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tracing::{debug, info, warn};

use crate::models::MonitorError;
use crate::services::Chain;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// One frame out of the event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WsFrame {
	NewBlock(BlockEvent),
	Vote(VoteEvent),
	/// The stream reconnected; heights between the last commit and `height`
	/// carry no data.
	Resync { height: i64 },
}

/// A `NewBlock` event reduced to what attribution needs.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockEvent {
	pub height: i64,
	pub time: Option<DateTime<Utc>>,
	/// Proposer consensus address, upper-case hex.
	pub proposer: String,
	pub tx_count: usize,
	/// Validators (upper-case hex) whose precommit made it into this block's
	/// `last_commit`, i.e. the signers of height - 1.
	pub last_commit_signers: Vec<String>,
}

/// A consensus `Vote` event.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteEvent {
	pub height: i64,
	/// 1 = prevote, 2 = precommit.
	pub vote_type: u8,
	pub validator: String,
}

/// Parses one websocket text payload into a frame. Subscription
/// confirmations and unknown events yield `None`.
pub fn parse_event(raw: &str) -> Option<WsFrame> {
	let v: Value = serde_json::from_str(raw).ok()?;
	let data = v.pointer("/result/data")?;
	match data.get("type")?.as_str()? {
		"tendermint/event/NewBlock" => {
			let block = data.pointer("/value/block")?;
			let header = block.get("header")?;
			let height: i64 = header.get("height")?.as_str()?.parse().ok()?;
			let time = header
				.get("time")
				.and_then(Value::as_str)
				.and_then(|s| s.parse().ok());
			let proposer = header
				.get("proposer_address")
				.and_then(Value::as_str)
				.unwrap_or_default()
				.to_ascii_uppercase();
			let tx_count = block
				.pointer("/data/txs")
				.and_then(Value::as_array)
				.map(|t| t.len())
				.unwrap_or(0);
			let last_commit_signers = block
				.pointer("/last_commit/signatures")
				.and_then(Value::as_array)
				.map(|sigs| {
					sigs.iter()
						.filter(|s| sig_is_commit(s))
						.filter_map(|s| s.get("validator_address").and_then(Value::as_str))
						.map(str::to_ascii_uppercase)
						.collect()
				})
				.unwrap_or_default();
			Some(WsFrame::NewBlock(BlockEvent {
				height,
				time,
				proposer,
				tx_count,
				last_commit_signers,
			}))
		}
		"tendermint/event/Vote" => {
			let vote = data.pointer("/value/Vote")?;
			let height: i64 = vote.get("height")?.as_str()?.parse().ok()?;
			let vote_type = match vote.get("type")? {
				Value::Number(n) => n.as_u64()? as u8,
				Value::String(s) if s.contains("PREVOTE") => 1,
				Value::String(s) if s.contains("PRECOMMIT") => 2,
				_ => return None,
			};
			let validator = vote
				.get("validator_address")
				.and_then(Value::as_str)
				.unwrap_or_default()
				.to_ascii_uppercase();
			Some(WsFrame::Vote(VoteEvent {
				height,
				vote_type,
				validator,
			}))
		}
		_ => None,
	}
}

/// A commit flag of 2 (or the spelled-out enum name) means the signature is
/// present; absent and nil votes do not count as signing.
fn sig_is_commit(sig: &Value) -> bool {
	match sig.get("block_id_flag") {
		Some(Value::Number(n)) => n.as_i64() == Some(2),
		Some(Value::String(s)) => s.contains("COMMIT"),
		_ => false,
	}
}

/// Converts an RPC base url into the websocket endpoint.
fn ws_url(rpc_url: &str) -> String {
	let replaced = if let Some(rest) = rpc_url.strip_prefix("https://") {
		format!("wss://{rest}")
	} else if let Some(rest) = rpc_url.strip_prefix("http://") {
		format!("ws://{rest}")
	} else {
		rpc_url.to_string()
	};
	format!("{}/websocket", replaced.trim_end_matches('/'))
}

/// Long-lived event intake for one chain.
pub struct EventSubscriber {
	chain: Arc<Chain>,
	frames: mpsc::Sender<WsFrame>,
	tls_skip_verify: bool,
}

impl EventSubscriber {
	pub fn new(chain: Arc<Chain>, frames: mpsc::Sender<WsFrame>, tls_skip_verify: bool) -> Self {
		Self {
			chain,
			frames,
			tls_skip_verify,
		}
	}

	/// Connects, subscribes, and streams until shutdown, reconnecting with
	/// backoff on every failure.
	pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
		let mut backoff = INITIAL_BACKOFF;
		loop {
			if *shutdown.borrow() {
				break;
			}
			match self.chain.fleet.pick().await {
				Ok(url) => {
					let started = std::time::Instant::now();
					match self.stream_from(&url, &mut shutdown).await {
						Ok(()) => break, // clean shutdown
						Err(e) => {
							warn!("websocket stream from {url} ended: {e}");
							self.chain.set_last_error(&e).await;
							self.chain.fleet.mark_down(&url, &e).await;
							// a connection that held for a while earns a
							// fresh backoff
							backoff = if started.elapsed() > Duration::from_secs(60) {
								INITIAL_BACKOFF
							} else {
								(backoff * 2).min(MAX_BACKOFF)
							};
						}
					}
				}
				Err(e) => {
					debug!("no endpoint available for {}: {e}", self.chain.name);
					backoff = (backoff * 2).min(MAX_BACKOFF);
				}
			}
			tokio::select! {
				_ = shutdown.changed() => break,
				_ = tokio::time::sleep(backoff) => {}
			}
		}
	}

	async fn stream_from(
		&self,
		url: &str,
		shutdown: &mut watch::Receiver<bool>,
	) -> Result<(), MonitorError> {
		let endpoint = ws_url(url);
		let connector = if self.tls_skip_verify {
			let tls = native_tls::TlsConnector::builder()
				.danger_accept_invalid_certs(true)
				.build()
				.map_err(|e| MonitorError::Network(e.to_string()))?;
			Some(Connector::NativeTls(tls))
		} else {
			None
		};

		let (mut socket, _) =
			connect_async_tls_with_config(endpoint.as_str(), None, false, connector)
				.await
				.map_err(|e| MonitorError::Network(format!("connect {endpoint}: {e}")))?;

		for (id, query) in [(1, "tm.event='NewBlock'"), (2, "tm.event='Vote'")] {
			let sub = json!({
				"jsonrpc": "2.0",
				"method": "subscribe",
				"id": id,
				"params": {"query": query},
			});
			socket
				.send(Message::Text(sub.to_string().into()))
				.await
				.map_err(|e| MonitorError::Network(format!("subscribe: {e}")))?;
		}

		info!("subscribed to events on {endpoint}");

		// the consumer blanks everything between its last commit and here
		let latest = self.chain.fleet.latest_height();
		if latest > 0 {
			self.send_frame(WsFrame::Resync { height: latest }).await?;
		}

		loop {
			tokio::select! {
				_ = shutdown.changed() => {
					let _ = socket.close(None).await;
					return Ok(());
				}
				msg = socket.next() => match msg {
					Some(Ok(Message::Text(text))) => {
						if let Some(frame) = parse_event(text.as_str()) {
							self.send_frame(frame).await?;
						}
					}
					Some(Ok(Message::Ping(payload))) => {
						socket
							.send(Message::Pong(payload))
							.await
							.map_err(|e| MonitorError::Network(e.to_string()))?;
					}
					Some(Ok(Message::Close(_))) | None => {
						return Err(MonitorError::Network("websocket closed by peer".into()));
					}
					Some(Ok(_)) => {}
					Some(Err(e)) => return Err(MonitorError::Network(e.to_string())),
				},
			}
		}
	}

	async fn send_frame(&self, frame: WsFrame) -> Result<(), MonitorError> {
		self.frames
			.send(frame)
			.await
			.map_err(|_| MonitorError::Canceled)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const NEW_BLOCK: &str = r#"{
		"jsonrpc": "2.0", "id": 1,
		"result": {
			"query": "tm.event='NewBlock'",
			"data": {
				"type": "tendermint/event/NewBlock",
				"value": {
					"block": {
						"header": {
							"height": "12345",
							"time": "2025-03-01T12:00:00.123456789Z",
							"proposer_address": "aabbccddeeff00112233445566778899aabbccdd"
						},
						"data": {"txs": ["dGVzdA=="]},
						"last_commit": {
							"signatures": [
								{"block_id_flag": 2, "validator_address": "AABBCCDDEEFF00112233445566778899AABBCCDD", "signature": "xx"},
								{"block_id_flag": 1, "validator_address": "", "signature": null},
								{"block_id_flag": 3, "validator_address": "1111111111111111111111111111111111111111", "signature": "yy"}
							]
						}
					}
				}
			}
		}
	}"#;

	const VOTE: &str = r#"{
		"jsonrpc": "2.0", "id": 2,
		"result": {
			"query": "tm.event='Vote'",
			"data": {
				"type": "tendermint/event/Vote",
				"value": {
					"Vote": {
						"type": 1,
						"height": "12346",
						"validator_address": "aabbccddeeff00112233445566778899aabbccdd"
					}
				}
			}
		}
	}"#;

	#[test]
	fn parses_new_block() {
		let frame = parse_event(NEW_BLOCK).expect("frame");
		let WsFrame::NewBlock(block) = frame else {
			panic!("expected NewBlock");
		};
		assert_eq!(block.height, 12_345);
		assert!(block.time.is_some());
		assert_eq!(block.proposer, "AABBCCDDEEFF00112233445566778899AABBCCDD");
		assert_eq!(block.tx_count, 1);
		// only the flag-2 signature counts as a commit
		assert_eq!(
			block.last_commit_signers,
			vec!["AABBCCDDEEFF00112233445566778899AABBCCDD".to_string()]
		);
	}

	#[test]
	fn parses_vote() {
		let frame = parse_event(VOTE).expect("frame");
		assert_eq!(
			frame,
			WsFrame::Vote(VoteEvent {
				height: 12_346,
				vote_type: 1,
				validator: "AABBCCDDEEFF00112233445566778899AABBCCDD".into(),
			})
		);
	}

	#[test]
	fn subscription_confirmations_are_ignored() {
		assert_eq!(parse_event(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#), None);
		assert_eq!(parse_event("not even json"), None);
	}

	#[test]
	fn string_block_id_flags_are_understood() {
		let raw = NEW_BLOCK.replace(
			r#""block_id_flag": 2"#,
			r#""block_id_flag": "BLOCK_ID_FLAG_COMMIT""#,
		);
		let WsFrame::NewBlock(block) = parse_event(&raw).unwrap() else {
			panic!("expected NewBlock");
		};
		assert_eq!(block.last_commit_signers.len(), 1);
	}

	#[test]
	fn ws_url_conversion() {
		assert_eq!(
			ws_url("https://rpc.example.com"),
			"wss://rpc.example.com/websocket"
		);
		assert_eq!(
			ws_url("http://127.0.0.1:26657/"),
			"ws://127.0.0.1:26657/websocket"
		);
	}
}
