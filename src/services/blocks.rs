//! Drives the block tape from the event stream.
//!
//! Outcomes are committed one block behind the stream head: the precommit
//! evidence for height `h` is carried in the `last_commit` of `h+1`, so a
//! block is attributed when its successor arrives. Vote events fill in
//! prevote/precommit evidence for the heights still in flight.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::models::{attribute, BlockOutcome, ChainState, VoteEvidence};
use crate::services::subscriber::{BlockEvent, VoteEvent, WsFrame};
use crate::services::{App, Chain};
use crate::utils::metrics::MetricKind;

/// Vote evidence is kept for a few heights around the head to tolerate
/// interleaving across adjacent blocks.
const VOTE_WINDOW: i64 = 8;

/// Pure tape-advancement logic, separated from the async plumbing so it can
/// be exercised directly.
#[derive(Default)]
pub struct TapeDriver {
	pending: Option<BlockEvent>,
	votes: HashMap<i64, VoteEvidence>,
}

impl TapeDriver {
	pub fn new() -> Self {
		Self::default()
	}

	/// Records vote-channel evidence. `our_hex` is the monitored validator's
	/// consensus address in upper hex (may be empty before the first
	/// validator refresh).
	pub fn on_vote(&mut self, our_hex: &str, vote: &VoteEvent) {
		let entry = self.votes.entry(vote.height).or_default();
		entry.any = true;
		if !our_hex.is_empty() && vote.validator == our_hex {
			match vote.vote_type {
				1 => entry.our_prevote = true,
				2 => entry.our_precommit = true,
				_ => {}
			}
		}
	}

	/// Handles a reconnect marker: everything between the last committed
	/// height and `height` is unknowable.
	pub fn on_resync(&mut self, state: &mut ChainState, height: i64) {
		self.pending = None;
		self.votes.clear();
		if state.anchored {
			state.tape.mark_gap(state.tape.head_height(), height);
		}
	}

	/// Applies a new block, committing the outcome of its predecessor.
	/// Returns the committed `(height, outcome)` when one was finalized.
	pub fn on_block(
		&mut self,
		state: &mut ChainState,
		our_hex: &str,
		block: BlockEvent,
	) -> Option<(i64, BlockOutcome)> {
		if !state.anchored {
			state.tape.anchor(block.height);
			state.anchored = true;
		}

		let committed = match self.pending.take() {
			Some(prev) if block.height == prev.height + 1 => {
				let outcome = if our_hex.is_empty() {
					BlockOutcome::NoData
				} else {
					let proposed = prev.proposer == our_hex;
					let precommitted = block
						.last_commit_signers
						.iter()
						.any(|signer| signer == our_hex);
					attribute(
						proposed,
						prev.tx_count > 0,
						precommitted,
						self.votes.get(&prev.height),
					)
				};
				state.tape.record(prev.height, outcome);
				Some((prev.height, outcome))
			}
			Some(prev) => {
				// stream skipped ahead; the pending block and the gap are lost
				debug!(
					"non-contiguous stream: pending {} followed by {}",
					prev.height, block.height
				);
				state.tape.mark_gap(state.tape.head_height(), block.height);
				None
			}
			None => None,
		};

		state.last_block_time = block.time.or_else(|| Some(Utc::now()));
		state.last_block_num = block.height;

		let head = block.height;
		self.votes.retain(|h, _| *h + VOTE_WINDOW >= head);
		self.pending = Some(block);
		committed
	}
}

/// Consumes frames for one chain until the channel closes or shutdown.
pub async fn run_consumer(
	chain: Arc<Chain>,
	app: Arc<App>,
	mut frames: mpsc::Receiver<WsFrame>,
	mut shutdown: watch::Receiver<bool>,
) {
	let mut driver = TapeDriver::new();
	let mut our_hex = String::new();

	loop {
		let frame = tokio::select! {
			_ = shutdown.changed() => break,
			frame = frames.recv() => match frame {
				Some(f) => f,
				None => break,
			},
		};

		match frame {
			WsFrame::Vote(vote) => driver.on_vote(&our_hex, &vote),
			WsFrame::Resync { height } => {
				let mut state = chain.state.write().await;
				driver.on_resync(&mut state, height);
			}
			WsFrame::NewBlock(block) => {
				let committed = {
					let mut state = chain.state.write().await;
					our_hex = hex::encode_upper(&state.val.conspub);
					driver.on_block(&mut state, &our_hex, block)
				};

				if let Some((height, outcome)) = committed {
					if outcome.is_miss() {
						app.dashboard
							.log(format!("{} missed block {height}", chain.name))
							.await;
					}
				}

				let moniker = chain.state.read().await.val.moniker.clone();
				app.stat(chain.mk_update(&moniker, MetricKind::LastBlockSeconds, 0.0, ""));
				app.publish_status(&chain).await;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const OUR: &str = "AAAA000000000000000000000000000000000000";
	const OTHER: &str = "BBBB000000000000000000000000000000000000";

	fn block(height: i64, proposer: &str, txs: usize, signers: &[&str]) -> BlockEvent {
		BlockEvent {
			height,
			time: Some(Utc::now()),
			proposer: proposer.to_string(),
			tx_count: txs,
			last_commit_signers: signers.iter().map(|s| s.to_string()).collect(),
		}
	}

	fn vote(height: i64, vote_type: u8, validator: &str) -> VoteEvent {
		VoteEvent {
			height,
			vote_type,
			validator: validator.to_string(),
		}
	}

	#[test]
	fn signed_block_attribution() {
		let mut driver = TapeDriver::new();
		let mut state = ChainState::default();
		assert_eq!(driver.on_block(&mut state, OUR, block(100, OTHER, 1, &[])), None);
		let committed = driver.on_block(&mut state, OUR, block(101, OTHER, 1, &[OUR, OTHER]));
		assert_eq!(committed, Some((100, BlockOutcome::Signed)));
		assert_eq!(state.tape.outcome_at(100), Some(BlockOutcome::Signed));
		assert_eq!(state.last_block_num, 101);
	}

	#[test]
	fn proposer_attribution_and_empty_blocks() {
		let mut driver = TapeDriver::new();
		let mut state = ChainState::default();
		driver.on_block(&mut state, OUR, block(100, OUR, 2, &[]));
		assert_eq!(
			driver.on_block(&mut state, OUR, block(101, OUR, 0, &[OUR])),
			Some((100, BlockOutcome::Proposed))
		);
		assert_eq!(
			driver.on_block(&mut state, OUR, block(102, OTHER, 1, &[OUR])),
			Some((101, BlockOutcome::EmptyProposed))
		);
		assert_eq!(state.tape.counters.total_proposed, 2);
		assert_eq!(state.tape.counters.total_proposed_empty, 1);
	}

	#[test]
	fn missed_precommit_vs_prevote_vs_missed() {
		let mut driver = TapeDriver::new();
		let mut state = ChainState::default();

		// height 100: our prevote seen, no precommit in 101's commit
		driver.on_block(&mut state, OUR, block(100, OTHER, 1, &[]));
		driver.on_vote(OUR, &vote(100, 1, OUR));
		assert_eq!(
			driver.on_block(&mut state, OUR, block(101, OTHER, 1, &[OTHER])),
			Some((100, BlockOutcome::MissedPrecommit))
		);

		// height 101: other validators voted, we did not
		driver.on_vote(OUR, &vote(101, 1, OTHER));
		assert_eq!(
			driver.on_block(&mut state, OUR, block(102, OTHER, 1, &[OTHER])),
			Some((101, BlockOutcome::MissedPrevote))
		);

		// height 102: no vote-channel data at all
		assert_eq!(
			driver.on_block(&mut state, OUR, block(103, OTHER, 1, &[OTHER])),
			Some((102, BlockOutcome::Missed))
		);

		assert_eq!(state.tape.counters.consecutive_missed, 3);
		assert_eq!(state.tape.counters.prevote_misses, 1);
		assert_eq!(state.tape.counters.precommit_misses, 1);
	}

	#[test]
	fn out_of_order_votes_within_window_still_count() {
		let mut driver = TapeDriver::new();
		let mut state = ChainState::default();
		driver.on_block(&mut state, OUR, block(100, OTHER, 1, &[]));
		// votes for 100 and 101 interleave before 101 lands
		driver.on_vote(OUR, &vote(101, 1, OUR));
		driver.on_vote(OUR, &vote(100, 1, OUR));
		driver.on_block(&mut state, OUR, block(101, OTHER, 1, &[OTHER]));
		assert_eq!(
			driver.on_block(&mut state, OUR, block(102, OTHER, 1, &[OTHER])),
			Some((101, BlockOutcome::MissedPrecommit))
		);
	}

	#[test]
	fn resync_blanks_the_gap() {
		let mut driver = TapeDriver::new();
		let mut state = ChainState::default();
		driver.on_block(&mut state, OUR, block(100, OTHER, 1, &[]));
		driver.on_block(&mut state, OUR, block(101, OTHER, 1, &[OUR]));

		driver.on_resync(&mut state, 110);
		driver.on_block(&mut state, OUR, block(110, OTHER, 1, &[]));
		driver.on_block(&mut state, OUR, block(111, OTHER, 1, &[OUR]));

		for h in 101..110 {
			assert_eq!(state.tape.outcome_at(h), Some(BlockOutcome::NoData), "height {h}");
		}
		assert_eq!(state.tape.outcome_at(110), Some(BlockOutcome::Signed));
	}

	#[test]
	fn unknown_identity_records_no_data() {
		let mut driver = TapeDriver::new();
		let mut state = ChainState::default();
		driver.on_block(&mut state, "", block(100, OTHER, 1, &[]));
		assert_eq!(
			driver.on_block(&mut state, "", block(101, OTHER, 1, &[OTHER])),
			Some((100, BlockOutcome::NoData))
		);
		assert_eq!(state.tape.counters.consecutive_missed, 0);
	}

	#[test]
	fn vote_window_is_pruned() {
		let mut driver = TapeDriver::new();
		let mut state = ChainState::default();
		driver.on_vote(OUR, &vote(100, 1, OUR));
		driver.on_block(&mut state, OUR, block(200, OTHER, 1, &[]));
		assert!(driver.votes.is_empty());
	}
}
