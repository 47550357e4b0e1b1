//! Per-block outcomes and the fixed-length block tape.
//!
//! The tape is a 512-slot ring indexed by block height modulo its length. A
//! block's outcome is only recorded once the following block has been seen,
//! because the precommit evidence for height `h` travels in the `last_commit`
//! of height `h+1`.

use serde::{Deserialize, Serialize};

/// Number of outcomes the tape retains. Also the number of cells rendered on
/// the dashboard grid.
pub const TAPE_LEN: usize = 512;

/// What the monitored validator did (or failed to do) for one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockOutcome {
	/// No participation evidence and no vote-channel data for the height.
	Missed,
	/// Vote data existed for the height but neither of our votes appeared.
	MissedPrevote,
	/// Our prevote was seen but the precommit never landed in the commit.
	MissedPrecommit,
	/// Our precommit is present in the next block's commit.
	Signed,
	/// We proposed the block and it carried at least one transaction.
	Proposed,
	/// We proposed the block and it was empty.
	EmptyProposed,
	/// The slot was skipped (startup, resync gap, or websocket outage).
	NoData,
}

impl BlockOutcome {
	/// Compact integer code used in the persisted state file and the
	/// dashboard's tape snapshot.
	pub fn code(self) -> i8 {
		match self {
			BlockOutcome::Missed => 0,
			BlockOutcome::MissedPrevote => 1,
			BlockOutcome::MissedPrecommit => 2,
			BlockOutcome::Signed => 3,
			BlockOutcome::Proposed => 4,
			BlockOutcome::EmptyProposed => 5,
			BlockOutcome::NoData => -1,
		}
	}

	pub fn from_code(code: i8) -> Self {
		match code {
			0 => BlockOutcome::Missed,
			1 => BlockOutcome::MissedPrevote,
			2 => BlockOutcome::MissedPrecommit,
			3 => BlockOutcome::Signed,
			4 => BlockOutcome::Proposed,
			5 => BlockOutcome::EmptyProposed,
			_ => BlockOutcome::NoData,
		}
	}

	/// True for any outcome counting toward the consecutive-miss alarm.
	pub fn is_miss(self) -> bool {
		matches!(
			self,
			BlockOutcome::Missed | BlockOutcome::MissedPrevote | BlockOutcome::MissedPrecommit
		)
	}

	/// True when the validator participated in the block.
	pub fn is_participation(self) -> bool {
		matches!(
			self,
			BlockOutcome::Signed | BlockOutcome::Proposed | BlockOutcome::EmptyProposed
		)
	}
}

/// Running totals maintained incrementally as outcomes are recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TapeCounters {
	pub consecutive_missed: u64,
	pub consecutive_empty: u64,
	pub total_signed: u64,
	pub total_proposed: u64,
	pub total_proposed_empty: u64,
	pub prevote_misses: u64,
	pub precommit_misses: u64,
}

impl TapeCounters {
	fn apply(&mut self, outcome: BlockOutcome) {
		if outcome.is_miss() {
			self.consecutive_missed += 1;
		}
		if outcome.is_participation() {
			self.consecutive_missed = 0;
		}
		match outcome {
			BlockOutcome::MissedPrevote => self.prevote_misses += 1,
			BlockOutcome::MissedPrecommit => self.precommit_misses += 1,
			BlockOutcome::Signed => self.total_signed += 1,
			BlockOutcome::Proposed => {
				self.total_proposed += 1;
				self.consecutive_empty = 0;
			}
			BlockOutcome::EmptyProposed => {
				self.total_proposed += 1;
				self.total_proposed_empty += 1;
				self.consecutive_empty += 1;
			}
			_ => {}
		}
	}

	/// Share of proposed blocks that were empty, as a percentage.
	pub fn empty_percent(&self) -> f64 {
		if self.total_proposed == 0 {
			return 0.0;
		}
		100.0 * self.total_proposed_empty as f64 / self.total_proposed as f64
	}
}

/// Fixed-length ring of block outcomes plus the derived counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockTape {
	slots: Vec<BlockOutcome>,
	/// Height of the most recently recorded outcome, 0 before the first one.
	head_height: i64,
	pub counters: TapeCounters,
}

impl Default for BlockTape {
	fn default() -> Self {
		Self {
			slots: vec![BlockOutcome::NoData; TAPE_LEN],
			head_height: 0,
			counters: TapeCounters::default(),
		}
	}
}

impl BlockTape {
	/// Restores a tape from a persisted snapshot (oldest outcome first).
	/// Snapshots shorter or longer than the tape are clamped; counters other
	/// than the consecutive ones are rebuilt from the visible window.
	pub fn from_snapshot(codes: &[i8]) -> Self {
		let mut tape = Self::default();
		for &code in codes.iter().rev().take(TAPE_LEN).rev() {
			tape.record_next(BlockOutcome::from_code(code));
		}
		tape
	}

	fn record_next(&mut self, outcome: BlockOutcome) {
		self.head_height += 1;
		let idx = (self.head_height % TAPE_LEN as i64) as usize;
		self.slots[idx] = outcome;
		self.counters.apply(outcome);
	}

	/// Records the outcome for `height`. Heights must be presented in
	/// ascending order; a gap is filled with `NoData` first so that slot
	/// `height % TAPE_LEN` always holds the outcome for `height`.
	pub fn record(&mut self, height: i64, outcome: BlockOutcome) {
		if height <= self.head_height {
			// late or duplicate commit, the slot already advanced past it
			return;
		}
		if self.head_height == 0 {
			self.head_height = height - 1;
		}
		self.mark_gap(self.head_height, height);
		self.record_next(outcome);
		debug_assert_eq!(self.head_height, height);
	}

	/// Fills every slot for heights in `(after, before)` with `NoData`.
	pub fn mark_gap(&mut self, after: i64, before: i64) {
		if self.head_height == 0 && before > 0 {
			self.head_height = after.max(before - 1 - TAPE_LEN as i64).max(0);
		}
		while self.head_height + 1 < before {
			if before - self.head_height > TAPE_LEN as i64 {
				// nothing in the window survives, skip ahead
				self.slots.fill(BlockOutcome::NoData);
				self.head_height = before - 1;
				self.counters.consecutive_missed = 0;
				break;
			}
			self.record_next(BlockOutcome::NoData);
		}
	}

	/// Re-aligns the window so its newest slot corresponds to `height - 1`,
	/// preserving the stored outcomes in order. Used once per session when the
	/// first live block arrives after a state-file restore: the restored
	/// outcomes have no reliable heights and the gap across the restart is
	/// unknowable rather than missed.
	pub fn anchor(&mut self, height: i64) {
		let snap = self.snapshot();
		self.head_height = height - 1;
		self.slots.fill(BlockOutcome::NoData);
		for (i, &code) in snap.iter().enumerate() {
			let h = self.head_height - TAPE_LEN as i64 + 1 + i as i64;
			if h <= 0 {
				continue;
			}
			self.slots[(h % TAPE_LEN as i64) as usize] = BlockOutcome::from_code(code);
		}
	}

	pub fn head_height(&self) -> i64 {
		self.head_height
	}

	pub fn len(&self) -> usize {
		self.slots.len()
	}

	pub fn is_empty(&self) -> bool {
		self.slots.is_empty()
	}

	/// Outcome stored for `height`, if the height is still inside the window.
	pub fn outcome_at(&self, height: i64) -> Option<BlockOutcome> {
		if height <= 0 || height > self.head_height {
			return None;
		}
		if self.head_height - height >= TAPE_LEN as i64 {
			return None;
		}
		Some(self.slots[(height % TAPE_LEN as i64) as usize])
	}

	/// The tape contents oldest-first, as integer codes. Always exactly
	/// `TAPE_LEN` entries.
	pub fn snapshot(&self) -> Vec<i8> {
		let mut out = Vec::with_capacity(TAPE_LEN);
		for i in 1..=TAPE_LEN as i64 {
			let h = self.head_height - TAPE_LEN as i64 + i;
			let idx = ((h % TAPE_LEN as i64) + TAPE_LEN as i64) % TAPE_LEN as i64;
			out.push(self.slots[idx as usize].code());
		}
		out
	}
}

/// Raw evidence collected for one block before its outcome is final.
#[derive(Debug, Clone, Default)]
pub struct VoteEvidence {
	/// Any vote event was observed for this height (ours or not).
	pub any: bool,
	/// Our validator's prevote was observed.
	pub our_prevote: bool,
	/// Our validator's precommit was observed on the vote channel.
	pub our_precommit: bool,
}

/// Decides the outcome for a finalized block.
///
/// * `proposed_by_us` / `has_txs` come from the block's own header and data.
/// * `precommitted` comes from the **next** block's `last_commit`.
/// * `votes` is whatever the vote channel produced for this height.
pub fn attribute(
	proposed_by_us: bool,
	has_txs: bool,
	precommitted: bool,
	votes: Option<&VoteEvidence>,
) -> BlockOutcome {
	if proposed_by_us {
		return if has_txs {
			BlockOutcome::Proposed
		} else {
			BlockOutcome::EmptyProposed
		};
	}
	if precommitted {
		return BlockOutcome::Signed;
	}
	match votes {
		Some(v) if v.our_prevote => BlockOutcome::MissedPrecommit,
		Some(v) if v.any => BlockOutcome::MissedPrevote,
		_ => BlockOutcome::Missed,
	}
}
