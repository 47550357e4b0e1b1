//! File-backed persistence.

pub mod state;

pub use state::SavedState;
