//! Logging setup.
//!
//! Builds a `tracing_subscriber` stack filtered by `RUST_LOG` (default
//! `info`) writing compact lines to stdout. Log lines intended for the
//! dashboard go through the dashboard publisher separately; this is the
//! operator-facing stream.

use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Installs the global tracing subscriber. Safe to call once per process;
/// calling it again returns an error from `try_init` which callers may
/// ignore in tests.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::registry()
		.with(filter)
		.with(
			fmt::layer()
				.with_target(false)
				.with_ansi(true)
				.compact(),
		)
		.try_init()?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn init_is_idempotent_enough() {
		// A second init must fail cleanly rather than panic.
		let first = init();
		let second = init();
		assert!(first.is_ok() || second.is_err());
	}
}
