use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use cometwatch::bootstrap;
use cometwatch::models::Config;
use cometwatch::utils::logging;

/// Validator monitoring and alerting for Tendermint/CometBFT chains.
#[derive(Debug, Parser)]
#[command(name = "cometwatch", version, about)]
struct Args {
	/// Print a sample configuration file and exit.
	#[arg(long)]
	example_config: bool,

	/// Configuration file to load.
	#[arg(short = 'f', long = "config", default_value = "config.yml")]
	config: PathBuf,

	/// Durable state file (alarm cache and block tapes).
	#[arg(long, default_value = ".cometwatch-state.json")]
	state: PathBuf,

	/// Directory of additional per-chain YAML files; each file stem becomes
	/// the chain's label.
	#[arg(long = "cc", alias = "chain-dir")]
	chain_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	if args.example_config {
		print!("{}", include_str!("../example-config.yml"));
		return Ok(());
	}

	if let Err(e) = logging::init() {
		eprintln!("could not initialize logging: {e}");
	}

	let mut cfg = Config::load(&args.config, args.chain_dir.as_deref())
		.with_context(|| format!("loading configuration from {}", args.config.display()))?;

	let (fatal, problems) = cfg.validate();
	for problem in &problems {
		eprintln!("{problem}");
	}
	if fatal {
		anyhow::bail!("configuration problems prevent monitoring, exiting");
	}

	let runtime = bootstrap::start(cfg, args.state).await?;

	wait_for_signal().await;
	info!("shutdown signal received");
	runtime.shutdown().await;
	Ok(())
}

async fn wait_for_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{signal, SignalKind};
		let mut term = signal(SignalKind::terminate()).expect("signal handler");
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {}
			_ = term.recv() => {}
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
}
