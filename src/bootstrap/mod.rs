//! Process wiring.
//!
//! Builds the shared context, spawns every per-chain task set plus the
//! global workers, and coordinates the drain at shutdown. Per-chain loops
//! are supervised: a panic is caught at the task boundary, logged, and the
//! loop is restarted after a short delay. Channel-owning tasks (the tape
//! consumer and the notifier worker) instead log the panic and close their
//! pipeline, which the paired tasks observe as a closed channel.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::models::Config;
use crate::repositories::state;
use crate::services::alerts::AlertEngine;
use crate::services::blocks::run_consumer;
use crate::services::notification::{run_worker, NotificationService};
use crate::services::provider;
use crate::services::refresher::ValidatorRefresher;
use crate::services::rpc::registry::run_registry_refresh;
use crate::services::subscriber::EventSubscriber;
use crate::services::{dashboard, App, Chain};
use crate::utils::healthcheck::run_pinger;
use crate::utils::metrics::{run_collector, server::create_metrics_server, Metrics};
use crate::utils::{build_client, HttpClientConfig, PriceClient};

/// How long shutdown waits for tasks to drain before forcing exit.
const DRAIN_WINDOW: Duration = Duration::from_secs(10);
/// Delay before a panicked supervised task is restarted.
const RESTART_DELAY: Duration = Duration::from_secs(3);

const ALERT_CHANNEL_CAPACITY: usize = 64;
const FRAME_CHANNEL_CAPACITY: usize = 256;
const STATS_CHANNEL_CAPACITY: usize = 512;

/// A running monitor: the handles needed to stop it cleanly.
pub struct Runtime {
	pub app: Arc<App>,
	pub chains: Vec<Arc<Chain>>,
	shutdown_tx: watch::Sender<bool>,
	tasks: Vec<JoinHandle<()>>,
	servers: Vec<actix_web::dev::ServerHandle>,
}

/// Spawns `make`'s future and restarts it if it panics, until shutdown.
fn supervise<F, Fut>(
	name: String,
	shutdown: watch::Receiver<bool>,
	make: F,
) -> JoinHandle<()>
where
	F: Fn(watch::Receiver<bool>) -> Fut + Send + 'static,
	Fut: Future<Output = ()> + Send + 'static,
{
	tokio::spawn(async move {
		loop {
			let result = std::panic::AssertUnwindSafe(make(shutdown.clone()))
				.catch_unwind()
				.await;
			match result {
				Ok(()) => break,
				Err(_) => {
					error!("task {name} panicked; restarting in {RESTART_DELAY:?}");
					tokio::time::sleep(RESTART_DELAY).await;
					if *shutdown.borrow() {
						break;
					}
				}
			}
		}
	})
}

/// Spawns a one-shot task whose panic is logged rather than propagated.
fn spawn_logged<Fut>(name: String, fut: Fut) -> JoinHandle<()>
where
	Fut: Future<Output = ()> + Send + 'static,
{
	tokio::spawn(async move {
		if std::panic::AssertUnwindSafe(fut).catch_unwind().await.is_err() {
			error!("task {name} panicked; its pipeline is stopped");
		}
	})
}

/// Builds everything and starts monitoring. The caller holds the returned
/// runtime until a shutdown signal arrives.
pub async fn start(cfg: Config, state_path: PathBuf) -> anyhow::Result<Runtime> {
	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	let http = build_client(&HttpClientConfig {
		tls_skip_verify: cfg.tls_skip_verify,
		..Default::default()
	});

	let (alert_tx, alert_rx) = mpsc::channel(ALERT_CHANNEL_CAPACITY);

	// metrics pipeline
	let mut stats_tx = None;
	let mut tasks: Vec<JoinHandle<()>> = Vec::new();
	let mut servers = Vec::new();
	if cfg.prometheus {
		let metrics = Arc::new(Metrics::new()?);
		let (tx, rx) = mpsc::channel(STATS_CHANNEL_CAPACITY);
		stats_tx = Some(tx);
		tasks.push(tokio::spawn(run_collector(
			metrics.clone(),
			rx,
			shutdown_rx.clone(),
		)));
		let server = create_metrics_server(cfg.prometheus_listen_port, metrics)?;
		servers.push(server.handle());
		tasks.push(tokio::spawn(async move {
			if let Err(e) = server.await {
				error!("metrics server stopped: {e}");
			}
		}));
	}

	// price conversion
	let price = if cfg.price_conversion.enabled {
		let slugs: Vec<String> = {
			let mut slugs: Vec<String> = cfg
				.chains
				.values()
				.filter(|c| !c.slug.is_empty())
				.map(|c| c.slug.to_ascii_lowercase())
				.collect();
			slugs.sort();
			slugs.dedup();
			slugs
		};
		let currency = if cfg.price_conversion.currency.is_empty() {
			"USD".to_string()
		} else {
			cfg.price_conversion.currency.clone()
		};
		let cache_hours = if cfg.price_conversion.cache_expiration > 0 {
			cfg.price_conversion.cache_expiration
		} else {
			8
		};
		let client = Arc::new(PriceClient::new(
			http.clone(),
			cfg.coin_market_cap_api_token.clone(),
			currency,
			cache_hours,
			slugs,
		));
		match client.prices().await {
			Ok(_) => {
				info!("price conversion enabled");
				Some(client)
			}
			Err(e) => {
				warn!("price conversion disabled, initial fetch failed: {e}");
				None
			}
		}
	} else {
		None
	};

	let dashboard_hub = dashboard::DashboardHub::new(cfg.hide_logs);

	let app = Arc::new(App {
		cfg: cfg.clone(),
		alarms: Default::default(),
		alert_tx,
		stats_tx,
		dashboard: dashboard_hub.clone(),
		price,
		http: http.clone(),
	});

	// chain aggregates
	let chains: Vec<Arc<Chain>> = cfg
		.chains
		.iter()
		.map(|(name, chain_cfg)| Chain::new(name.clone(), chain_cfg.clone(), http.clone()))
		.collect();

	// restore pre-restart state before anything can fire
	state::restore(&app, &chains, &state_path).await;

	// dashboard
	if cfg.enable_dashboard {
		let server = dashboard::create_dashboard_server(&cfg.listen, dashboard_hub.clone())
			.map_err(|e| anyhow::anyhow!(e.to_string()))?;
		servers.push(server.handle());
		tasks.push(tokio::spawn(async move {
			if let Err(e) = server.await {
				error!("dashboard server stopped: {e}");
			}
		}));
	}

	// notification fan-out
	let notification_service = NotificationService::new(cfg.tls_skip_verify);
	tasks.push(spawn_logged(
		"notification-worker".into(),
		run_worker(
			app.clone(),
			notification_service,
			alert_rx,
			shutdown_rx.clone(),
		),
	));

	// healthcheck pings
	tasks.push(tokio::spawn(run_pinger(
		cfg.healthcheck.clone(),
		http.clone(),
		shutdown_rx.clone(),
	)));

	// periodic state saves plus the final one at shutdown
	tasks.push(tokio::spawn(state::run_saver(
		app.clone(),
		chains.clone(),
		state_path,
		shutdown_rx.clone(),
	)));

	// per-chain task sets
	for chain in &chains {
		let provider = provider::build(chain, http.clone())
			.map_err(|e| anyhow::anyhow!("chain {}: {e}", chain.name))?;

		// endpoint health
		{
			let fleet = chain.fleet.clone();
			fleet.probe_all().await;
			tasks.push(supervise(
				format!("{}-health", chain.name),
				shutdown_rx.clone(),
				move |sd| {
					let fleet = fleet.clone();
					async move { fleet.run_health_loop(sd).await }
				},
			));
		}

		// public registry fallback
		if chain.config.public_fallback {
			let fleet = chain.fleet.clone();
			let http = http.clone();
			tasks.push(supervise(
				format!("{}-registry", chain.name),
				shutdown_rx.clone(),
				move |sd| run_registry_refresh(fleet.clone(), http.clone(), sd),
			));
		}

		// event stream and tape
		let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
		{
			let subscriber = Arc::new(EventSubscriber::new(
				chain.clone(),
				frame_tx,
				cfg.tls_skip_verify,
			));
			tasks.push(supervise(
				format!("{}-subscriber", chain.name),
				shutdown_rx.clone(),
				move |sd| {
					let subscriber = subscriber.clone();
					async move { subscriber.run(sd).await }
				},
			));
		}
		tasks.push(spawn_logged(
			format!("{}-tape", chain.name),
			run_consumer(chain.clone(), app.clone(), frame_rx, shutdown_rx.clone()),
		));

		// validator refresh
		{
			let refresher = Arc::new(ValidatorRefresher::new(
				chain.clone(),
				app.clone(),
				provider,
			));
			tasks.push(supervise(
				format!("{}-refresher", chain.name),
				shutdown_rx.clone(),
				move |sd| {
					let refresher = refresher.clone();
					async move { refresher.run(sd).await }
				},
			));
		}

		// rule evaluation
		{
			let engine = Arc::new(AlertEngine::new(chain.clone(), app.clone()));
			tasks.push(supervise(
				format!("{}-alerts", chain.name),
				shutdown_rx.clone(),
				move |sd| {
					let engine = engine.clone();
					async move { engine.run(sd).await }
				},
			));
		}

		info!("monitoring {} ({})", chain.name, chain.config.chain_id);
	}

	Ok(Runtime {
		app,
		chains,
		shutdown_tx,
		tasks,
		servers,
	})
}

impl Runtime {
	/// Signals every task and waits out the drain window. The final state
	/// save runs inside the saver task before it exits.
	pub async fn shutdown(self) {
		info!("shutting down, draining tasks");
		let _ = self.shutdown_tx.send(true);
		for handle in &self.servers {
			handle.stop(true).await;
		}

		let drain = async {
			for task in self.tasks {
				let _ = task.await;
			}
		};
		if tokio::time::timeout(DRAIN_WINDOW, drain).await.is_err() {
			warn!("tasks did not drain within {DRAIN_WINDOW:?}, forcing exit");
		}
		info!("shutdown complete");
	}
}
