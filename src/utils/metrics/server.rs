//! HTTP server exposing the Prometheus registry for scraping.

use std::sync::Arc;

use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use tracing::{error, info};

use crate::utils::metrics::Metrics;

async fn metrics_handler(metrics: web::Data<Arc<Metrics>>) -> impl Responder {
	match metrics.gather() {
		Ok(body) => HttpResponse::Ok()
			.content_type("text/plain; version=0.0.4; charset=utf-8")
			.body(body),
		Err(e) => {
			error!("error gathering metrics: {e}");
			HttpResponse::InternalServerError().finish()
		}
	}
}

/// Builds the exposition server on `port`. The returned server future runs
/// until aborted at shutdown.
pub fn create_metrics_server(
	port: u16,
	metrics: Arc<Metrics>,
) -> std::io::Result<actix_web::dev::Server> {
	let bind = ("0.0.0.0", port);
	info!("starting prometheus exporter on port {port}");
	Ok(HttpServer::new(move || {
		App::new()
			.app_data(web::Data::new(metrics.clone()))
			.route("/metrics", web::get().to(metrics_handler))
	})
	.workers(1)
	.bind(bind)?
	.shutdown_timeout(5)
	.run())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::utils::metrics::{MetricKind, PromUpdate};
	use actix_web::test;

	#[actix_web::test]
	async fn metrics_endpoint_serves_text_format() {
		let metrics = Arc::new(Metrics::new().unwrap());
		metrics.apply(&PromUpdate {
			kind: MetricKind::TotalNodes,
			value: 2.0,
			chain_id: "test-1".into(),
			moniker: "val".into(),
			endpoint: String::new(),
		});

		let app = test::init_service(
			App::new()
				.app_data(web::Data::new(metrics.clone()))
				.route("/metrics", web::get().to(metrics_handler)),
		)
		.await;

		let resp = test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request())
			.await;
		assert!(resp.status().is_success());
		let body = test::read_body(resp).await;
		let text = String::from_utf8(body.to_vec()).unwrap();
		assert!(text.contains("cometwatch_total_nodes"));
	}
}
