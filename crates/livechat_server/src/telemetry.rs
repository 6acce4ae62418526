#![forbid(unsafe_code)]

use std::net::SocketAddr;

use anyhow::Context as _;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_LOG_FILTER: &str = "info,livechat_server=debug";
const SERVICE_NAME: &str = "livechat_server";

/// Install the global subscriber: `RUST_LOG` filter, fmt output, and OTLP span export
/// when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
pub fn init_tracing() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
	let endpoint = otlp_endpoint(std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok());

	let tracer = endpoint.as_deref().map(otlp_tracer);
	let (tracer, otlp_error) = match tracer {
		Some(Ok(tracer)) => (Some(tracer), None),
		Some(Err(e)) => (None, Some(e)),
		None => (None, None),
	};

	tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.with(tracer.map(|t| tracing_opentelemetry::layer().with_tracer(t)))
		.init();

	match (endpoint, otlp_error) {
		(Some(_), Some(e)) => warn!(error = %e, "otlp tracing disabled"),
		(Some(endpoint), None) => info!(%endpoint, "otlp tracing enabled"),
		(None, _) => {}
	}
}

fn otlp_endpoint(raw: Option<String>) -> Option<String> {
	raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn otlp_tracer(endpoint: &str) -> anyhow::Result<SdkTracer> {
	let exporter = opentelemetry_otlp::SpanExporter::builder()
		.with_tonic()
		.with_endpoint(endpoint)
		.build()
		.with_context(|| format!("build otlp exporter for {endpoint}"))?;
	let provider = SdkTracerProvider::builder().with_batch_exporter(exporter).build();
	let tracer = provider.tracer(SERVICE_NAME);
	opentelemetry::global::set_tracer_provider(provider);
	Ok(tracer)
}

/// Serve Prometheus metrics on `bind`. Failures are logged; the engine runs without an exporter.
pub fn init_metrics(bind: &str) {
	let installed = bind
		.parse::<SocketAddr>()
		.with_context(|| format!("invalid metrics bind address {bind:?} (expected host:port)"))
		.and_then(|addr| {
			metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
				.context("install prometheus exporter")?;
			Ok(addr)
		});

	match installed {
		Ok(addr) => info!(%addr, "metrics exporter listening"),
		Err(e) => warn!(error = %format!("{e:#}"), "metrics exporter not started"),
	}
}
