#![forbid(unsafe_code)]

mod config;
mod server;
mod telemetry;
mod transport;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use livechat_platform::ChatSource;
use livechat_platform::youtube::YouTubeChatSource;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::server::health::{HealthState, spawn_health_server};
use crate::server::registry::ChannelRegistry;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: livechat_server [--bind host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     WebSocket bind address (default: 127.0.0.1:8080)\n\
\t--config   Config file (default: ~/.livechat/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

#[derive(Debug, Default)]
struct Args {
	bind: Option<SocketAddr>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args::default();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let addr = v.trim().parse::<SocketAddr>().unwrap_or_else(|e| {
					eprintln!("--bind {v:?}: {e} (expected host:port)");
					usage_and_exit();
				});
				args.bind = Some(addr);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn spawn_ctrl_c(shutdown: CancellationToken) {
	tokio::spawn(async move {
		match tokio::signal::ctrl_c().await {
			Ok(()) => info!("ctrl-c received; shutting down"),
			Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
		}
		shutdown.cancel();
	});
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	telemetry::init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(bind) = server_cfg.server.metrics_bind.as_deref() {
		telemetry::init_metrics(bind);
	}

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => spawn_health_server(addr, health_state.clone()),
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let source = YouTubeChatSource::new(server_cfg.youtube.to_client_config())
		.context("youtube credentials are required (set [youtube] api_key or access_token)")?;
	let source: Arc<dyn ChatSource> = Arc::new(source);

	let registry = ChannelRegistry::new(source, server_cfg.engine.clone());

	let bind = match args.bind {
		Some(addr) => addr,
		None => server_cfg
			.server
			.bind
			.parse::<SocketAddr>()
			.with_context(|| format!("invalid bind address {:?} (expected host:port)", server_cfg.server.bind))?,
	};
	let listener = TcpListener::bind(bind)
		.await
		.with_context(|| format!("bind websocket endpoint on {bind}"))?;

	let shutdown = CancellationToken::new();
	spawn_ctrl_c(shutdown.clone());

	health_state.mark_ready();

	crate::transport::ws::serve(listener, registry, shutdown).await
}
