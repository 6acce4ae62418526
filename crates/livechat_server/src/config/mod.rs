#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use livechat_platform::SecretString;
use livechat_platform::youtube::{DEFAULT_API_BASE_URL, YouTubeAuth, YouTubeConfig};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::registry::{
	DEFAULT_DELIVER_TIMEOUT, DEFAULT_FETCH_RETRY_DELAY, DEFAULT_LIVENESS_INTERVAL, DEFAULT_POLL_INTERVAL,
	DEFAULT_STREAM_CAPACITY, EngineConfig,
};

/// Subscriber endpoint used when neither the config nor `--bind` names one.
pub const DEFAULT_BIND: &str = "127.0.0.1:8080";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default config path: `~/.livechat/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".livechat").join("config.toml"))
}

/// Load the server config from TOML (if present) and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub youtube: YouTubeSettings,
	pub engine: EngineConfig,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// WebSocket subscriber endpoint (host:port).
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct YouTubeSettings {
	pub api_base_url: String,
	pub api_key: Option<SecretString>,
	/// OAuth access token; preferred over `api_key` when both are set.
	pub access_token: Option<SecretString>,
	pub request_timeout: Duration,
}

impl YouTubeSettings {
	pub fn auth(&self) -> YouTubeAuth {
		match (&self.access_token, &self.api_key) {
			(Some(token), _) => YouTubeAuth::BearerToken(token.clone()),
			(None, Some(key)) => YouTubeAuth::ApiKey(key.clone()),
			(None, None) => YouTubeAuth::None,
		}
	}

	pub fn to_client_config(&self) -> YouTubeConfig {
		YouTubeConfig {
			api_base_url: self.api_base_url.clone(),
			auth: self.auth(),
			request_timeout: self.request_timeout,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	youtube: FileYouTubeSettings,

	#[serde(default)]
	engine: FileEngineSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileYouTubeSettings {
	api_base_url: Option<String>,
	api_key: Option<String>,
	access_token: Option<String>,
	request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileEngineSettings {
	liveness_interval_secs: Option<u64>,
	fetch_retry_secs: Option<u64>,
	default_poll_interval_ms: Option<u64>,
	stream_capacity: Option<usize>,
	/// `0` disables the per-delivery timeout.
	deliver_timeout_ms: Option<u64>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Zero is not a usable interval; fall back to the default.
fn positive_secs(v: Option<u64>, field: &str, default: Duration) -> Duration {
	match v {
		Some(0) => {
			warn!(field, "engine config: zero interval ignored; using default");
			default
		}
		Some(secs) => Duration::from_secs(secs),
		None => default,
	}
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let youtube = YouTubeSettings {
			api_base_url: non_empty(file.youtube.api_base_url).unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
			api_key: non_empty(file.youtube.api_key).map(SecretString::new),
			access_token: non_empty(file.youtube.access_token).map(SecretString::new),
			request_timeout: positive_secs(
				file.youtube.request_timeout_secs,
				"request_timeout_secs",
				DEFAULT_REQUEST_TIMEOUT,
			),
		};

		let default_poll_interval = match file.engine.default_poll_interval_ms {
			Some(0) | None => DEFAULT_POLL_INTERVAL,
			Some(ms) => Duration::from_millis(ms),
		};

		let stream_capacity = match file.engine.stream_capacity {
			Some(0) => {
				warn!("engine config: stream_capacity must be > 0; using default");
				DEFAULT_STREAM_CAPACITY
			}
			Some(n) => n,
			None => DEFAULT_STREAM_CAPACITY,
		};

		let deliver_timeout = match file.engine.deliver_timeout_ms {
			Some(0) => None,
			Some(ms) => Some(Duration::from_millis(ms)),
			None => Some(DEFAULT_DELIVER_TIMEOUT),
		};

		Self {
			server: ServerSettings {
				bind: non_empty(file.server.bind).unwrap_or_else(|| DEFAULT_BIND.to_string()),
				metrics_bind: non_empty(file.server.metrics_bind),
				health_bind: non_empty(file.server.health_bind),
			},
			youtube,
			engine: EngineConfig {
				liveness_interval: positive_secs(
					file.engine.liveness_interval_secs,
					"liveness_interval_secs",
					DEFAULT_LIVENESS_INTERVAL,
				),
				fetch_retry_delay: positive_secs(
					file.engine.fetch_retry_secs,
					"fetch_retry_secs",
					DEFAULT_FETCH_RETRY_DELAY,
				),
				default_poll_interval,
				stream_capacity,
				deliver_timeout,
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => parse_toml(&s).map(Some),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

/// Apply `LIVECHAT_*` overrides read through `lookup`. Unparseable values are ignored.
fn apply_overrides_from(cfg: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
	let get = |key: &str| non_empty(lookup(key));

	if let Some(v) = get("LIVECHAT_BIND") {
		cfg.server.bind = v;
		info!("server config: bind overridden by env");
	}

	if let Some(v) = get("LIVECHAT_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = get("LIVECHAT_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = get("LIVECHAT_YOUTUBE_API_BASE_URL") {
		cfg.youtube.api_base_url = v;
		info!("youtube config: api_base_url overridden by env");
	}

	if let Some(v) = get("LIVECHAT_YOUTUBE_API_KEY") {
		cfg.youtube.api_key = Some(SecretString::new(v));
		info!("youtube config: api_key overridden by env");
	}

	if let Some(v) = get("LIVECHAT_YOUTUBE_ACCESS_TOKEN") {
		cfg.youtube.access_token = Some(SecretString::new(v));
		info!("youtube config: access_token overridden by env");
	}

	if let Some(v) = get("LIVECHAT_LIVENESS_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.engine.liveness_interval = Duration::from_secs(secs);
		info!(secs, "engine config: liveness_interval overridden by env");
	}

	if let Some(v) = get("LIVECHAT_FETCH_RETRY_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.engine.fetch_retry_delay = Duration::from_secs(secs);
		info!(secs, "engine config: fetch_retry_delay overridden by env");
	}

	if let Some(v) = get("LIVECHAT_STREAM_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.engine.stream_capacity = capacity;
		info!(capacity, "engine config: stream_capacity overridden by env");
	}

	if cfg.youtube.auth().is_configured() {
		info!("youtube config: credentials provided");
	} else {
		warn!("youtube config: no api_key or access_token configured");
	}
}
