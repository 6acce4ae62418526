#![forbid(unsafe_code)]

mod client;

use std::time::Duration;

use async_trait::async_trait;
pub use client::YouTubeClient;
use livechat_domain::{ChannelId, FeedId, VideoId};

use crate::{ChatPage, ChatSource, SecretString, SourceError};

/// Default public endpoint of the YouTube Data API v3.
pub const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

/// Credentials for the Data API.
#[derive(Debug, Clone)]
pub enum YouTubeAuth {
	/// No credentials; every call fails with [`SourceError::MissingCredentials`].
	None,

	/// Simple API key, sent as the `key` query parameter.
	ApiKey(SecretString),

	/// OAuth access token, sent as a bearer token.
	BearerToken(SecretString),
}

impl YouTubeAuth {
	pub fn is_configured(&self) -> bool {
		!matches!(self, Self::None)
	}
}

#[derive(Debug, Clone)]
pub struct YouTubeConfig {
	pub api_base_url: String,
	pub auth: YouTubeAuth,
	pub request_timeout: Duration,
}

impl YouTubeConfig {
	pub fn new(auth: YouTubeAuth) -> Self {
		Self {
			api_base_url: DEFAULT_API_BASE_URL.to_string(),
			auth,
			request_timeout: Duration::from_secs(10),
		}
	}
}

/// [`ChatSource`] backed by the YouTube Data API.
#[derive(Debug, Clone)]
pub struct YouTubeChatSource {
	client: YouTubeClient,
}

impl YouTubeChatSource {
	pub fn new(cfg: YouTubeConfig) -> Result<Self, SourceError> {
		if !cfg.auth.is_configured() {
			return Err(SourceError::MissingCredentials);
		}
		let client = YouTubeClient::new(&cfg.api_base_url, cfg.auth, cfg.request_timeout)?;
		Ok(Self { client })
	}
}

#[async_trait]
impl ChatSource for YouTubeChatSource {
	async fn check_live(&self, channel: &ChannelId) -> Result<Option<VideoId>, SourceError> {
		self.client.search_live_video(channel).await
	}

	async fn resolve_chat_feed(&self, video: &VideoId) -> Result<FeedId, SourceError> {
		self.client.active_live_chat_id(video).await
	}

	async fn fetch_page(&self, feed: &FeedId, cursor: Option<&str>) -> Result<ChatPage, SourceError> {
		self.client.list_messages(feed, cursor).await
	}
}
