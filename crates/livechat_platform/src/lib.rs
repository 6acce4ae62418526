#![forbid(unsafe_code)]

pub mod youtube;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use livechat_domain::{ChannelId, FeedId, MessageId, VideoId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by a [`ChatSource`].
///
/// The engine treats every variant as transient: it logs, waits its normal
/// cadence and asks again.
#[derive(Debug, Error)]
pub enum SourceError {
	/// The video has no active live chat feed.
	#[error("no live chat feed for video {0}")]
	NoFeed(VideoId),

	#[error("upstream returned status {status}: {body}")]
	Status { status: u16, body: String },

	#[error("rate limited by upstream (retry after {retry_after:?})")]
	RateLimited { retry_after: Option<Duration> },

	#[error("transport error: {0}")]
	Transport(String),

	#[error("failed to decode upstream response: {0}")]
	Decode(String),

	#[error("no upstream credentials configured")]
	MissingCredentials,
}

impl SourceError {
	/// Wait the upstream asked for, if any.
	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			Self::RateLimited { retry_after } => *retry_after,
			_ => None,
		}
	}
}

/// One raw chat item as listed by the source, in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatItem {
	pub id: MessageId,
	pub author_name: String,
	pub text: String,
	/// Source-formatted publish timestamp (RFC 3339 on YouTube).
	pub published_at: String,
}

/// A page of chat items plus the pagination state for the next request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPage {
	pub items: Vec<ChatItem>,
	pub next_cursor: String,
	/// Platform-recommended wait before the next fetch. Zero means "no advice".
	pub recommended_delay: Duration,
}

/// Upstream capabilities the monitoring engine consumes.
#[async_trait]
pub trait ChatSource: Send + Sync + 'static {
	/// Returns the live video id if `channel` is currently broadcasting.
	async fn check_live(&self, channel: &ChannelId) -> Result<Option<VideoId>, SourceError>;

	/// Resolves the live chat feed of a live video.
	async fn resolve_chat_feed(&self, video: &VideoId) -> Result<FeedId, SourceError>;

	/// Fetches the next page of messages. `cursor` is `None` on the first call of a session.
	async fn fetch_page(&self, feed: &FeedId, cursor: Option<&str>) -> Result<ChatPage, SourceError>;
}

/// Platform-independent chat message, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedMessage {
	pub message_id: MessageId,
	pub display_name: String,
	pub message: String,
	pub timestamp: DateTime<Utc>,
}

impl NormalizedMessage {
	/// Normalize a source item. An unparseable publish time falls back to `received_at`.
	pub fn from_item(item: ChatItem, received_at: DateTime<Utc>) -> Self {
		let timestamp = match DateTime::parse_from_rfc3339(item.published_at.trim()) {
			Ok(ts) => ts.with_timezone(&Utc),
			Err(e) => {
				tracing::debug!(
					message_id = %item.id,
					published_at = %item.published_at,
					error = %e,
					"unparseable chat timestamp; using receipt time"
				);
				received_at
			}
		};

		Self {
			message_id: item.id,
			display_name: item.author_name,
			message: item.text,
			timestamp,
		}
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}
