#![forbid(unsafe_code)]

use std::time::Duration;

use livechat_domain::{ChannelId, FeedId, MessageId, VideoId};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::YouTubeAuth;
use crate::{ChatItem, ChatPage, SourceError};

const SEARCH_PATH: &str = "search";
const VIDEOS_PATH: &str = "videos";
const LIVE_CHAT_MESSAGES_PATH: &str = "liveChat/messages";

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	let v = headers.get(RETRY_AFTER)?;
	let secs = v.to_str().ok()?.trim().parse::<u64>().ok()?;
	Some(Duration::from_secs(secs))
}

/// Thin YouTube Data API v3 client covering the three calls the engine needs.
#[derive(Debug, Clone)]
pub struct YouTubeClient {
	http: reqwest::Client,
	base_url: Url,
	auth: YouTubeAuth,
}

impl YouTubeClient {
	pub fn new(base_url: &str, auth: YouTubeAuth, request_timeout: Duration) -> Result<Self, SourceError> {
		// Url::join drops the last path segment unless the base ends in '/'.
		let normalized = format!("{}/", base_url.trim().trim_end_matches('/'));
		let base_url = Url::parse(&normalized).map_err(|e| SourceError::Transport(format!("invalid base url: {e}")))?;

		let http = reqwest::Client::builder()
			.user_agent("livechat/0.x (youtube-data-v3)")
			.timeout(request_timeout)
			.build()
			.map_err(|e| SourceError::Transport(e.to_string()))?;

		Ok(Self { http, base_url, auth })
	}

	fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, SourceError> {
		let mut url = self
			.base_url
			.join(path)
			.map_err(|e| SourceError::Transport(format!("build url: {e}")))?;
		{
			let mut q = url.query_pairs_mut();
			for (k, v) in params {
				q.append_pair(k, v);
			}
			if let YouTubeAuth::ApiKey(key) = &self.auth {
				q.append_pair("key", key.expose());
			}
		}
		Ok(url)
	}

	async fn get_text(&self, url: Url, label: &'static str) -> Result<String, SourceError> {
		let mut req = self.http.get(url);
		match &self.auth {
			YouTubeAuth::BearerToken(token) => {
				req = req.bearer_auth(token.expose());
			}
			YouTubeAuth::ApiKey(_) => {}
			YouTubeAuth::None => return Err(SourceError::MissingCredentials),
		}

		let resp = req
			.send()
			.await
			.map_err(|e| SourceError::Transport(format!("youtube {label}: {e}")))?;
		let status = resp.status();

		if status == StatusCode::TOO_MANY_REQUESTS {
			return Err(SourceError::RateLimited {
				retry_after: retry_delay_from_headers(resp.headers()),
			});
		}

		let body = resp
			.text()
			.await
			.map_err(|e| SourceError::Transport(format!("youtube {label} body: {e}")))?;

		if !status.is_success() {
			return Err(SourceError::Status {
				status: status.as_u16(),
				body,
			});
		}

		Ok(body)
	}

	/// `search.list` restricted to the channel's current live broadcast.
	pub async fn search_live_video(&self, channel: &ChannelId) -> Result<Option<VideoId>, SourceError> {
		let url = self.endpoint(
			SEARCH_PATH,
			&[
				("part", "id"),
				("channelId", channel.as_str()),
				("eventType", "live"),
				("type", "video"),
				("maxResults", "1"),
			],
		)?;
		let body = self.get_text(url, "search").await?;
		let video = parse_search_response(&body)?;
		if let Some(video) = &video {
			debug!(channel = %channel, video = %video, "found live broadcast");
		}
		Ok(video)
	}

	/// `videos.list` → `liveStreamingDetails.activeLiveChatId`.
	pub async fn active_live_chat_id(&self, video: &VideoId) -> Result<FeedId, SourceError> {
		let url = self.endpoint(VIDEOS_PATH, &[("part", "liveStreamingDetails"), ("id", video.as_str())])?;
		let body = self.get_text(url, "videos").await?;
		parse_videos_response(&body, video)
	}

	/// `liveChatMessages.list` for one page.
	pub async fn list_messages(&self, feed: &FeedId, page_token: Option<&str>) -> Result<ChatPage, SourceError> {
		let mut params = vec![("liveChatId", feed.as_str()), ("part", "snippet,authorDetails")];
		if let Some(token) = page_token.filter(|t| !t.is_empty()) {
			params.push(("pageToken", token));
		}
		let url = self.endpoint(LIVE_CHAT_MESSAGES_PATH, &params)?;
		let body = self.get_text(url, "liveChatMessages").await?;
		parse_messages_response(&body)
	}
}

#[derive(Debug, Deserialize)]
struct SearchListResponse {
	#[serde(default)]
	items: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
	id: SearchResultId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResultId {
	#[serde(default)]
	video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
	#[serde(default)]
	items: Vec<VideoResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoResource {
	#[serde(default)]
	live_streaming_details: Option<LiveStreamingDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveStreamingDetails {
	#[serde(default)]
	active_live_chat_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveChatMessageListResponse {
	#[serde(default)]
	next_page_token: Option<String>,
	#[serde(default)]
	polling_interval_millis: Option<i64>,
	#[serde(default)]
	items: Vec<LiveChatMessageResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveChatMessageResource {
	#[serde(default)]
	id: String,
	#[serde(default)]
	snippet: Option<LiveChatMessageSnippet>,
	#[serde(default)]
	author_details: Option<LiveChatAuthorDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveChatMessageSnippet {
	#[serde(default)]
	display_message: String,
	#[serde(default)]
	published_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveChatAuthorDetails {
	#[serde(default)]
	display_name: String,
}

fn decode<'a, T: Deserialize<'a>>(body: &'a str, label: &str) -> Result<T, SourceError> {
	serde_json::from_str(body).map_err(|e| SourceError::Decode(format!("{label}: {e}")))
}

pub(crate) fn parse_search_response(body: &str) -> Result<Option<VideoId>, SourceError> {
	let resp: SearchListResponse = decode(body, "search response")?;
	Ok(resp
		.items
		.into_iter()
		.filter_map(|item| item.id.video_id)
		.find_map(|id| VideoId::new(id).ok()))
}

pub(crate) fn parse_videos_response(body: &str, video: &VideoId) -> Result<FeedId, SourceError> {
	let resp: VideoListResponse = decode(body, "videos response")?;
	resp.items
		.into_iter()
		.next()
		.and_then(|v| v.live_streaming_details)
		.and_then(|d| d.active_live_chat_id)
		.and_then(|id| FeedId::new(id).ok())
		.ok_or_else(|| SourceError::NoFeed(video.clone()))
}

pub(crate) fn parse_messages_response(body: &str) -> Result<ChatPage, SourceError> {
	let resp: LiveChatMessageListResponse = decode(body, "liveChatMessages response")?;

	let mut items = Vec::with_capacity(resp.items.len());
	for raw in resp.items {
		let id = match MessageId::new(raw.id) {
			Ok(id) => id,
			Err(_) => {
				let synthesized = MessageId::new(format!("local-{}", uuid::Uuid::new_v4()))
					.map_err(|e| SourceError::Decode(format!("synthesized message id: {e}")))?;
				warn!(message_id = %synthesized, "live chat item without an id; using a local id");
				synthesized
			}
		};
		let (text, published_at) = raw
			.snippet
			.map(|s| (s.display_message, s.published_at))
			.unwrap_or_default();
		items.push(ChatItem {
			id,
			author_name: raw.author_details.map(|a| a.display_name).unwrap_or_default(),
			text,
			published_at,
		});
	}

	let delay_ms = resp.polling_interval_millis.unwrap_or(0).max(0) as u64;

	Ok(ChatPage {
		items,
		next_cursor: resp.next_page_token.unwrap_or_default(),
		recommended_delay: Duration::from_millis(delay_ms),
	})
}
