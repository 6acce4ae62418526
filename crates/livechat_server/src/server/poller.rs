#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use livechat_domain::{ChannelId, FeedId};
use livechat_platform::{ChatPage, ChatSource, NormalizedMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::server::channel_state::MessageTx;
use crate::server::registry::EngineConfig;
use crate::util::time::sleep_or_cancelled;

/// Pagination state of one polling session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationCursor {
	pub token: String,
	pub delay: Duration,
}

/// Why a poller stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerExit {
	Cancelled,
	/// Every receiver of the stream is gone.
	StreamClosed,
}

/// Pages through one live chat feed and pushes normalized messages onto the channel stream.
pub struct LiveChatPoller {
	channel: ChannelId,
	feed: FeedId,
	source: Arc<dyn ChatSource>,
	stream: MessageTx,
	cancel: CancellationToken,
	retry_delay: Duration,
	default_poll_interval: Duration,
}

impl LiveChatPoller {
	pub fn new(
		channel: ChannelId,
		feed: FeedId,
		source: Arc<dyn ChatSource>,
		stream: MessageTx,
		cancel: CancellationToken,
		cfg: &EngineConfig,
	) -> Self {
		Self {
			channel,
			feed,
			source,
			stream,
			cancel,
			retry_delay: cfg.fetch_retry_delay,
			default_poll_interval: cfg.default_poll_interval,
		}
	}

	pub async fn run(self) -> PollerExit {
		let session_id = Uuid::new_v4();
		info!(channel = %self.channel, feed = %self.feed, %session_id, "live chat poller started");

		let exit = self.poll_loop().await;

		info!(channel = %self.channel, feed = %self.feed, %session_id, ?exit, "live chat poller stopped");
		exit
	}

	async fn poll_loop(&self) -> PollerExit {
		let mut cursor: Option<ContinuationCursor> = None;

		loop {
			if self.cancel.is_cancelled() {
				return PollerExit::Cancelled;
			}

			let fetched = tokio::select! {
				biased;
				_ = self.cancel.cancelled() => return PollerExit::Cancelled,
				r = self.source.fetch_page(&self.feed, cursor.as_ref().map(|c| c.token.as_str())) => r,
			};

			let page = match fetched {
				Ok(page) => page,
				Err(e) => {
					metrics::counter!("livechat_page_fetch_errors_total").increment(1);
					// An upstream Retry-After only ever lengthens the wait.
					let wait = e.retry_after().map_or(self.retry_delay, |advised| advised.max(self.retry_delay));
					warn!(
						channel = %self.channel,
						feed = %self.feed,
						error = %e,
						retry_after = ?e.retry_after(),
						retry_ms = wait.as_millis(),
						"live chat page fetch failed; retrying"
					);
					if !sleep_or_cancelled(&self.cancel, wait).await {
						return PollerExit::Cancelled;
					}
					continue;
				}
			};

			let ChatPage {
				items,
				next_cursor,
				recommended_delay,
			} = page;

			let count = items.len();
			for item in items {
				let message = NormalizedMessage::from_item(item, Utc::now());
				if let Some(exit) = self.push(message).await {
					return exit;
				}
			}
			if count > 0 {
				metrics::counter!("livechat_messages_ingested_total").increment(count as u64);
				debug!(channel = %self.channel, count, "pushed chat messages");
			}

			let delay = self.next_delay(recommended_delay);
			cursor = Some(ContinuationCursor {
				token: next_cursor,
				delay,
			});

			if !sleep_or_cancelled(&self.cancel, delay).await {
				return PollerExit::Cancelled;
			}
		}
	}

	/// Push one message, blocking while the stream is full. Never pushes once cancelled.
	async fn push(&self, message: NormalizedMessage) -> Option<PollerExit> {
		if self.cancel.is_cancelled() {
			return Some(PollerExit::Cancelled);
		}

		tokio::select! {
			biased;
			_ = self.cancel.cancelled() => Some(PollerExit::Cancelled),
			r = self.stream.send(message) => match r {
				Ok(()) => None,
				Err(_) => Some(PollerExit::StreamClosed),
			},
		}
	}

	fn next_delay(&self, recommended: Duration) -> Duration {
		if recommended.is_zero() {
			self.default_poll_interval
		} else {
			recommended
		}
	}
}
