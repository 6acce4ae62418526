#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use livechat_domain::LinkId;
use livechat_platform::NormalizedMessage;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::channel_state::{ChannelState, MessageRx, StreamFeed};
use crate::server::link::{DeliveryError, SubscriberLink};
use crate::server::registry::{ChannelMap, retire_channel};

enum HubEvent {
	Shutdown,
	Stream(Option<MessageRx>),
	Message(Option<NormalizedMessage>),
}

/// Fans each message of a channel's stream out to the channel's subscribers.
///
/// Lives as long as its [`ChannelState`], across any number of live sessions.
pub struct BroadcastHub {
	state: Arc<ChannelState>,
	feed: StreamFeed,
	channels: ChannelMap,
	deliver_timeout: Option<Duration>,
}

impl BroadcastHub {
	pub(crate) fn new(
		state: Arc<ChannelState>,
		feed: StreamFeed,
		channels: ChannelMap,
		deliver_timeout: Option<Duration>,
	) -> Self {
		Self {
			state,
			feed,
			channels,
			deliver_timeout,
		}
	}

	pub fn spawn(self) -> JoinHandle<()> {
		tokio::spawn(self.run())
	}

	pub async fn run(mut self) {
		let channel = self.state.channel().clone();
		let shutdown = self.state.shutdown_token();
		let mut current: Option<MessageRx> = None;

		debug!(channel = %channel, "broadcast hub started");

		loop {
			// A newly installed stream wins over whatever is left in the old one.
			let event = tokio::select! {
				biased;
				_ = shutdown.cancelled() => HubEvent::Shutdown,
				rx = self.feed.recv() => HubEvent::Stream(rx),
				msg = next_message(&mut current) => HubEvent::Message(msg),
			};

			match event {
				HubEvent::Shutdown | HubEvent::Stream(None) => break,
				HubEvent::Stream(Some(rx)) => {
					if current.is_some() {
						debug!(channel = %channel, "switching to replacement stream");
					}
					current = Some(rx);
				}
				HubEvent::Message(None) => {
					debug!(channel = %channel, "stream closed; waiting for replacement");
					current = None;
				}
				HubEvent::Message(Some(msg)) => self.broadcast(&msg).await,
			}
		}

		debug!(channel = %channel, "broadcast hub stopped");
	}

	/// One pass over every subscriber under the channel lock. Failed links are pruned under the lock
	/// and closed after it is released.
	async fn broadcast(&self, msg: &NormalizedMessage) {
		let mut inner = self.state.lock().await;
		if inner.is_retired() {
			return;
		}

		let mut failed: Vec<LinkId> = Vec::new();
		let mut delivered: u64 = 0;

		for (id, link) in inner.subscribers.iter() {
			match self.deliver(link.as_ref(), msg).await {
				Ok(()) => delivered += 1,
				Err(e) => {
					warn!(
						channel = %self.state.channel(),
						link = %id,
						message_id = %msg.message_id,
						error = %e,
						"delivery failed; dropping subscriber"
					);
					failed.push(*id);
				}
			}
		}

		metrics::counter!("livechat_messages_delivered_total").increment(delivered);

		if failed.is_empty() {
			return;
		}

		metrics::counter!("livechat_delivery_failures_total").increment(failed.len() as u64);
		let pruned: Vec<Arc<dyn SubscriberLink>> = failed
			.into_iter()
			.filter_map(|id| inner.subscribers.remove(&id))
			.collect();
		metrics::gauge!("livechat_subscribers_active").decrement(pruned.len() as f64);

		if inner.subscribers.is_empty() {
			info!(channel = %self.state.channel(), "last subscriber dropped");
			retire_channel(&self.channels, &self.state, &mut inner);
		}
		drop(inner);

		// A link that stopped reading may never finish its close handshake.
		for link in pruned {
			tokio::spawn(close_link(link, self.deliver_timeout));
		}
	}

	async fn deliver(&self, link: &dyn SubscriberLink, msg: &NormalizedMessage) -> Result<(), DeliveryError> {
		match self.deliver_timeout {
			Some(limit) => tokio::time::timeout(limit, link.deliver(msg))
				.await
				.unwrap_or(Err(DeliveryError::TimedOut)),
			None => link.deliver(msg).await,
		}
	}
}

async fn close_link(link: Arc<dyn SubscriberLink>, limit: Option<Duration>) {
	let id = link.id();
	match limit {
		Some(limit) => {
			if tokio::time::timeout(limit, link.close()).await.is_err() {
				debug!(link = %id, "close of pruned subscriber timed out");
			}
		}
		None => link.close().await,
	}
}

async fn next_message(current: &mut Option<MessageRx>) -> Option<NormalizedMessage> {
	match current {
		Some(rx) => rx.recv().await,
		None => std::future::pending().await,
	}
}
