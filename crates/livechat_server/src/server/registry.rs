#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use livechat_domain::{ChannelId, LinkId};
use livechat_platform::ChatSource;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::server::broadcast_hub::BroadcastHub;
use crate::server::channel_state::{ChannelInner, ChannelState, Liveness};
use crate::server::link::SubscriberLink;
use crate::server::monitor::ChannelMonitor;

/// How often a channel's liveness is checked.
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(30);

/// Wait before retrying a failed page fetch.
pub const DEFAULT_FETCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Inter-page delay used when the platform gives no usable advice.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Capacity of a channel's message stream.
pub const DEFAULT_STREAM_CAPACITY: usize = 100;

/// Per-delivery bound applied by the hub.
pub const DEFAULT_DELIVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine timing and sizing.
#[derive(Debug, Clone)]
pub struct EngineConfig {
	pub liveness_interval: Duration,
	pub fetch_retry_delay: Duration,
	pub default_poll_interval: Duration,
	pub stream_capacity: usize,
	/// `None` lets a delivery take as long as the link needs.
	pub deliver_timeout: Option<Duration>,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			liveness_interval: DEFAULT_LIVENESS_INTERVAL,
			fetch_retry_delay: DEFAULT_FETCH_RETRY_DELAY,
			default_poll_interval: DEFAULT_POLL_INTERVAL,
			stream_capacity: DEFAULT_STREAM_CAPACITY,
			deliver_timeout: Some(DEFAULT_DELIVER_TIMEOUT),
		}
	}
}

/// Channel id -> live state. Only ever locked for map bookkeeping, never across `.await`.
pub(crate) type ChannelMap = Arc<Mutex<HashMap<ChannelId, Arc<ChannelState>>>>;

/// Directory of watched channels; creates state on first subscribe and
/// tears it down when the last subscriber leaves.
#[derive(Clone)]
pub struct ChannelRegistry {
	channels: ChannelMap,
	source: Arc<dyn ChatSource>,
	cfg: EngineConfig,
}

impl ChannelRegistry {
	pub fn new(source: Arc<dyn ChatSource>, cfg: EngineConfig) -> Self {
		Self {
			channels: Arc::new(Mutex::new(HashMap::new())),
			source,
			cfg,
		}
	}

	/// Register `link` for `channel`, starting monitoring if the channel is new.
	pub async fn subscribe(&self, channel: ChannelId, link: Arc<dyn SubscriberLink>) {
		loop {
			let state = self.get_or_create(&channel);

			let mut inner = state.lock().await;
			if inner.is_retired() {
				// Lost a race with the last unsubscribe; the entry is already gone from the map.
				continue;
			}

			if inner.subscribers.insert(link.id(), Arc::clone(&link)).is_none() {
				metrics::gauge!("livechat_subscribers_active").increment(1.0);
			}
			debug!(channel = %channel, link = %link.id(), subs = inner.subscribers.len(), "subscribed");
			return;
		}
	}

	/// Remove `link` from `channel`. Unknown channels and links are ignored.
	pub async fn unsubscribe(&self, channel: &ChannelId, link: LinkId) {
		let Some(state) = self.get(channel) else {
			return;
		};

		let mut inner = state.lock().await;
		if inner.subscribers.remove(&link).is_none() {
			return;
		}
		metrics::gauge!("livechat_subscribers_active").decrement(1.0);
		debug!(channel = %channel, link = %link, subs = inner.subscribers.len(), "unsubscribed");

		if inner.subscribers.is_empty() {
			retire_channel(&self.channels, &state, &mut inner);
		}
	}

	pub fn contains(&self, channel: &ChannelId) -> bool {
		self.channels.lock().contains_key(channel)
	}

	pub fn channel_count(&self) -> usize {
		self.channels.lock().len()
	}

	/// Subscriber count of a watched channel; `None` if it is not watched.
	pub async fn subscriber_count(&self, channel: &ChannelId) -> Option<usize> {
		let state = self.get(channel)?;
		Some(state.subscriber_count().await)
	}

	/// Liveness snapshot of a watched channel; `None` if it is not watched.
	pub async fn liveness(&self, channel: &ChannelId) -> Option<Liveness> {
		let state = self.get(channel)?;
		Some(state.liveness().await)
	}

	fn get(&self, channel: &ChannelId) -> Option<Arc<ChannelState>> {
		self.channels.lock().get(channel).cloned()
	}

	fn get_or_create(&self, channel: &ChannelId) -> Arc<ChannelState> {
		let mut channels = self.channels.lock();
		if let Some(state) = channels.get(channel) {
			return Arc::clone(state);
		}

		let (state, feed) = ChannelState::new(channel.clone(), self.cfg.stream_capacity);
		channels.insert(channel.clone(), Arc::clone(&state));
		metrics::gauge!("livechat_channels_active").set(channels.len() as f64);

		// Spawning only schedules; no I/O happens under the map lock.
		ChannelMonitor::new(Arc::clone(&state), Arc::clone(&self.source), self.cfg.clone()).spawn();
		BroadcastHub::new(
			Arc::clone(&state),
			feed,
			Arc::clone(&self.channels),
			self.cfg.deliver_timeout,
		)
		.spawn();

		info!(channel = %channel, "started monitoring channel");
		state
	}
}

/// Tear down `state`: cancel its monitor/poller, close its stream and drop it from the map.
///
/// Caller holds `state`'s lock (`inner`) and has just emptied its subscriber set.
pub(crate) fn retire_channel(channels: &ChannelMap, state: &Arc<ChannelState>, inner: &mut ChannelInner) {
	state.retire_locked(inner);

	let mut map = channels.lock();
	if map
		.get(state.channel())
		.is_some_and(|current| Arc::ptr_eq(current, state))
	{
		map.remove(state.channel());
	}
	metrics::gauge!("livechat_channels_active").set(map.len() as f64);
	drop(map);

	info!(channel = %state.channel(), "stopped monitoring channel");
}
