#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use livechat_domain::{ChannelId, FeedId, LinkId};
use livechat_platform::NormalizedMessage;
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::server::link::SubscriberLink;

/// Producer side of a channel's message stream (held by the poller).
pub type MessageTx = mpsc::Sender<NormalizedMessage>;

/// Consumer side of a channel's message stream (held by the hub).
pub type MessageRx = mpsc::Receiver<NormalizedMessage>;

/// Delivers each freshly installed stream receiver to the hub.
pub type StreamFeed = mpsc::UnboundedReceiver<MessageRx>;

/// Live/offline state of a channel. The feed id only exists while live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
	Offline,
	Live { feed: FeedId },
}

impl Liveness {
	pub fn is_live(&self) -> bool {
		matches!(self, Self::Live { .. })
	}

	pub fn feed(&self) -> Option<&FeedId> {
		match self {
			Self::Live { feed } => Some(feed),
			Self::Offline => None,
		}
	}
}

/// Everything a watched channel shares between its monitor, poller and hub.
#[derive(Debug)]
pub struct ChannelState {
	channel: ChannelId,
	stream_capacity: usize,

	/// Root cancellation for this state's whole lifetime; sessions use child tokens.
	shutdown: CancellationToken,

	inner: Mutex<ChannelInner>,
}

pub struct ChannelInner {
	pub(crate) liveness: Liveness,
	pub(crate) subscribers: HashMap<LinkId, Arc<dyn SubscriberLink>>,

	/// `None` once the state has been retired.
	stream: Option<StreamSlot>,
}

#[derive(Debug)]
struct StreamSlot {
	tx: MessageTx,
	handoff: mpsc::UnboundedSender<MessageRx>,
}

impl std::fmt::Debug for ChannelInner {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChannelInner")
			.field("liveness", &self.liveness)
			.field("subscribers", &self.subscribers.keys().collect::<Vec<_>>())
			.field("retired", &self.stream.is_none())
			.finish()
	}
}

impl ChannelInner {
	pub fn is_retired(&self) -> bool {
		self.stream.is_none()
	}
}

impl ChannelState {
	/// Create a fresh offline state and the feed through which its hub receives streams.
	pub fn new(channel: ChannelId, stream_capacity: usize) -> (Arc<Self>, StreamFeed) {
		let capacity = stream_capacity.max(1);
		let (handoff, feed) = mpsc::unbounded_channel();
		let (tx, rx) = mpsc::channel(capacity);
		// The receiving half is alive, so the initial handoff cannot fail.
		let _ = handoff.send(rx);

		let state = Arc::new(Self {
			channel,
			stream_capacity: capacity,
			shutdown: CancellationToken::new(),
			inner: Mutex::new(ChannelInner {
				liveness: Liveness::Offline,
				subscribers: HashMap::new(),
				stream: Some(StreamSlot { tx, handoff }),
			}),
		});

		(state, feed)
	}

	pub fn channel(&self) -> &ChannelId {
		&self.channel
	}

	pub fn shutdown_token(&self) -> CancellationToken {
		self.shutdown.clone()
	}

	pub(crate) async fn lock(&self) -> MutexGuard<'_, ChannelInner> {
		self.inner.lock().await
	}

	pub async fn liveness(&self) -> Liveness {
		self.inner.lock().await.liveness.clone()
	}

	pub async fn subscriber_count(&self) -> usize {
		self.inner.lock().await.subscribers.len()
	}

	/// Record the live session and hand out a producer for the current stream.
	///
	/// Returns `None` if the state was retired meanwhile.
	pub async fn go_live(&self, feed: FeedId) -> Option<MessageTx> {
		let mut inner = self.inner.lock().await;
		let tx = inner.stream.as_ref()?.tx.clone();
		inner.liveness = Liveness::Live { feed };
		Some(tx)
	}

	/// Mark the channel offline and install a fresh, empty stream.
	pub async fn go_offline(&self) {
		let mut inner = self.inner.lock().await;
		inner.liveness = Liveness::Offline;

		let Some(slot) = inner.stream.as_mut() else {
			return;
		};

		let (tx, rx) = mpsc::channel(self.stream_capacity);
		if slot.handoff.send(rx).is_err() {
			debug!(channel = %self.channel, "hub gone; stream not replaced");
		}
		// Dropping the previous sender closes the old stream once the poller lets go of its clone.
		slot.tx = tx;
	}

	/// Cancel every task of this state and close its stream. Idempotent.
	pub(crate) fn retire_locked(&self, inner: &mut ChannelInner) {
		self.shutdown.cancel();
		inner.stream = None;
		inner.liveness = Liveness::Offline;
	}
}
