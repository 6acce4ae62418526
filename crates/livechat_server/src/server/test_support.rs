#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use livechat_domain::{ChannelId, FeedId, LinkId, MessageId, VideoId};
use livechat_platform::{ChatItem, ChatPage, ChatSource, NormalizedMessage, SourceError};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::server::link::{DeliveryError, SubscriberLink};
use crate::server::registry::EngineConfig;

pub fn channel(id: &str) -> ChannelId {
	ChannelId::new(id).expect("valid ChannelId")
}

pub fn video(id: &str) -> VideoId {
	VideoId::new(id).expect("valid VideoId")
}

pub fn feed(id: &str) -> FeedId {
	FeedId::new(id).expect("valid FeedId")
}

pub fn item(id: &str, text: &str) -> ChatItem {
	ChatItem {
		id: MessageId::new(id).expect("valid MessageId"),
		author_name: "Viewer".to_string(),
		text: text.to_string(),
		published_at: "2024-06-01T12:00:00Z".to_string(),
	}
}

pub fn page(ids: &[&str], next_cursor: &str, delay: Duration) -> ChatPage {
	ChatPage {
		items: ids.iter().map(|id| item(id, &format!("text of {id}"))).collect(),
		next_cursor: next_cursor.to_string(),
		recommended_delay: delay,
	}
}

/// Engine timings small enough for tests.
pub fn fast_config() -> EngineConfig {
	EngineConfig {
		liveness_interval: Duration::from_millis(20),
		fetch_retry_delay: Duration::from_millis(20),
		default_poll_interval: Duration::from_millis(10),
		stream_capacity: 100,
		deliver_timeout: Some(Duration::from_secs(1)),
	}
}

/// Poll `cond` until it holds or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut cond: F) -> bool
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = bool>,
{
	let deadline = Instant::now() + within;
	loop {
		if cond().await {
			return true;
		}
		if Instant::now() >= deadline {
			return false;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
}

/// In-memory [`ChatSource`] driven by the test.
#[derive(Default)]
pub struct ScriptedSource {
	live: Mutex<HashMap<ChannelId, VideoId>>,
	failing_checks: AtomicUsize,
	feeds: Mutex<HashMap<VideoId, FeedId>>,
	failing_resolves: AtomicUsize,
	pages: Mutex<VecDeque<ChatPage>>,
	failing_fetches: AtomicUsize,
	retry_after: Mutex<Option<Duration>>,
	idle_delay: Mutex<Option<Duration>>,

	pub checks: AtomicUsize,
	pub resolves: AtomicUsize,
	pub fetches: AtomicUsize,
	pub cursors: Mutex<Vec<Option<String>>>,
}

impl ScriptedSource {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn set_live(&self, channel: &ChannelId, video: Option<VideoId>) {
		let mut live = self.live.lock();
		match video {
			Some(v) => {
				live.insert(channel.clone(), v);
			}
			None => {
				live.remove(channel);
			}
		}
	}

	pub fn set_feed(&self, video: VideoId, feed: FeedId) {
		self.feeds.lock().insert(video, feed);
	}

	pub fn push_page(&self, page: ChatPage) {
		self.pages.lock().push_back(page);
	}

	pub fn fail_next_checks(&self, n: usize) {
		self.failing_checks.store(n, Ordering::SeqCst);
	}

	pub fn fail_next_resolves(&self, n: usize) {
		self.failing_resolves.store(n, Ordering::SeqCst);
	}

	pub fn fail_next_fetches(&self, n: usize) {
		self.failing_fetches.store(n, Ordering::SeqCst);
	}

	/// `Retry-After` carried by scripted fetch failures.
	pub fn set_retry_after(&self, wait: Duration) {
		*self.retry_after.lock() = Some(wait);
	}

	/// Delay reported with the empty page returned when no page is queued.
	pub fn set_idle_delay(&self, delay: Duration) {
		*self.idle_delay.lock() = Some(delay);
	}

	pub fn checks(&self) -> usize {
		self.checks.load(Ordering::SeqCst)
	}

	pub fn resolves(&self) -> usize {
		self.resolves.load(Ordering::SeqCst)
	}

	pub fn fetches(&self) -> usize {
		self.fetches.load(Ordering::SeqCst)
	}

	fn take_failure(counter: &AtomicUsize) -> bool {
		counter
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok()
	}
}

#[async_trait]
impl ChatSource for ScriptedSource {
	async fn check_live(&self, channel: &ChannelId) -> Result<Option<VideoId>, SourceError> {
		self.checks.fetch_add(1, Ordering::SeqCst);
		if Self::take_failure(&self.failing_checks) {
			return Err(SourceError::Transport("scripted liveness failure".to_string()));
		}
		Ok(self.live.lock().get(channel).cloned())
	}

	async fn resolve_chat_feed(&self, video: &VideoId) -> Result<FeedId, SourceError> {
		self.resolves.fetch_add(1, Ordering::SeqCst);
		if Self::take_failure(&self.failing_resolves) {
			return Err(SourceError::Transport("scripted resolve failure".to_string()));
		}
		self.feeds
			.lock()
			.get(video)
			.cloned()
			.ok_or_else(|| SourceError::NoFeed(video.clone()))
	}

	async fn fetch_page(&self, _feed: &FeedId, cursor: Option<&str>) -> Result<ChatPage, SourceError> {
		self.fetches.fetch_add(1, Ordering::SeqCst);
		self.cursors.lock().push(cursor.map(str::to_string));
		if Self::take_failure(&self.failing_fetches) {
			return Err(SourceError::RateLimited {
				retry_after: *self.retry_after.lock(),
			});
		}
		if let Some(page) = self.pages.lock().pop_front() {
			return Ok(page);
		}
		Ok(ChatPage {
			items: Vec::new(),
			next_cursor: cursor.unwrap_or_default().to_string(),
			recommended_delay: self.idle_delay.lock().unwrap_or(Duration::from_millis(5)),
		})
	}
}

/// Link that records deliveries and can be told to fail, stall, or hang on close.
pub struct RecordingLink {
	id: LinkId,
	tx: mpsc::UnboundedSender<NormalizedMessage>,
	failing: AtomicBool,
	closed: AtomicBool,
	close_hangs: AtomicBool,
	delay: Mutex<Option<Duration>>,
}

impl RecordingLink {
	pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<NormalizedMessage>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let link = Arc::new(Self {
			id: LinkId::next(),
			tx,
			failing: AtomicBool::new(false),
			closed: AtomicBool::new(false),
			close_hangs: AtomicBool::new(false),
			delay: Mutex::new(None),
		});
		(link, rx)
	}

	pub fn set_failing(&self, failing: bool) {
		self.failing.store(failing, Ordering::SeqCst);
	}

	pub fn set_delay(&self, delay: Duration) {
		*self.delay.lock() = Some(delay);
	}

	/// Make `close` mark the link closed and then never return, like a peer that stopped reading.
	pub fn set_close_hangs(&self, hangs: bool) {
		self.close_hangs.store(hangs, Ordering::SeqCst);
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl SubscriberLink for RecordingLink {
	fn id(&self) -> LinkId {
		self.id
	}

	async fn deliver(&self, message: &NormalizedMessage) -> Result<(), DeliveryError> {
		let delay = *self.delay.lock();
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}
		if self.closed.load(Ordering::SeqCst) {
			return Err(DeliveryError::Closed);
		}
		if self.failing.load(Ordering::SeqCst) {
			return Err(DeliveryError::Transport("scripted delivery failure".to_string()));
		}
		self.tx.send(message.clone()).map_err(|_| DeliveryError::Closed)
	}

	async fn close(&self) {
		self.closed.store(true, Ordering::SeqCst);
		if self.close_hangs.load(Ordering::SeqCst) {
			std::future::pending::<()>().await;
		}
	}
}
