#![forbid(unsafe_code)]

use std::sync::Arc;

use livechat_domain::{FeedId, VideoId};
use livechat_platform::ChatSource;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::channel_state::ChannelState;
use crate::server::poller::{LiveChatPoller, PollerExit};
use crate::server::registry::EngineConfig;
use crate::util::time::sleep_or_cancelled;

/// The running poller of one live session.
struct LiveSession {
	feed: FeedId,
	cancel: CancellationToken,
	task: JoinHandle<PollerExit>,
}

/// Drives a channel's Offline/Live state machine and owns its live sessions.
pub struct ChannelMonitor {
	state: Arc<ChannelState>,
	source: Arc<dyn ChatSource>,
	cfg: EngineConfig,
	shutdown: CancellationToken,
	session: Option<LiveSession>,
}

impl ChannelMonitor {
	pub fn new(state: Arc<ChannelState>, source: Arc<dyn ChatSource>, cfg: EngineConfig) -> Self {
		let shutdown = state.shutdown_token();
		Self {
			state,
			source,
			cfg,
			shutdown,
			session: None,
		}
	}

	pub fn spawn(self) -> JoinHandle<()> {
		tokio::spawn(self.run())
	}

	/// Check liveness, then wait one interval; repeat until the state is retired.
	pub async fn run(mut self) {
		let channel = self.state.channel().clone();
		info!(channel = %channel, interval_ms = self.cfg.liveness_interval.as_millis(), "channel monitor started");

		while !self.shutdown.is_cancelled() {
			self.tick().await;

			if !sleep_or_cancelled(&self.shutdown, self.cfg.liveness_interval).await {
				break;
			}
		}

		self.end_session().await;
		info!(channel = %channel, "channel monitor stopped");
	}

	async fn tick(&mut self) {
		let channel = self.state.channel().clone();
		metrics::counter!("livechat_liveness_checks_total").increment(1);

		let checked = tokio::select! {
			biased;
			_ = self.shutdown.cancelled() => return,
			r = self.source.check_live(&channel) => r,
		};

		let live_video = match checked {
			Ok(v) => v,
			Err(e) => {
				metrics::counter!("livechat_liveness_check_errors_total").increment(1);
				warn!(channel = %channel, error = %e, "liveness check failed; keeping current state");
				return;
			}
		};

		match (live_video, self.session.is_some()) {
			(Some(video), false) => self.start_session(video).await,
			(None, true) => {
				self.end_session().await;
				self.state.go_offline().await;
				metrics::counter!("livechat_live_transitions_total", "to" => "offline").increment(1);
				info!(channel = %channel, "channel went offline");
			}
			_ => {}
		}
	}

	async fn start_session(&mut self, video: VideoId) {
		let channel = self.state.channel().clone();

		let resolved = tokio::select! {
			biased;
			_ = self.shutdown.cancelled() => return,
			r = self.source.resolve_chat_feed(&video) => r,
		};

		let feed = match resolved {
			Ok(feed) => feed,
			Err(e) => {
				warn!(channel = %channel, video = %video, error = %e, "could not resolve live chat feed; staying offline");
				return;
			}
		};

		let Some(stream) = self.state.go_live(feed.clone()).await else {
			debug!(channel = %channel, "state retired before going live");
			return;
		};

		let cancel = self.shutdown.child_token();
		let poller = LiveChatPoller::new(
			channel.clone(),
			feed.clone(),
			Arc::clone(&self.source),
			stream,
			cancel.clone(),
			&self.cfg,
		);
		let task = tokio::spawn(poller.run());

		metrics::counter!("livechat_live_transitions_total", "to" => "live").increment(1);
		info!(channel = %channel, video = %video, feed = %feed, "channel went live");

		self.session = Some(LiveSession { feed, cancel, task });
	}

	/// Stop the current poller, if any, and wait for it to exit.
	async fn end_session(&mut self) {
		let Some(session) = self.session.take() else {
			return;
		};

		session.cancel.cancel();
		match session.task.await {
			Ok(exit) => debug!(channel = %self.state.channel(), feed = %session.feed, ?exit, "live session ended"),
			Err(e) => warn!(channel = %self.state.channel(), feed = %session.feed, error = %e, "live chat poller task failed"),
		}
	}
}
