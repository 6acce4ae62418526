#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use livechat_domain::{ChannelId, LinkId};
use livechat_platform::ChatSource;
use tokio::time::timeout;

use crate::server::channel_state::Liveness;
use crate::server::link::SubscriberLink;
use crate::server::registry::ChannelRegistry;
use crate::server::test_support::{RecordingLink, ScriptedSource, channel, eventually, fast_config, feed, page, video};

fn registry(source: &Arc<ScriptedSource>) -> ChannelRegistry {
	let src: Arc<dyn ChatSource> = Arc::clone(source) as Arc<dyn ChatSource>;
	ChannelRegistry::new(src, fast_config())
}

async fn wait_live(reg: &ChannelRegistry, ch: &ChannelId) -> bool {
	eventually(Duration::from_secs(1), || async move {
		reg.liveness(ch).await.is_some_and(|l| l.is_live())
	})
	.await
}

#[tokio::test]
async fn subscriber_registered_before_the_fetch_receives_the_message() {
	let source = ScriptedSource::new();
	let c1 = channel("C1");
	source.set_live(&c1, Some(video("V1")));
	source.set_feed(video("V1"), feed("F1"));

	let reg = registry(&source);
	let (link, mut rx) = RecordingLink::new();
	reg.subscribe(c1.clone(), link).await;
	assert!(wait_live(&reg, &c1).await);

	source.push_page(page(&["m1"], "tok1", Duration::from_secs(5)));
	let msg = timeout(Duration::from_secs(1), rx.recv())
		.await
		.expect("delivery within timeout")
		.expect("link open");
	assert_eq!(msg.message_id.as_str(), "m1");
	assert_eq!(msg.message, "text of m1");
	assert_eq!(msg.display_name, "Viewer");
	assert_eq!(reg.liveness(&c1).await, Some(Liveness::Live { feed: feed("F1") }));
}

#[tokio::test]
async fn offline_then_live_again_starts_with_an_empty_stream() {
	let source = ScriptedSource::new();
	let c1 = channel("C1");
	source.set_live(&c1, Some(video("V1")));
	source.set_feed(video("V1"), feed("F1"));
	source.set_feed(video("V2"), feed("F2"));
	source.fail_next_fetches(usize::MAX);

	let reg = registry(&source);
	let (link, mut rx) = RecordingLink::new();
	reg.subscribe(c1.clone(), link).await;
	assert!(wait_live(&reg, &c1).await);

	// Offline while the poller sits in its retry wait.
	source.set_live(&c1, None);
	let r = &reg;
	let ch = &c1;
	assert!(
		eventually(Duration::from_secs(1), || async move {
			r.liveness(ch).await == Some(Liveness::Offline)
		})
		.await
	);
	assert!(rx.try_recv().is_err());

	source.fail_next_fetches(0);
	source.push_page(page(&["new-1"], "tok1", Duration::from_millis(5)));
	source.set_live(&c1, Some(video("V2")));
	assert!(wait_live(&reg, &c1).await);

	let msg = timeout(Duration::from_secs(1), rx.recv())
		.await
		.expect("delivery within timeout")
		.expect("link open");
	assert_eq!(msg.message_id.as_str(), "new-1");
	assert_eq!(reg.liveness(&c1).await, Some(Liveness::Live { feed: feed("F2") }));
}

#[tokio::test]
async fn failed_subscriber_is_pruned_and_the_other_keeps_receiving() {
	let source = ScriptedSource::new();
	let c1 = channel("C1");
	source.set_live(&c1, Some(video("V1")));
	source.set_feed(video("V1"), feed("F1"));

	let reg = registry(&source);
	let (s1, _rx1) = RecordingLink::new();
	let (s2, mut rx2) = RecordingLink::new();
	s1.set_failing(true);
	reg.subscribe(c1.clone(), Arc::clone(&s1) as _).await;
	reg.subscribe(c1.clone(), Arc::clone(&s2) as _).await;
	assert_eq!(reg.subscriber_count(&c1).await, Some(2));
	assert!(wait_live(&reg, &c1).await);

	source.push_page(page(&["m1"], "tok1", Duration::from_millis(5)));
	let first = timeout(Duration::from_secs(1), rx2.recv()).await.expect("m1").expect("open");
	assert_eq!(first.message_id.as_str(), "m1");
	assert_eq!(reg.subscriber_count(&c1).await, Some(1));
	let pruned = &s1;
	assert!(eventually(Duration::from_millis(500), || async move { pruned.is_closed() }).await);

	source.push_page(page(&["m2"], "tok2", Duration::from_millis(5)));
	let second = timeout(Duration::from_secs(1), rx2.recv()).await.expect("m2").expect("open");
	assert_eq!(second.message_id.as_str(), "m2");
}

#[tokio::test]
async fn last_unsubscribe_removes_state_and_resubscribe_starts_offline() {
	let source = ScriptedSource::new();
	let c2 = channel("C2");
	source.set_live(&c2, Some(video("V1")));
	source.set_feed(video("V1"), feed("F1"));

	let reg = registry(&source);
	let (link, _rx) = RecordingLink::new();
	let id = link.id();
	reg.subscribe(c2.clone(), link).await;
	assert!(wait_live(&reg, &c2).await);

	reg.unsubscribe(&c2, id).await;
	assert!(!reg.contains(&c2));
	assert_eq!(reg.channel_count(), 0);
	assert_eq!(reg.liveness(&c2).await, None);

	// Monitoring stopped with the state.
	tokio::time::sleep(Duration::from_millis(40)).await;
	let checks = source.checks();
	tokio::time::sleep(Duration::from_millis(80)).await;
	assert_eq!(source.checks(), checks, "monitor kept running after teardown");

	source.set_live(&c2, None);
	let (again, _rx) = RecordingLink::new();
	reg.subscribe(c2.clone(), again).await;
	assert!(reg.contains(&c2));
	assert_eq!(reg.liveness(&c2).await, Some(Liveness::Offline));
	assert_eq!(reg.subscriber_count(&c2).await, Some(1));
}

#[tokio::test]
async fn repeated_liveness_failures_keep_the_channel_offline_without_a_poller() {
	let source = ScriptedSource::new();
	let c3 = channel("C3");
	source.set_live(&c3, Some(video("V1")));
	source.set_feed(video("V1"), feed("F1"));
	source.fail_next_checks(usize::MAX);

	let reg = registry(&source);
	let (link, mut rx) = RecordingLink::new();
	reg.subscribe(c3.clone(), Arc::clone(&link) as _).await;

	let src = &source;
	assert!(eventually(Duration::from_secs(1), || async move { src.checks() >= 3 }).await);
	assert_eq!(reg.liveness(&c3).await, Some(Liveness::Offline));
	assert_eq!(source.resolves(), 0);
	assert_eq!(source.fetches(), 0);
	assert!(rx.try_recv().is_err());
	assert!(!link.is_closed());
	assert_eq!(reg.subscriber_count(&c3).await, Some(1));
}

#[tokio::test]
async fn state_exists_only_while_someone_is_subscribed() {
	let source = ScriptedSource::new();
	let reg = registry(&source);
	let c = channel("C1");
	assert!(!reg.contains(&c));

	let (a, _ra) = RecordingLink::new();
	let (b, _rb) = RecordingLink::new();
	let (a_id, b_id) = (a.id(), b.id());

	reg.subscribe(c.clone(), a).await;
	reg.subscribe(c.clone(), b).await;
	assert_eq!(reg.subscriber_count(&c).await, Some(2));

	reg.unsubscribe(&c, a_id).await;
	assert!(reg.contains(&c));
	assert_eq!(reg.subscriber_count(&c).await, Some(1));

	reg.unsubscribe(&c, b_id).await;
	assert!(!reg.contains(&c));
	assert_eq!(reg.subscriber_count(&c).await, None);
}

#[tokio::test]
async fn unsubscribe_of_unknown_channel_or_link_is_a_no_op() {
	let source = ScriptedSource::new();
	let reg = registry(&source);
	let c = channel("C1");

	reg.unsubscribe(&channel("nobody"), LinkId::next()).await;
	assert_eq!(reg.channel_count(), 0);

	let (link, _rx) = RecordingLink::new();
	reg.subscribe(c.clone(), link).await;
	reg.unsubscribe(&c, LinkId::next()).await;
	assert!(reg.contains(&c));
	assert_eq!(reg.subscriber_count(&c).await, Some(1));
}

#[tokio::test]
async fn subscribing_the_same_link_twice_counts_once() {
	let source = ScriptedSource::new();
	let reg = registry(&source);
	let c = channel("C1");

	let (link, _rx) = RecordingLink::new();
	reg.subscribe(c.clone(), Arc::clone(&link) as _).await;
	reg.subscribe(c.clone(), link as _).await;
	assert_eq!(reg.subscriber_count(&c).await, Some(1));
}

#[tokio::test]
async fn channels_are_monitored_independently() {
	let source = ScriptedSource::new();
	let (live, idle) = (channel("LIVE"), channel("IDLE"));
	source.set_live(&live, Some(video("V1")));
	source.set_feed(video("V1"), feed("F1"));

	let reg = registry(&source);
	let (a, _ra) = RecordingLink::new();
	let (b, mut rb) = RecordingLink::new();
	reg.subscribe(live.clone(), a).await;
	reg.subscribe(idle.clone(), b).await;
	assert_eq!(reg.channel_count(), 2);

	assert!(wait_live(&reg, &live).await);
	source.push_page(page(&["m1"], "tok1", Duration::from_millis(5)));
	tokio::time::sleep(Duration::from_millis(60)).await;

	assert_eq!(reg.liveness(&idle).await, Some(Liveness::Offline));
	assert!(rb.try_recv().is_err(), "idle channel received another channel's message");
}

#[tokio::test]
async fn concurrent_subscribe_and_unsubscribe_never_leave_an_empty_state() {
	let source = ScriptedSource::new();
	let reg = registry(&source);
	let c = channel("C1");

	let mut tasks = Vec::new();
	for _ in 0..16 {
		let reg = reg.clone();
		let c = c.clone();
		tasks.push(tokio::spawn(async move {
			for _ in 0..10 {
				let (link, _rx) = RecordingLink::new();
				let id = link.id();
				reg.subscribe(c.clone(), link).await;
				tokio::task::yield_now().await;
				reg.unsubscribe(&c, id).await;
			}
		}));
	}
	for t in tasks {
		t.await.expect("task");
	}

	assert!(!reg.contains(&c));
	assert_eq!(reg.channel_count(), 0);
}
