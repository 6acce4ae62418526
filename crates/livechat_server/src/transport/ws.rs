#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use livechat_domain::{ChannelId, LinkId};
use livechat_platform::NormalizedMessage;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{CONTENT_TYPE, HeaderValue};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::server::link::{DeliveryError, SubscriberLink};
use crate::server::registry::ChannelRegistry;

/// Query parameter naming the channel a client subscribes to.
pub const CHANNEL_QUERY_PARAM: &str = "channel_id";

/// Upper bound on flushing the Close frame to a peer.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Subscriber link over the write half of a WebSocket; each message goes out as one JSON text frame.
pub struct WsLink {
	id: LinkId,
	peer: SocketAddr,
	sink: Mutex<WsSink>,
	closed: AtomicBool,
	/// Set while a send is in flight; stays set if that send was abandoned.
	send_pending: AtomicBool,
	/// Fires on close so the connection task stops reading and drops the socket.
	closed_token: CancellationToken,
}

impl WsLink {
	fn new(peer: SocketAddr, sink: WsSink) -> Self {
		Self {
			id: LinkId::next(),
			peer,
			sink: Mutex::new(sink),
			closed: AtomicBool::new(false),
			send_pending: AtomicBool::new(false),
			closed_token: CancellationToken::new(),
		}
	}
}

#[async_trait]
impl SubscriberLink for WsLink {
	fn id(&self) -> LinkId {
		self.id
	}

	async fn deliver(&self, message: &NormalizedMessage) -> Result<(), DeliveryError> {
		if self.closed.load(Ordering::Acquire) {
			return Err(DeliveryError::Closed);
		}
		let json = serde_json::to_string(message).map_err(|e| DeliveryError::Encode(e.to_string()))?;
		let mut sink = self.sink.lock().await;
		self.send_pending.store(true, Ordering::Release);
		let sent = sink.send(Message::text(json)).await;
		self.send_pending.store(false, Ordering::Release);
		sent.map_err(|e| DeliveryError::Transport(e.to_string()))
	}

	async fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.closed_token.cancel();

		if self.send_pending.load(Ordering::Acquire) {
			// The peer stopped reading mid-frame; a Close frame would queue behind it forever.
			debug!(link = %self.id, peer = %self.peer, "abandoned send; dropping connection without close frame");
			return;
		}
		let flush = async { self.sink.lock().await.close().await };
		match tokio::time::timeout(CLOSE_GRACE, flush).await {
			Ok(Ok(())) => {}
			Ok(Err(e)) => debug!(link = %self.id, peer = %self.peer, error = %e, "websocket close failed"),
			Err(_) => debug!(link = %self.id, peer = %self.peer, "websocket close timed out"),
		}
	}
}

/// Accept subscriber connections until `shutdown` fires.
pub async fn serve(listener: TcpListener, registry: ChannelRegistry, shutdown: CancellationToken) -> anyhow::Result<()> {
	info!(addr = %listener.local_addr()?, "websocket endpoint listening");

	loop {
		let (stream, peer) = tokio::select! {
			_ = shutdown.cancelled() => break,
			r = listener.accept() => match r {
				Ok(accepted) => accepted,
				Err(e) => {
					warn!(error = %e, "accept failed");
					continue;
				}
			},
		};

		metrics::counter!("livechat_connections_total").increment(1);
		let registry = registry.clone();
		let shutdown = shutdown.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_connection(stream, peer, registry, shutdown).await {
				debug!(%peer, error = %e, "connection ended with error");
			}
		});
	}

	info!("websocket endpoint stopped");
	Ok(())
}

async fn handle_connection(
	stream: TcpStream,
	peer: SocketAddr,
	registry: ChannelRegistry,
	shutdown: CancellationToken,
) -> anyhow::Result<()> {
	let mut requested: Option<ChannelId> = None;
	let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
		match channel_from_query(req.uri().query()) {
			Some(channel) => {
				requested = Some(channel);
				Ok(resp)
			}
			None => Err(bad_request("Missing channel_id parameter")),
		}
	})
	.await?;

	let Some(channel) = requested else {
		return Ok(());
	};

	let (sink, mut frames) = ws.split();
	let link = Arc::new(WsLink::new(peer, sink));
	let link_id = link.id();
	let link_closed = link.closed_token.clone();

	info!(%peer, channel = %channel, link = %link_id, "subscriber connected");
	registry.subscribe(channel.clone(), Arc::clone(&link) as Arc<dyn SubscriberLink>).await;

	// Inbound frames carry nothing; read only to notice the close.
	loop {
		let frame = tokio::select! {
			_ = shutdown.cancelled() => break,
			_ = link_closed.cancelled() => {
				debug!(%peer, link = %link_id, "link closed by the hub");
				break;
			}
			f = frames.next() => f,
		};
		match frame {
			Some(Ok(Message::Close(_))) | None => break,
			Some(Ok(_)) => {}
			Some(Err(e)) => {
				debug!(%peer, link = %link_id, error = %e, "websocket read failed");
				break;
			}
		}
	}

	registry.unsubscribe(&channel, link_id).await;
	link.close().await;
	info!(%peer, channel = %channel, link = %link_id, "subscriber disconnected");
	Ok(())
}

fn channel_from_query(query: Option<&str>) -> Option<ChannelId> {
	let query = query?;
	url::form_urlencoded::parse(query.as_bytes())
		.find(|(k, _)| k == CHANNEL_QUERY_PARAM)
		.and_then(|(_, v)| ChannelId::new(v.into_owned()).ok())
}

fn bad_request(reason: &str) -> ErrorResponse {
	let body = serde_json::json!({ "error": reason }).to_string();
	let mut resp = ErrorResponse::new(Some(body));
	*resp.status_mut() = StatusCode::BAD_REQUEST;
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	resp
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn channel_id_is_read_from_the_query() {
		assert_eq!(
			channel_from_query(Some("channel_id=UC123&x=1")).map(|c| c.into_string()),
			Some("UC123".to_string())
		);
		assert_eq!(
			channel_from_query(Some("x=1&channel_id=UC%2F9")).map(|c| c.into_string()),
			Some("UC/9".to_string())
		);
	}

	#[test]
	fn missing_or_blank_channel_id_is_rejected() {
		assert!(channel_from_query(None).is_none());
		assert!(channel_from_query(Some("")).is_none());
		assert!(channel_from_query(Some("channel=UC1")).is_none());
		assert!(channel_from_query(Some("channel_id=")).is_none());
		assert!(channel_from_query(Some("channel_id=%20%20")).is_none());
	}

	#[test]
	fn bad_request_carries_status_and_reason() {
		let resp = bad_request("Missing channel_id parameter");
		assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
		assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
		let body: serde_json::Value = serde_json::from_str(resp.body().as_deref().unwrap_or_default()).unwrap();
		assert_eq!(body, serde_json::json!({ "error": "Missing channel_id parameter" }));
	}
}
