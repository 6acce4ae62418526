#![forbid(unsafe_code)]

use async_trait::async_trait;
use livechat_domain::LinkId;
use livechat_platform::NormalizedMessage;
use thiserror::Error;

/// Why a single delivery failed. Any failure means the link is dead.
#[derive(Debug, Error)]
pub enum DeliveryError {
	#[error("link closed")]
	Closed,

	#[error("delivery timed out")]
	TimedOut,

	#[error("failed to encode message: {0}")]
	Encode(String),

	#[error("transport error: {0}")]
	Transport(String),
}

/// Outbound sink for one connected subscriber.
///
/// The transport owns the underlying connection; the hub only delivers and
/// closes. Identity is the [`LinkId`].
#[async_trait]
pub trait SubscriberLink: Send + Sync + 'static {
	fn id(&self) -> LinkId;

	async fn deliver(&self, message: &NormalizedMessage) -> Result<(), DeliveryError>;

	/// Close the link. Must be idempotent.
	async fn close(&self);
}
