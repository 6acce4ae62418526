#![forbid(unsafe_code)]

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Sleep for `dur` unless `token` fires first.
///
/// Returns `false` when the wait was cut short by cancellation.
pub async fn sleep_or_cancelled(token: &CancellationToken, dur: Duration) -> bool {
	tokio::select! {
		biased;
		_ = token.cancelled() => false,
		_ = tokio::time::sleep(dur) => !token.is_cancelled(),
	}
}
