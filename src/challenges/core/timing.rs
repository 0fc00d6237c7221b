//! Pre-replay delay.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Marker returned when the wait was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Sleep for `delay` unless `cancel` fires first.
pub async fn interruptible_delay(delay: Duration, cancel: Option<&CancellationToken>) -> Result<(), Cancelled> {
    match cancel {
        Some(token) => {
            if token.is_cancelled() {
                return Err(Cancelled);
            }
            tokio::select! {
                _ = token.cancelled() => Err(Cancelled),
                _ = tokio::time::sleep(delay) => Ok(()),
            }
        }
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}
