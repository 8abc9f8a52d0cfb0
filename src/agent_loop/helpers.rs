use crate::events::AgentEvent;
use crate::types::RetryConfig;
use std::time::Duration;
use tokio::sync::mpsc;

/// Calculate exponential backoff delay with jitter.
///
/// `base * 2^(attempt-1) + jitter`, capped at the configured maximum.
/// Jitter (bounded by the base delay and 1000ms) spreads out retries from
/// concurrent sessions.
pub(super) fn backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let base = config
        .base_delay_ms
        .saturating_mul(1u64 << attempt.saturating_sub(1).min(20));

    let max_jitter = config.base_delay_ms.min(1000);
    let jitter = if max_jitter > 0 {
        u64::from(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos(),
        ) % max_jitter
    } else {
        0
    };

    Duration::from_millis(base.saturating_add(jitter).min(config.max_delay_ms))
}

/// Deliver an event without ever blocking the loop indefinitely.
///
/// Non-blocking send first; if the consumer is slow, wait a bounded time
/// for space; if the consumer disconnected, drop the event and keep the
/// turn running — the conversation record is the source of truth, the
/// event stream is a live view.
pub(super) async fn send_event(tx: &mpsc::Sender<AgentEvent>, event: AgentEvent) {
    match tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            log::debug!("event channel full, waiting for consumer");
            match tokio::time::timeout(Duration::from_secs(30), tx.send(event)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => log::warn!("event channel closed while sending"),
                Err(_) => log::error!("timed out delivering event; consumer stalled"),
            }
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            log::debug!("event channel closed; consumer disconnected");
        }
    }
}
