//! Heartbeat ping and liveness monitoring.

use std::sync::Weak;
use std::time::Duration;

use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use super::ConnectionManager;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No inbound frame arrived within the timeout window.
    TimedOut,
    /// The heartbeat was cancelled or its manager dropped.
    Cancelled,
}

/// Run heartbeat pings for every connection of `manager`.
///
/// Each `interval` tick checks whether any inbound frame arrived since the
/// previous tick, then pings every connection. After `max_missed` silent
/// ticks in a row the peer is considered dead and
/// `HeartbeatResult::TimedOut` is returned.
///
/// `max_missed` is computed as `timeout / interval` (clamped to at least 1).
pub async fn run_heartbeat(
    manager: Weak<ConnectionManager>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut check_interval = time::interval_at(Instant::now() + interval, interval);
    let interval_ms = interval.as_millis().max(1);
    #[allow(clippy::cast_possible_truncation)]
    let max_missed = (timeout.as_millis() / interval_ms).max(1) as u32;
    let mut missed: u32 = 0;
    let mut last_seen = manager.upgrade().map_or(0, |m| m.message_seq());

    loop {
        tokio::select! {
            _ = check_interval.tick() => {
                let Some(manager) = manager.upgrade() else {
                    return HeartbeatResult::Cancelled;
                };
                let seq = manager.message_seq();
                if seq == last_seen {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                } else {
                    last_seen = seq;
                    missed = 0;
                }
                manager.ping_all();
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn heartbeat_cancelled() {
        let manager = Arc::new(ConnectionManager::new());
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        let weak = Arc::downgrade(&manager);

        let handle = tokio::spawn(async move {
            run_heartbeat(
                weak,
                Duration::from_secs(100),
                Duration::from_secs(300),
                cancel2,
            )
            .await
        });

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let manager = Arc::new(ConnectionManager::new());
        let result = run_heartbeat(
            Arc::downgrade(&manager),
            Duration::from_millis(100),
            Duration::from_millis(300),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result, HeartbeatResult::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_takes_max_missed_ticks() {
        let manager = Arc::new(ConnectionManager::new());
        let start = Instant::now();
        let _ = run_heartbeat(
            Arc::downgrade(&manager),
            Duration::from_millis(100),
            Duration::from_millis(300),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resets_missed_count() {
        let manager = Arc::new(ConnectionManager::new());
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        let weak = Arc::downgrade(&manager);

        let handle = tokio::spawn(async move {
            run_heartbeat(
                weak,
                Duration::from_millis(200),
                Duration::from_millis(600),
                cancel2,
            )
            .await
        });

        for _ in 0..10 {
            time::sleep(Duration::from_millis(100)).await;
            manager.update_last_message_time();
        }

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_manager_ends_loop() {
        let manager = Arc::new(ConnectionManager::new());
        let weak = Arc::downgrade(&manager);
        drop(manager);

        let result = run_heartbeat(
            weak,
            Duration::from_millis(100),
            Duration::from_millis(1_000),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result, HeartbeatResult::Cancelled);
    }

    #[test]
    fn heartbeat_result_equality() {
        assert_eq!(HeartbeatResult::TimedOut, HeartbeatResult::TimedOut);
        assert_ne!(HeartbeatResult::TimedOut, HeartbeatResult::Cancelled);
    }
}
