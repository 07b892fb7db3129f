//! Countdown timer task: the sole writer of a session's remaining seconds.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::debug;

use crate::{CancelToken, SessionEvent, SubmitTrigger};

pub(crate) const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Ticks once per second, decrementing `remaining_seconds` until it hits zero
/// or the session cancellation token trips. Expiry raises the submit trigger
/// exactly once; a cancelled timer never fires it.
pub(crate) fn spawn_countdown(
    remaining_seconds: Arc<AtomicU64>,
    cancel: CancelToken,
    events: broadcast::Sender<SessionEvent>,
    triggers: mpsc::UnboundedSender<SubmitTrigger>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = interval(TICK_INTERVAL);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first interval tick completes immediately; consume it so the
        // first decrement lands a full second after start.
        ticks.tick().await;
        loop {
            ticks.tick().await;
            if cancel.is_cancelled() {
                break;
            }
            let previous = remaining_seconds.load(Ordering::SeqCst);
            let left = previous.saturating_sub(1);
            remaining_seconds.store(left, Ordering::SeqCst);
            let _ = events.send(SessionEvent::Tick {
                remaining_seconds: left,
            });
            if left == 0 {
                debug!("timer: countdown expired, raising submit trigger");
                let _ = triggers.send(SubmitTrigger::TimerExpired);
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expiry_raises_submit_trigger_once() {
        let remaining = Arc::new(AtomicU64::new(5));
        let (events, _keepalive) = broadcast::channel(16);
        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel();
        let handle = spawn_countdown(
            Arc::clone(&remaining),
            CancelToken::default(),
            events,
            trigger_tx,
        );

        let trigger = trigger_rx.recv().await;
        assert_eq!(trigger, Some(SubmitTrigger::TimerExpired));
        assert_eq!(remaining.load(Ordering::SeqCst), 0);

        handle.await.expect("timer task");
        assert!(trigger_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_ticks_without_firing_submit() {
        let remaining = Arc::new(AtomicU64::new(5));
        let cancel = CancelToken::default();
        let (events, _keepalive) = broadcast::channel(16);
        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel();
        let handle = spawn_countdown(
            Arc::clone(&remaining),
            cancel.clone(),
            events,
            trigger_tx,
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        cancel.cancel();
        tokio::time::advance(Duration::from_secs(10)).await;

        handle.await.expect("timer task");
        assert!(trigger_rx.try_recv().is_err());
        assert!(remaining.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_are_broadcast_to_observers() {
        let remaining = Arc::new(AtomicU64::new(2));
        let (events, mut rx) = broadcast::channel(16);
        let (trigger_tx, _trigger_rx) = mpsc::unbounded_channel();
        let _handle = spawn_countdown(
            Arc::clone(&remaining),
            CancelToken::default(),
            events,
            trigger_tx,
        );

        match rx.recv().await.expect("first tick") {
            SessionEvent::Tick { remaining_seconds } => assert_eq!(remaining_seconds, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.expect("second tick") {
            SessionEvent::Tick { remaining_seconds } => assert_eq!(remaining_seconds, 0),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
