//! Signal monitors: four independent producers of violation events.
//!
//! Each monitor runs as its own task, is started and stopped only by the
//! session state machine, and talks to the rest of the system exclusively
//! through the violation ledger. The shared cancellation token is checked at
//! the top of every callback, so an event already in flight when teardown
//! begins can never land a violation after evidence freeze.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use futures::StreamExt;
use shared::domain::MonitorKind;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::{
    ledger::{EffectSignal, ViolationLedger},
    CancelToken, ProctorEnvironment, SessionEvent, SubmitTrigger,
};

/// Mean frequency magnitude (0-255 scale) above which ambient audio counts
/// as a violation.
pub const AUDIO_NOISE_THRESHOLD: f32 = 40.0;
/// Cadence of the face-presence poll against the most recent camera frame.
pub const FACE_POLL_INTERVAL: Duration = Duration::from_secs(4);

pub const REASON_FULLSCREEN_EXIT: &str = "Exited fullscreen mode";
pub const REASON_TAB_SWITCH: &str = "Switched tabs or minimized window";
pub const REASON_NOISE: &str = "High background noise detected!";
pub const REASON_NO_FACE: &str = "No face detected! Please stay in frame.";
pub const REASON_MULTIPLE_FACES: &str = "Multiple faces detected!";

/// Everything a monitor task needs to report what it sees.
#[derive(Clone)]
pub(crate) struct MonitorContext {
    pub ledger: Arc<ViolationLedger>,
    pub cancel: CancelToken,
    pub events: broadcast::Sender<SessionEvent>,
    pub triggers: mpsc::UnboundedSender<SubmitTrigger>,
}

impl MonitorContext {
    fn record(&self, reason: &str, source: MonitorKind) {
        match self.ledger.report(reason, source) {
            EffectSignal::Noted => {
                let count = self.ledger.count();
                info!(
                    source = source.as_str(),
                    count,
                    cap = self.ledger.cap(),
                    "proctor: violation recorded: {reason}"
                );
                let _ = self.events.send(SessionEvent::ViolationRecorded {
                    count,
                    reason: reason.to_string(),
                    source,
                });
            }
            EffectSignal::ThresholdCrossed => {
                let count = self.ledger.count();
                warn!(
                    source = source.as_str(),
                    count, "proctor: violation threshold crossed, forcing submission"
                );
                let _ = self.events.send(SessionEvent::ViolationRecorded {
                    count,
                    reason: reason.to_string(),
                    source,
                });
                let _ = self.events.send(SessionEvent::ThresholdExceeded { count });
                let _ = self.triggers.send(SubmitTrigger::ThresholdExceeded);
            }
            EffectSignal::Suppressed => {
                debug!(
                    source = source.as_str(),
                    "proctor: violation suppressed: {reason}"
                );
            }
        }
    }
}

pub(crate) fn spawn_visibility_monitor(
    env: Arc<dyn ProctorEnvironment>,
    ctx: MonitorContext,
) -> JoinHandle<()> {
    let mut hidden_changes = env.subscribe_visibility();
    tokio::spawn(async move {
        loop {
            let hidden = match hidden_changes.recv().await {
                Ok(value) => value,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "proctor: visibility events lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if ctx.cancel.is_cancelled() {
                break;
            }
            if hidden {
                ctx.record(REASON_TAB_SWITCH, MonitorKind::Visibility);
            }
        }
    })
}

pub(crate) fn spawn_fullscreen_monitor(
    env: Arc<dyn ProctorEnvironment>,
    fullscreen_active: Arc<AtomicBool>,
    ctx: MonitorContext,
) -> JoinHandle<()> {
    let mut fullscreen_changes = env.subscribe_fullscreen();
    tokio::spawn(async move {
        loop {
            let is_fullscreen = match fullscreen_changes.recv().await {
                Ok(value) => value,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "proctor: fullscreen events lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if ctx.cancel.is_cancelled() {
                break;
            }
            fullscreen_active.store(is_fullscreen, Ordering::SeqCst);
            if !is_fullscreen {
                ctx.record(REASON_FULLSCREEN_EXIT, MonitorKind::Fullscreen);
            }
        }
    })
}

pub(crate) fn spawn_audio_monitor(
    env: Arc<dyn ProctorEnvironment>,
    ctx: MonitorContext,
) -> JoinHandle<()> {
    let mut frames = BroadcastStream::new(env.subscribe_audio_frames());
    tokio::spawn(async move {
        while let Some(frame) = frames.next().await {
            let Ok(frame) = frame else {
                // Lagged frames are stale evidence; skip them.
                continue;
            };
            if ctx.cancel.is_cancelled() {
                break;
            }
            if frame.mean_magnitude() > AUDIO_NOISE_THRESHOLD {
                ctx.record(REASON_NOISE, MonitorKind::AudioLevel);
            }
        }
    })
}

pub(crate) fn spawn_face_monitor(
    env: Arc<dyn ProctorEnvironment>,
    ctx: MonitorContext,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut poll = interval(FACE_POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;
        loop {
            poll.tick().await;
            if ctx.cancel.is_cancelled() {
                break;
            }
            match env.detect_faces().await {
                Ok(1) => {}
                Ok(0) => ctx.record(REASON_NO_FACE, MonitorKind::FacePresence),
                Ok(count) => {
                    debug!(count, "proctor: multiple faces in frame");
                    ctx.record(REASON_MULTIPLE_FACES, MonitorKind::FacePresence);
                }
                Err(err) => warn!("proctor: face capture failed: {err}"),
            }
        }
    })
}
