//! Client-resident proctored exam session controller.
//!
//! Runs a timed, integrity-monitored assessment: four concurrent signal
//! monitors feed a single violation ledger, a countdown timer drives the
//! clock, and the session state machine guarantees that the evidence payload
//! is submitted to the remote grading service exactly once, whichever trigger
//! (manual, timeout, violation threshold) fires first.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{AnswerValue, CourseId, MonitorKind, QuestionId, SessionId, SessionPhase, ViolationEvent},
    protocol::{AnswerMap, ExamDefinition, ExamResultResponse, SubmitExamRequest},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod ledger;
mod monitors;
mod timer;

pub use ledger::{EffectSignal, ViolationLedger, DEFAULT_WARNING_CAP};
pub use monitors::{
    AUDIO_NOISE_THRESHOLD, FACE_POLL_INTERVAL, REASON_FULLSCREEN_EXIT, REASON_MULTIPLE_FACES,
    REASON_NOISE, REASON_NO_FACE, REASON_TAB_SWITCH,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Per-session cancellation token shared by every monitor and the timer.
///
/// Tripping it is the synchronous half of teardown: every callback checks the
/// token before reporting, which closes the race where a callback already in
/// flight would otherwise land a violation after evidence freeze.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One block of frequency magnitudes (0-255 per bin) from the microphone
/// analyser. Upstream produces these from 2048-sample processing buffers.
#[derive(Debug, Clone)]
pub struct AudioFrame(pub Vec<u8>);

impl AudioFrame {
    pub fn mean_magnitude(&self) -> f32 {
        if self.0.is_empty() {
            return 0.0;
        }
        let total: u64 = self.0.iter().map(|&bin| u64::from(bin)).sum();
        total as f32 / self.0.len() as f32
    }
}

/// Boundary to the remote grading service. The controller never scores
/// itself.
#[async_trait]
pub trait GradingService: Send + Sync {
    async fn fetch_exam(&self, course_id: &CourseId) -> Result<ExamDefinition>;
    async fn submit_exam(
        &self,
        course_id: &CourseId,
        request: &SubmitExamRequest,
    ) -> Result<ExamResultResponse>;
    async fn fetch_last_result(&self, course_id: &CourseId) -> Result<ExamResultResponse>;
}

pub struct MissingGradingService;

#[async_trait]
impl GradingService for MissingGradingService {
    async fn fetch_exam(&self, course_id: &CourseId) -> Result<ExamDefinition> {
        Err(anyhow!("grading service unavailable for course {course_id}"))
    }

    async fn submit_exam(
        &self,
        course_id: &CourseId,
        _request: &SubmitExamRequest,
    ) -> Result<ExamResultResponse> {
        Err(anyhow!("grading service unavailable for course {course_id}"))
    }

    async fn fetch_last_result(&self, course_id: &CourseId) -> Result<ExamResultResponse> {
        Err(anyhow!("grading service unavailable for course {course_id}"))
    }
}

#[async_trait]
impl GradingService for grading_api::GradingClient {
    async fn fetch_exam(&self, course_id: &CourseId) -> Result<ExamDefinition> {
        self.fetch_exam(course_id).await
    }

    async fn submit_exam(
        &self,
        course_id: &CourseId,
        request: &SubmitExamRequest,
    ) -> Result<ExamResultResponse> {
        self.submit_exam(course_id, request).await
    }

    async fn fetch_last_result(&self, course_id: &CourseId) -> Result<ExamResultResponse> {
        self.fetch_last_result(course_id).await
    }
}

/// Boundary to the browser/device surface: permissions, the face-detection
/// model, fullscreen, and the raw proctoring signals. Injected so the state
/// machine can run against scripted sources in tests instead of ambient
/// globals.
#[async_trait]
pub trait ProctorEnvironment: Send + Sync {
    async fn request_camera_access(&self) -> Result<()>;
    async fn request_microphone_access(&self) -> Result<()>;
    async fn load_face_model(&self) -> Result<()>;
    async fn enter_fullscreen(&self) -> Result<()>;
    async fn exit_fullscreen(&self) -> Result<()>;
    /// Releases the camera and microphone streams.
    async fn release_media(&self) -> Result<()>;
    /// `true` = document hidden/backgrounded.
    fn subscribe_visibility(&self) -> broadcast::Receiver<bool>;
    /// `true` = fullscreen currently active.
    fn subscribe_fullscreen(&self) -> broadcast::Receiver<bool>;
    fn subscribe_audio_frames(&self) -> broadcast::Receiver<AudioFrame>;
    /// Number of faces visible in the most recent camera frame.
    async fn detect_faces(&self) -> Result<usize>;
}

pub struct MissingProctorEnvironment;

#[async_trait]
impl ProctorEnvironment for MissingProctorEnvironment {
    async fn request_camera_access(&self) -> Result<()> {
        Err(anyhow!("proctor environment unavailable: no camera backend"))
    }

    async fn request_microphone_access(&self) -> Result<()> {
        Err(anyhow!(
            "proctor environment unavailable: no microphone backend"
        ))
    }

    async fn load_face_model(&self) -> Result<()> {
        Err(anyhow!(
            "proctor environment unavailable: no face detection backend"
        ))
    }

    async fn enter_fullscreen(&self) -> Result<()> {
        Err(anyhow!(
            "proctor environment unavailable: no fullscreen backend"
        ))
    }

    async fn exit_fullscreen(&self) -> Result<()> {
        Err(anyhow!(
            "proctor environment unavailable: no fullscreen backend"
        ))
    }

    async fn release_media(&self) -> Result<()> {
        Ok(())
    }

    fn subscribe_visibility(&self) -> broadcast::Receiver<bool> {
        broadcast::channel(1).1
    }

    fn subscribe_fullscreen(&self) -> broadcast::Receiver<bool> {
        broadcast::channel(1).1
    }

    fn subscribe_audio_frames(&self) -> broadcast::Receiver<AudioFrame> {
        broadcast::channel(1).1
    }

    async fn detect_faces(&self) -> Result<usize> {
        Err(anyhow!("proctor environment unavailable: no camera frames"))
    }
}

/// Failures that keep a session out of its active phase. All recoverable:
/// the caller may fix the environment and retry indefinitely.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to load exam definition: {0}")]
    ExamFetch(String),
    #[error("face detection model failed to load: {0}")]
    ModelLoad(String),
    #[error("camera access denied: {0}")]
    CameraDenied(String),
    #[error("microphone access denied: {0}")]
    MicrophoneDenied(String),
    #[error("fullscreen request rejected: {0}")]
    FullscreenRejected(String),
    #[error("operation requires phase {expected:?}, session is {actual:?}")]
    WrongPhase {
        expected: SessionPhase,
        actual: SessionPhase,
    },
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("submission already in flight")]
    AlreadyInFlight,
    #[error("nothing to submit from phase {actual:?}")]
    WrongPhase { actual: SessionPhase },
    #[error("grading service rejected submission: {0}")]
    Service(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitTrigger {
    Manual,
    TimerExpired,
    ThresholdExceeded,
}

impl SubmitTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitTrigger::Manual => "manual",
            SubmitTrigger::TimerExpired => "timer_expired",
            SubmitTrigger::ThresholdExceeded => "threshold_exceeded",
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    PhaseChanged(SessionPhase),
    Tick {
        remaining_seconds: u64,
    },
    ViolationRecorded {
        count: u32,
        reason: String,
        source: MonitorKind,
    },
    ThresholdExceeded {
        count: u32,
    },
    SubmissionAccepted(ExamResultResponse),
    SubmissionFailed(String),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub course_id: CourseId,
    pub warning_cap: u32,
    pub auto_submit_threshold: u32,
}

impl SessionConfig {
    /// One number governs both the warning count shown to the student and
    /// the count that forces submission.
    pub fn new(course_id: CourseId) -> Self {
        Self {
            course_id,
            warning_cap: DEFAULT_WARNING_CAP,
            auto_submit_threshold: DEFAULT_WARNING_CAP,
        }
    }
}

/// Point-in-time view of the session state for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub time_remaining_seconds: u64,
    pub fullscreen_active: bool,
    pub submission_in_flight: bool,
    pub submitted: bool,
}

struct SessionInner {
    phase: SessionPhase,
    definition: Option<ExamDefinition>,
    model_loaded: bool,
    answers: AnswerMap,
    started_at: Option<DateTime<Utc>>,
    result: Option<ExamResultResponse>,
    submitted: bool,
}

/// The session state machine. One instance per proctored attempt.
pub struct ExamSession {
    session_id: SessionId,
    config: SessionConfig,
    grading: Arc<dyn GradingService>,
    env: Arc<dyn ProctorEnvironment>,
    ledger: Arc<ViolationLedger>,
    cancel: CancelToken,
    remaining_seconds: Arc<AtomicU64>,
    fullscreen_active: Arc<AtomicBool>,
    submission_in_flight: AtomicBool,
    triggers: mpsc::UnboundedSender<SubmitTrigger>,
    trigger_rx: Mutex<Option<mpsc::UnboundedReceiver<SubmitTrigger>>>,
    inner: Mutex<SessionInner>,
    proctor_tasks: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl ExamSession {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Self::new_with_dependencies(
            config,
            Arc::new(MissingGradingService),
            Arc::new(MissingProctorEnvironment),
        )
    }

    pub fn new_with_dependencies(
        config: SessionConfig,
        grading: Arc<dyn GradingService>,
        env: Arc<dyn ProctorEnvironment>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let ledger = Arc::new(ViolationLedger::with_auto_submit_threshold(
            config.warning_cap,
            config.auto_submit_threshold,
        ));
        Arc::new(Self {
            session_id: SessionId::random(),
            config,
            grading,
            env,
            ledger,
            cancel: CancelToken::default(),
            remaining_seconds: Arc::new(AtomicU64::new(0)),
            fullscreen_active: Arc::new(AtomicBool::new(false)),
            submission_in_flight: AtomicBool::new(false),
            triggers: trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            inner: Mutex::new(SessionInner {
                phase: SessionPhase::Loading,
                definition: None,
                model_loaded: false,
                answers: AnswerMap::new(),
                started_at: None,
                result: None,
                submitted: false,
            }),
            proctor_tasks: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.lock().await.phase
    }

    pub fn remaining_seconds(&self) -> u64 {
        self.remaining_seconds.load(Ordering::SeqCst)
    }

    pub fn violation_count(&self) -> u32 {
        self.ledger.count()
    }

    pub fn violation_events(&self) -> Vec<ViolationEvent> {
        self.ledger.events()
    }

    pub fn violation_log(&self) -> Vec<String> {
        self.ledger.log_lines()
    }

    pub async fn definition(&self) -> Option<ExamDefinition> {
        self.inner.lock().await.definition.clone()
    }

    pub async fn result(&self) -> Option<ExamResultResponse> {
        self.inner.lock().await.result.clone()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        SessionSnapshot {
            phase: inner.phase,
            time_remaining_seconds: self.remaining_seconds(),
            fullscreen_active: self.fullscreen_active.load(Ordering::SeqCst),
            submission_in_flight: self.submission_in_flight.load(Ordering::SeqCst),
            submitted: inner.submitted,
        }
    }

    /// Loads the exam definition and the face-detection model concurrently.
    /// Both must succeed before the session can await its start; any failure
    /// leaves the session in `Loading` for another attempt.
    pub async fn load(self: &Arc<Self>) -> Result<(), SetupError> {
        {
            let inner = self.inner.lock().await;
            if inner.phase != SessionPhase::Loading {
                return Err(SetupError::WrongPhase {
                    expected: SessionPhase::Loading,
                    actual: inner.phase,
                });
            }
        }

        let (definition, model) = tokio::join!(
            self.grading.fetch_exam(&self.config.course_id),
            self.env.load_face_model(),
        );
        let definition = definition.map_err(|err| SetupError::ExamFetch(err.to_string()))?;
        model.map_err(|err| SetupError::ModelLoad(err.to_string()))?;

        self.remaining_seconds
            .store(definition.time_limit_seconds(), Ordering::SeqCst);
        {
            let mut inner = self.inner.lock().await;
            inner.definition = Some(definition);
            inner.model_loaded = true;
        }
        self.set_phase(SessionPhase::AwaitingStart).await;
        Ok(())
    }

    /// Arms proctoring and opens the exam: camera, microphone, fullscreen,
    /// then the countdown timer and all four signal monitors.
    pub async fn begin(self: &Arc<Self>) -> Result<(), SetupError> {
        {
            let inner = self.inner.lock().await;
            if inner.phase != SessionPhase::AwaitingStart {
                return Err(SetupError::WrongPhase {
                    expected: SessionPhase::AwaitingStart,
                    actual: inner.phase,
                });
            }
            if !inner.model_loaded {
                return Err(SetupError::ModelLoad(
                    "face detection model is not ready".into(),
                ));
            }
        }

        self.env
            .request_camera_access()
            .await
            .map_err(|err| SetupError::CameraDenied(err.to_string()))?;
        self.env
            .request_microphone_access()
            .await
            .map_err(|err| SetupError::MicrophoneDenied(err.to_string()))?;
        self.env
            .enter_fullscreen()
            .await
            .map_err(|err| SetupError::FullscreenRejected(err.to_string()))?;
        self.fullscreen_active.store(true, Ordering::SeqCst);

        let taken_rx = self.trigger_rx.lock().await.take();
        let Some(trigger_rx) = taken_rx else {
            // Proctoring was already armed once on this session.
            let actual = self.inner.lock().await.phase;
            return Err(SetupError::WrongPhase {
                expected: SessionPhase::AwaitingStart,
                actual,
            });
        };
        self.spawn_trigger_dispatcher(trigger_rx);

        let ctx = monitors::MonitorContext {
            ledger: Arc::clone(&self.ledger),
            cancel: self.cancel.clone(),
            events: self.events.clone(),
            triggers: self.triggers.clone(),
        };
        {
            let mut tasks = self.proctor_tasks.lock().await;
            tasks.push(timer::spawn_countdown(
                Arc::clone(&self.remaining_seconds),
                self.cancel.clone(),
                self.events.clone(),
                self.triggers.clone(),
            ));
            tasks.push(monitors::spawn_visibility_monitor(
                Arc::clone(&self.env),
                ctx.clone(),
            ));
            tasks.push(monitors::spawn_fullscreen_monitor(
                Arc::clone(&self.env),
                Arc::clone(&self.fullscreen_active),
                ctx.clone(),
            ));
            tasks.push(monitors::spawn_audio_monitor(
                Arc::clone(&self.env),
                ctx.clone(),
            ));
            tasks.push(monitors::spawn_face_monitor(Arc::clone(&self.env), ctx));
        }

        {
            let mut inner = self.inner.lock().await;
            inner.started_at = Some(Utc::now());
        }
        info!(
            session_id = %self.session_id,
            course_id = %self.config.course_id,
            time_limit_seconds = self.remaining_seconds(),
            "session: proctoring armed, exam started"
        );
        self.set_phase(SessionPhase::Active).await;
        Ok(())
    }

    /// Records or replaces the student's answer for one question. Answers
    /// are only accepted while the exam is active.
    pub async fn record_answer(&self, question_id: QuestionId, value: AnswerValue) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.phase != SessionPhase::Active {
            return Err(anyhow!(
                "cannot record answers while session is {:?}",
                inner.phase
            ));
        }
        debug!(
            session_id = %self.session_id,
            question_id = %question_id,
            "session: answer recorded"
        );
        inner.answers.insert(question_id, value);
        Ok(())
    }

    pub async fn answered_count(&self) -> usize {
        self.inner.lock().await.answers.len()
    }

    /// Student-initiated submission. Also the manual retry path after a
    /// failed submission.
    pub async fn submit(self: &Arc<Self>) -> Result<ExamResultResponse, SubmitError> {
        self.trigger_submit(SubmitTrigger::Manual).await
    }

    /// Recovers the graded result of an earlier visit. Only short-circuits a
    /// session that has not started monitoring; an active session keeps its
    /// own evidence path.
    pub async fn recover_last_result(&self) -> Result<ExamResultResponse> {
        let result = self
            .grading
            .fetch_last_result(&self.config.course_id)
            .await?;
        let mut inner = self.inner.lock().await;
        if matches!(
            inner.phase,
            SessionPhase::Loading | SessionPhase::AwaitingStart
        ) {
            inner.phase = SessionPhase::Completed;
            inner.result = Some(result.clone());
            inner.submitted = true;
            drop(inner);
            info!(
                session_id = %self.session_id,
                course_id = %self.config.course_id,
                "session: recovered previously graded result"
            );
            let _ = self
                .events
                .send(SessionEvent::PhaseChanged(SessionPhase::Completed));
        }
        Ok(result)
    }

    async fn trigger_submit(
        self: &Arc<Self>,
        trigger: SubmitTrigger,
    ) -> Result<ExamResultResponse, SubmitError> {
        if self
            .submission_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SubmitError::AlreadyInFlight);
        }

        let phase = self.inner.lock().await.phase;
        let allowed = phase == SessionPhase::Active
            || (phase == SessionPhase::Failed && trigger == SubmitTrigger::Manual);
        if !allowed {
            self.submission_in_flight.store(false, Ordering::SeqCst);
            return Err(SubmitError::WrongPhase { actual: phase });
        }

        // Evidence freeze comes first: once submission begins, no monitor
        // callback may land another violation, even one already in flight.
        self.cancel.cancel();
        self.ledger.freeze();
        self.shutdown_proctoring().await;
        self.set_phase(SessionPhase::Submitting).await;

        let payload = self.build_submission().await;
        info!(
            session_id = %self.session_id,
            trigger = trigger.as_str(),
            answered = payload.items.len(),
            malpractice_count = payload.malpractice_count,
            time_taken_seconds = payload.time_taken_seconds,
            "session: submitting evidence"
        );

        match self
            .grading
            .submit_exam(&self.config.course_id, &payload)
            .await
        {
            Ok(result) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.result = Some(result.clone());
                    inner.submitted = true;
                }
                self.set_phase(SessionPhase::Completed).await;
                // Settled: the phase gate (not the flag) is what bars any
                // further submission from here on.
                self.submission_in_flight.store(false, Ordering::SeqCst);
                self.release_environment().await;
                let _ = self
                    .events
                    .send(SessionEvent::SubmissionAccepted(result.clone()));
                Ok(result)
            }
            Err(err) => {
                warn!(
                    session_id = %self.session_id,
                    trigger = trigger.as_str(),
                    "session: submission failed: {err}"
                );
                self.set_phase(SessionPhase::Failed).await;
                // Evidence stays intact; only the in-flight flag resets so
                // the student can retry by hand.
                self.submission_in_flight.store(false, Ordering::SeqCst);
                let message = err.to_string();
                let _ = self
                    .events
                    .send(SessionEvent::SubmissionFailed(message.clone()));
                Err(SubmitError::Service(message))
            }
        }
    }

    async fn build_submission(&self) -> SubmitExamRequest {
        let inner = self.inner.lock().await;
        let time_limit_seconds = inner
            .definition
            .as_ref()
            .map(ExamDefinition::time_limit_seconds)
            .unwrap_or(0);
        SubmitExamRequest {
            items: inner.answers.clone(),
            proctor_logs: self.ledger.log_lines(),
            malpractice_count: self.ledger.count(),
            time_taken_seconds: time_limit_seconds.saturating_sub(self.remaining_seconds()),
        }
    }

    async fn shutdown_proctoring(&self) {
        let mut tasks = self.proctor_tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    async fn release_environment(&self) {
        if let Err(err) = self.env.exit_fullscreen().await {
            warn!(session_id = %self.session_id, "session: fullscreen exit failed: {err}");
        }
        self.fullscreen_active.store(false, Ordering::SeqCst);
        if let Err(err) = self.env.release_media().await {
            warn!(session_id = %self.session_id, "session: media release failed: {err}");
        }
    }

    async fn set_phase(&self, phase: SessionPhase) {
        {
            let mut inner = self.inner.lock().await;
            if inner.phase == phase {
                return;
            }
            info!(
                session_id = %self.session_id,
                from = ?inner.phase,
                to = ?phase,
                "session: phase transition"
            );
            inner.phase = phase;
        }
        let _ = self.events.send(SessionEvent::PhaseChanged(phase));
    }

    /// All submit triggers funnel through one queue; the atomic in-flight
    /// guard inside `trigger_submit` makes whichever lands first the winner.
    fn spawn_trigger_dispatcher(
        self: &Arc<Self>,
        mut trigger_rx: mpsc::UnboundedReceiver<SubmitTrigger>,
    ) {
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(trigger) = trigger_rx.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                match session.trigger_submit(trigger).await {
                    Ok(_) => break,
                    Err(SubmitError::AlreadyInFlight) => {
                        debug!(
                            trigger = trigger.as_str(),
                            "session: duplicate submit trigger dropped"
                        );
                    }
                    Err(SubmitError::WrongPhase { actual }) => {
                        debug!(
                            trigger = trigger.as_str(),
                            phase = ?actual,
                            "session: submit trigger ignored"
                        );
                        break;
                    }
                    Err(SubmitError::Service(_)) => {
                        // The session sits in Failed until the student
                        // retries manually; auto triggers never resubmit.
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
