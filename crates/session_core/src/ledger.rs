//! Violation ledger: the one resource in a session mutated by multiple
//! independent producers.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use shared::domain::{MonitorKind, ViolationEvent};

pub const DEFAULT_WARNING_CAP: u32 = 5;

/// Outcome of a single [`ViolationLedger::report`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectSignal {
    /// Appended and counted; still below the auto-submit threshold.
    Noted,
    /// This report pushed the count onto the auto-submit threshold. Raised
    /// at most once per session.
    ThresholdCrossed,
    /// Appended for audit only (or dropped entirely once frozen); never
    /// escalates.
    Suppressed,
}

#[derive(Debug, Default)]
struct LedgerState {
    events: Vec<ViolationEvent>,
    threshold_crossed: bool,
    frozen: bool,
}

/// Single owner of the warning count and event log.
///
/// Up to four monitors report concurrently. The whole read-modify-write runs
/// under one lock, so concurrent increments cannot under-count and
/// `count == events.len()` holds at every observable point.
pub struct ViolationLedger {
    cap: u32,
    auto_submit_threshold: u32,
    state: Mutex<LedgerState>,
}

impl ViolationLedger {
    pub fn new(cap: u32) -> Self {
        Self::with_auto_submit_threshold(cap, cap)
    }

    /// The displayed cap and the auto-submit threshold are the same number by
    /// default; a distinct threshold exists for deployments that force-submit
    /// one warning later than the cap they display.
    pub fn with_auto_submit_threshold(cap: u32, auto_submit_threshold: u32) -> Self {
        Self {
            cap,
            auto_submit_threshold,
            state: Mutex::new(LedgerState::default()),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LedgerState> {
        // A poisoned guard still holds a coherent ledger; take it back.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn report(&self, reason: impl Into<String>, source: MonitorKind) -> EffectSignal {
        let mut state = self.lock_state();
        if state.frozen {
            return EffectSignal::Suppressed;
        }
        state.events.push(ViolationEvent {
            at: Utc::now(),
            reason: reason.into(),
            source,
        });
        let count = state.events.len() as u32;
        if state.threshold_crossed {
            EffectSignal::Suppressed
        } else if count >= self.auto_submit_threshold {
            state.threshold_crossed = true;
            EffectSignal::ThresholdCrossed
        } else {
            EffectSignal::Noted
        }
    }

    /// Evidence freeze: every later `report` appends nothing and returns
    /// [`EffectSignal::Suppressed`]. Permanent for the session.
    pub fn freeze(&self) {
        self.lock_state().frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.lock_state().frozen
    }

    pub fn count(&self) -> u32 {
        self.lock_state().events.len() as u32
    }

    pub fn threshold_crossed(&self) -> bool {
        self.lock_state().threshold_crossed
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }

    pub fn events(&self) -> Vec<ViolationEvent> {
        self.lock_state().events.clone()
    }

    /// Audit lines in the submission payload format:
    /// `Warning {n}/{cap}: {reason}`.
    pub fn log_lines(&self) -> Vec<String> {
        let state = self.lock_state();
        state
            .events
            .iter()
            .enumerate()
            .map(|(idx, event)| format!("Warning {}/{}: {}", idx + 1, self.cap, event.reason))
            .collect()
    }
}
