//! Turn state machine and shared session state.
//!
//! [`TurnState`] drives the orchestrator's state machine.  Hosts read it via
//! [`SharedState`] (or follow `StatusChange` events) to render the session.
//!
//! [`SessionState`] is the single source of truth for everything a host
//! needs between events: current phase, the active turn, the last exchange
//! and the last error.
//!
//! [`SharedState`] is a type alias for `Arc<Mutex<SessionState>>`.  It is
//! cheap to clone and safe to share across tasks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// ---------------------------------------------------------------------------
// TurnState
// ---------------------------------------------------------------------------

/// States of one conversation turn.
///
/// ```text
/// Idle ──audio──▶ Capturing ──▶ Transcribing ──▶ Generating
///        ──first sentence──▶ Synthesizing ──first clip──▶ Playing ──▶ Idle
/// any state ──error / stop / timeout──▶ Idle
/// ```
///
/// Synthesis of later sentences continues while `Playing`; the state records
/// the furthest phase the turn has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TurnState {
    /// No turn in progress.
    #[default]
    Idle,

    /// Utterance audio has been handed to the session.
    Capturing,

    /// The recognition service is running.
    Transcribing,

    /// The generation service is producing the reply.
    Generating,

    /// At least one sentence has been dispatched for synthesis.
    Synthesizing,

    /// Reply audio is being played back.
    Playing,
}

impl TurnState {
    /// Returns `true` while a turn is in progress.
    ///
    /// ```
    /// use voice_relay::pipeline::TurnState;
    ///
    /// assert!(!TurnState::Idle.is_busy());
    /// assert!(TurnState::Capturing.is_busy());
    /// assert!(TurnState::Playing.is_busy());
    /// ```
    pub fn is_busy(&self) -> bool {
        !matches!(self, TurnState::Idle)
    }

    /// A short human-readable label for status displays.
    pub fn label(&self) -> &'static str {
        match self {
            TurnState::Idle => "Idle",
            TurnState::Capturing => "Capturing",
            TurnState::Transcribing => "Transcribing",
            TurnState::Generating => "Generating",
            TurnState::Synthesizing => "Synthesizing",
            TurnState::Playing => "Playing",
        }
    }
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Shared session state, held behind [`SharedState`].
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    /// Current phase of the active turn.
    pub turn: TurnState,

    /// Identifier of the active (or most recent) turn; `0` before the first.
    pub turn_id: u64,

    /// Recognized text of the most recent turn.
    pub last_transcript: Option<String>,

    /// Reply text of the most recent successful turn.
    pub last_reply: Option<String>,

    /// Message of the most recent turn failure; cleared when a turn starts.
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// SharedState
// ---------------------------------------------------------------------------

/// Thread-safe handle to [`SessionState`].
///
/// Lock for a short critical section; never hold the lock across `.await`.
pub type SharedState = Arc<Mutex<SessionState>>;

pub fn new_shared_state() -> SharedState {
    Arc::new(Mutex::new(SessionState::default()))
}

/// Lock `state`, recovering from poisoning.
pub(crate) fn lock_state(state: &SharedState) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
