//! Conversation orchestrator — drives one turn from utterance audio to
//! played reply.
//!
//! # Turn flow
//!
//! ```text
//! run_turn(audio)                                    [Capturing]
//!   └─▶ queue(Recognition) → transcript              [Transcribing]
//!   └─▶ generation cache hit?  ─yes─▶ replay cached text
//!   └─▶ queue(Generation) → fragments (mpsc)         [Generating]
//!         └─▶ SentenceSegmenter → seq 1, 2, 3 …
//!               └─▶ JoinSet: cache → queue(Synthesis) → cache   [Synthesizing]
//!                     └─▶ completions in any order
//!                           └─▶ ReorderBuffer → FIFO → player   [Playing]
//!   └─▶ empty reply → retry with trimmed context → fallback utterance
//!   └─▶ Idle (always, on success, failure, stop or timeout)
//! ```
//!
//! Per-turn structures (segmenter, reorder buffer, sequence counter,
//! synthesis tasks) are locals of the turn, so nothing carries over from
//! one turn to the next.  The queue, pool and cache are shared services
//! passed in at construction.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::events::{ConversationEvent, EventBus};
use super::fallback::fallback_reply;
use super::history::ConversationHistory;
use super::reorder::{ReorderBuffer, FIRST_SEQ};
use super::sentence::{SentenceSegmenter, SentenceUnit};
use super::state::{lock_state, new_shared_state, SharedState, TurnState};
use crate::backend::{AudioPlayer, ChatMessage, Generator, Recognizer, Role, Synthesizer, Transcript};
use crate::cache::{CacheKey, ResponseCache};
use crate::config::PipelineConfig;
use crate::error::TaskError;
use crate::queue::{AdmissionQueue, Priority, ResourceClass, TaskHandle, TaskOptions};

/// Generation fragments buffered between the generation task and the
/// segmenter.
const FRAGMENT_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// Typed failure of one turn.  Every variant except [`PipelineError::Busy`]
/// leaves the session back in [`TurnState::Idle`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// Another turn of this session is still active.
    #[error("a turn is already in progress")]
    Busy,

    #[error("recognition failed: {0}")]
    Recognition(TaskError),

    #[error("generation failed: {0}")]
    Generation(TaskError),

    #[error("synthesis of sentence {seq} failed: {source}")]
    Synthesis { seq: u64, source: TaskError },

    #[error("playback failed: {0}")]
    Playback(TaskError),

    #[error("turn did not finish within {0:?}")]
    TurnTimeout(Duration),

    /// The turn was stopped.  Not reported as an error event.
    #[error("turn cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Wrap a stage failure, keeping cancellation distinct.
    fn at(stage: fn(TaskError) -> PipelineError) -> impl Fn(TaskError) -> PipelineError {
        move |e| {
            if e.is_cancelled() {
                PipelineError::Cancelled
            } else {
                stage(e)
            }
        }
    }

    fn synthesis(seq: u64, source: TaskError) -> PipelineError {
        if source.is_cancelled() {
            PipelineError::Cancelled
        } else {
            PipelineError::Synthesis { seq, source }
        }
    }
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// The external collaborators of a session.
#[derive(Clone)]
pub struct Backends {
    pub recognizer: Arc<dyn Recognizer>,
    pub generator: Arc<dyn Generator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub player: Arc<dyn AudioPlayer>,
}

/// Where the spoken reply came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Generated,
    /// Replayed from the generation cache.
    Cached,
    /// Generation stayed empty after the contextual retry.
    Fallback,
}

/// Result of a completed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub turn_id: u64,
    pub transcript: Transcript,
    /// Spoken sentences joined with single spaces.
    pub reply: String,
    /// Sentences in the order they were played.
    pub spoken: Vec<String>,
    pub kind: ReplyKind,
}

/// Reachability of each backend, checked through the health-check class.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub recognition: Result<(), TaskError>,
    pub generation: Result<(), TaskError>,
    pub synthesis: Result<(), TaskError>,
    pub high_load: bool,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.recognition.is_ok() && self.generation.is_ok() && self.synthesis.is_ok()
    }
}

// ---------------------------------------------------------------------------
// Internal types
// ---------------------------------------------------------------------------

enum ReplySource {
    Generate(Vec<ChatMessage>),
    Text(String),
}

/// What one reply attempt produced.
struct Spoken {
    raw: String,
    sentences: Vec<String>,
    /// Generation broke off after part of the reply was already spoken.
    truncated: bool,
}

impl Spoken {
    fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }
}

type SynthesisSet = JoinSet<(u64, Result<SentenceUnit, TaskError>)>;
type Playback = JoinHandle<Result<Vec<String>, TaskError>>;

/// Clears the session's active flag on every exit path.
struct ActiveTurn<'a>(&'a AtomicBool);

impl Drop for ActiveTurn<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn transition(state: &SharedState, events: &EventBus, to: TurnState) {
    let from = {
        let mut st = lock_state(state);
        let from = st.turn;
        if from == to {
            return;
        }
        st.turn = to;
        from
    };
    log::debug!("pipeline: {from} → {to}");
    events.emit(ConversationEvent::StatusChange { from, to });
}

/// Transition only when the session is currently in `expected`.
fn transition_from(state: &SharedState, events: &EventBus, expected: TurnState, to: TurnState) {
    let moved = {
        let mut st = lock_state(state);
        let moved = st.turn == expected;
        if moved {
            st.turn = to;
        }
        moved
    };
    if moved {
        log::debug!("pipeline: {expected} → {to}");
        events.emit(ConversationEvent::StatusChange { from: expected, to });
    }
}

fn playback_error(ended: Result<Result<Vec<String>, TaskError>, JoinError>) -> PipelineError {
    match ended {
        Ok(Err(e)) => PipelineError::at(PipelineError::Playback)(e),
        Ok(Ok(_)) => PipelineError::Playback(TaskError::Internal("playback ended early".into())),
        Err(join) => PipelineError::Playback(TaskError::from(join)),
    }
}

// ---------------------------------------------------------------------------
// ConversationSession
// ---------------------------------------------------------------------------

/// One conversation: history, turn state and event stream over shared
/// services.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use voice_relay::config::AppConfig;
/// use voice_relay::pipeline::{Backends, ConversationSession};
/// use voice_relay::services::Services;
///
/// # async fn example(backends: Backends, audio: bytes::Bytes) {
/// let config = AppConfig::default();
/// let services = Services::start(&config);
/// let session = ConversationSession::new(
///     services.queue.clone(),
///     Arc::clone(&services.cache),
///     backends,
///     config.pipeline.clone(),
///     config.backends.voice.clone(),
/// );
/// let mut events = session.subscribe();
/// let outcome = session.run_turn(audio).await;
/// # }
/// ```
pub struct ConversationSession {
    queue: AdmissionQueue,
    cache: Arc<ResponseCache>,
    backends: Backends,
    config: PipelineConfig,
    voice: String,
    state: SharedState,
    history: Mutex<ConversationHistory>,
    events: EventBus,
    turn_cancel: Mutex<CancellationToken>,
    active: AtomicBool,
    turn_counter: AtomicU64,
}

impl ConversationSession {
    pub fn new(
        queue: AdmissionQueue,
        cache: Arc<ResponseCache>,
        backends: Backends,
        config: PipelineConfig,
        voice: impl Into<String>,
    ) -> Self {
        let history = ConversationHistory::new(config.system_prompt.clone(), config.history_window);
        Self {
            queue,
            cache,
            backends,
            config,
            voice: voice.into(),
            state: new_shared_state(),
            history: Mutex::new(history),
            events: EventBus::new(),
            turn_cancel: Mutex::new(CancellationToken::new()),
            active: AtomicBool::new(false),
            turn_counter: AtomicU64::new(0),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConversationEvent> {
        self.events.subscribe()
    }

    /// Current generation context (system prompt plus window).
    pub fn history(&self) -> Vec<ChatMessage> {
        self.lock_history().messages()
    }

    pub fn reset_history(&self) {
        self.lock_history().reset();
    }

    // -----------------------------------------------------------------------
    // Turn control
    // -----------------------------------------------------------------------

    /// Run one full turn for `audio`.
    ///
    /// Refused with [`PipelineError::Busy`] while another turn of this
    /// session is active.  Always returns within `turn_timeout_secs`.
    pub async fn run_turn(&self, audio: Bytes) -> Result<TurnOutcome, PipelineError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("pipeline: turn refused, previous turn still active");
            return Err(PipelineError::Busy);
        }
        let _active = ActiveTurn(&self.active);

        let turn_id = self.turn_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        *self.turn_cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        {
            let mut st = lock_state(&self.state);
            st.turn_id = turn_id;
            st.error_message = None;
        }
        log::info!("pipeline: turn {turn_id} started ({} bytes of audio)", audio.len());
        self.events.emit(ConversationEvent::TurnStart { turn_id });

        let limit = self.config.turn_timeout();
        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(PipelineError::Cancelled),
            r = tokio::time::timeout(limit, self.drive_turn(turn_id, audio, &token)) => {
                r.unwrap_or(Err(PipelineError::TurnTimeout(limit)))
            }
        };
        // Whatever the turn left behind (queued synthesis, playback) stops here.
        token.cancel();

        match &result {
            Ok(outcome) => {
                log::info!(
                    "pipeline: turn {turn_id} done, {} sentence(s) spoken ({:?})",
                    outcome.spoken.len(),
                    outcome.kind
                );
                lock_state(&self.state).last_reply = Some(outcome.reply.clone());
            }
            Err(PipelineError::Cancelled) => {
                log::info!("pipeline: turn {turn_id} stopped");
            }
            Err(e) => {
                log::error!("pipeline: turn {turn_id} failed: {e}");
                lock_state(&self.state).error_message = Some(e.to_string());
                self.events.emit(ConversationEvent::Error {
                    message: e.to_string(),
                });
            }
        }

        transition(&self.state, &self.events, TurnState::Idle);
        self.events.emit(ConversationEvent::TurnEnd {
            turn_id,
            completed: result.is_ok(),
        });
        result
    }

    /// Cancel the active turn, if any.  Its pending queue entries and
    /// in-flight requests are abandoned and the session returns to `Idle`.
    pub fn stop(&self) {
        log::info!("pipeline: stop requested");
        self.turn_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    /// Check every backend through the lowest-priority health-check class.
    pub async fn health_check(&self) -> HealthReport {
        let options = || TaskOptions::new().priority(Priority::Low);
        let recognizer = Arc::clone(&self.backends.recognizer);
        let generator = Arc::clone(&self.backends.generator);
        let synthesizer = Arc::clone(&self.backends.synthesizer);

        let (recognition, generation, synthesis) = tokio::join!(
            self.queue.submit(ResourceClass::HealthCheck, options(), move || {
                let recognizer = Arc::clone(&recognizer);
                async move { recognizer.health().await }
            }),
            self.queue.submit(ResourceClass::HealthCheck, options(), move || {
                let generator = Arc::clone(&generator);
                async move { generator.health().await }
            }),
            self.queue.submit(ResourceClass::HealthCheck, options(), move || {
                let synthesizer = Arc::clone(&synthesizer);
                async move { synthesizer.health().await }
            }),
        );

        HealthReport {
            recognition,
            generation,
            synthesis,
            high_load: self.queue.is_high_load(),
        }
    }

    // -----------------------------------------------------------------------
    // Turn stages
    // -----------------------------------------------------------------------

    async fn drive_turn(
        &self,
        turn_id: u64,
        audio: Bytes,
        token: &CancellationToken,
    ) -> Result<TurnOutcome, PipelineError> {
        self.transition(TurnState::Capturing);
        if audio.is_empty() {
            return Err(PipelineError::Recognition(TaskError::EmptyResponse));
        }

        // ── 1. Recognition ───────────────────────────────────────────────
        self.transition(TurnState::Transcribing);
        let recognizer = Arc::clone(&self.backends.recognizer);
        let mut transcript = self
            .queue
            .submit(ResourceClass::Recognition, self.options(token), move || {
                let recognizer = Arc::clone(&recognizer);
                let audio = audio.clone();
                async move { recognizer.transcribe(audio).await }
            })
            .await
            .map_err(PipelineError::at(PipelineError::Recognition))?;

        transcript.text = transcript.text.trim().to_string();
        if transcript.text.is_empty() {
            return Err(PipelineError::Recognition(TaskError::EmptyResponse));
        }
        log::debug!("pipeline: turn {turn_id} transcript = {:?}", transcript.text);

        lock_state(&self.state).last_transcript = Some(transcript.text.clone());
        self.events.emit(ConversationEvent::Message {
            role: Role::User,
            content: transcript.text.clone(),
        });
        self.lock_history().push_user(transcript.text.clone());

        // ── 2. Generation → synthesis → playback ─────────────────────────
        self.transition(TurnState::Generating);
        let (spoken, kind) = self.reply(token).await?;

        // Assistant text was already announced sentence by sentence.
        let reply = spoken.sentences.join(" ");
        self.lock_history().push_assistant(reply.clone());

        Ok(TurnOutcome {
            turn_id,
            transcript,
            reply,
            spoken: spoken.sentences,
            kind,
        })
    }

    /// Produce and speak a reply: cache, generation, trimmed retry, fallback.
    async fn reply(&self, token: &CancellationToken) -> Result<(Spoken, ReplyKind), PipelineError> {
        let messages = self.lock_history().messages();
        let key = CacheKey::for_context(&messages, self.config.fingerprint_messages);

        if let Some(text) = self.cache.get_text(&key) {
            log::debug!("pipeline: generation cache hit");
            let spoken = self.speak(ReplySource::Text(text), token).await?;
            if !spoken.is_empty() {
                return Ok((spoken, ReplyKind::Cached));
            }
        }

        let spoken = self.speak(ReplySource::Generate(messages), token).await?;
        if !spoken.is_empty() {
            if !spoken.truncated {
                let _ = self.cache.set_text(&key, spoken.raw.clone());
            }
            return Ok((spoken, ReplyKind::Generated));
        }

        let keep = self.config.trimmed_context_messages;
        log::warn!("pipeline: empty reply, retrying with the last {keep} message(s)");
        let trimmed = self.lock_history().recent(keep);
        let spoken = self.speak(ReplySource::Generate(trimmed), token).await?;
        if !spoken.is_empty() {
            return Ok((spoken, ReplyKind::Generated));
        }

        log::warn!("pipeline: reply still empty, speaking fallback");
        let text = fallback_reply(self.lock_history().last_user());
        let spoken = self.speak(ReplySource::Text(text), token).await?;
        Ok((spoken, ReplyKind::Fallback))
    }

    /// Stream one reply through segmentation, concurrent synthesis, the
    /// reorder buffer and sequential playback.
    async fn speak(&self, source: ReplySource, token: &CancellationToken) -> Result<Spoken, PipelineError> {
        let (fragment_tx, mut fragments) = mpsc::channel::<String>(FRAGMENT_BUFFER);
        let mut generation: BoxFuture<'static, Result<String, TaskError>> = match source {
            ReplySource::Text(text) => {
                let _ = fragment_tx.try_send(text.clone());
                futures::future::ready(Ok(text)).boxed()
            }
            ReplySource::Generate(messages) => self.start_generation(messages, fragment_tx, token)?.boxed(),
        };

        let mut segmenter = SentenceSegmenter::new(self.config.min_sentence_chars);
        let mut reorder: ReorderBuffer<SentenceUnit> = ReorderBuffer::new();
        let mut synthesis = SynthesisSet::new();
        let mut next_seq = FIRST_SEQ;
        let (play_tx, mut playback) = self.spawn_playback(token);
        let mut raw: Option<String> = None;
        let mut received = String::new();
        let mut truncated = false;
        let mut fragments_open = true;

        loop {
            if raw.is_some() && synthesis.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                () = token.cancelled() => return Err(PipelineError::Cancelled),

                ended = &mut playback => return Err(playback_error(ended)),

                Some(joined) = synthesis.join_next() => {
                    let (seq, result) = joined.map_err(|e| {
                        PipelineError::synthesis(reorder.next_expected(), TaskError::from(e))
                    })?;
                    let unit = result.map_err(|e| PipelineError::synthesis(seq, e))?;
                    for (_, ready) in reorder.insert(seq, unit) {
                        self.events.emit(ConversationEvent::Message {
                            role: Role::Assistant,
                            content: ready.text.clone(),
                        });
                        // A closed channel means playback ended; the branch
                        // above reports why.
                        let _ = play_tx.send(ready);
                    }
                }

                fragment = fragments.recv(), if fragments_open && raw.is_none() => match fragment {
                    Some(fragment) => {
                        received.push_str(&fragment);
                        for sentence in segmenter.push(&fragment) {
                            self.dispatch(&mut synthesis, &mut next_seq, sentence, token);
                        }
                    }
                    None => fragments_open = false,
                },

                done = &mut generation, if raw.is_none() => {
                    while let Ok(fragment) = fragments.try_recv() {
                        received.push_str(&fragment);
                        for sentence in segmenter.push(&fragment) {
                            self.dispatch(&mut synthesis, &mut next_seq, sentence, token);
                        }
                    }
                    let text = match done {
                        Ok(text) => text,
                        Err(TaskError::EmptyResponse) => String::new(),
                        // Part of the reply is already on its way to the
                        // speaker; finish what arrived instead of failing.
                        Err(e @ (TaskError::Interrupted(_) | TaskError::Timeout(_)))
                            if !received.is_empty() =>
                        {
                            log::warn!(
                                "pipeline: generation broke off after partial output ({e}); keeping what arrived"
                            );
                            truncated = true;
                            String::new()
                        }
                        Err(e) => return Err(PipelineError::at(PipelineError::Generation)(e)),
                    };
                    if let Some(sentence) = segmenter.finish() {
                        self.dispatch(&mut synthesis, &mut next_seq, sentence, token);
                    }
                    raw = Some(if truncated { received.clone() } else { text });
                }
            }
        }

        drop(play_tx);
        let sentences = match playback.await {
            Ok(Ok(played)) => played,
            ended => return Err(playback_error(ended)),
        };
        Ok(Spoken {
            raw: raw.unwrap_or_default(),
            sentences,
            truncated,
        })
    }

    fn start_generation(
        &self,
        messages: Vec<ChatMessage>,
        sink: mpsc::Sender<String>,
        token: &CancellationToken,
    ) -> Result<TaskHandle<String>, PipelineError> {
        let generator = Arc::clone(&self.backends.generator);
        let messages = Arc::new(messages);
        let stream = self.config.stream_generation;
        // Set once any fragment reached `sink`.  A retried attempt would
        // speak those fragments a second time, so it refuses to run.
        let forwarded = Arc::new(AtomicBool::new(false));

        self.queue
            .enqueue(ResourceClass::Generation, self.options(token), move || {
                let generator = Arc::clone(&generator);
                let messages = Arc::clone(&messages);
                let sink = sink.clone();
                let forwarded = Arc::clone(&forwarded);
                async move {
                    if forwarded.load(Ordering::Acquire) {
                        return Err(TaskError::Interrupted(
                            "earlier attempt already streamed part of the reply".into(),
                        ));
                    }
                    if !stream {
                        let text = generator.generate(&messages).await?;
                        if sink.send(text.clone()).await.is_ok() {
                            forwarded.store(true, Ordering::Release);
                        }
                        return Ok(text);
                    }

                    let (relay_tx, mut relay_rx) = mpsc::channel::<String>(FRAGMENT_BUFFER);
                    let relay = async {
                        while let Some(fragment) = relay_rx.recv().await {
                            if sink.send(fragment).await.is_err() {
                                break;
                            }
                            forwarded.store(true, Ordering::Release);
                        }
                    };
                    let (result, ()) =
                        tokio::join!(generator.generate_stream(&messages, relay_tx), relay);
                    result
                }
            })
            .map_err(PipelineError::at(PipelineError::Generation))
    }

    /// Assign the next sequence number to `text` and synthesize it in the
    /// background: audio cache, then the queue, then cache the result.
    fn dispatch(&self, tasks: &mut SynthesisSet, next_seq: &mut u64, text: String, token: &CancellationToken) {
        let seq = *next_seq;
        *next_seq += 1;
        transition_from(&self.state, &self.events, TurnState::Generating, TurnState::Synthesizing);
        log::debug!("pipeline: sentence {seq} dispatched: {text:?}");

        let cache = Arc::clone(&self.cache);
        let queue = self.queue.clone();
        let synthesizer = Arc::clone(&self.backends.synthesizer);
        let voice = self.voice.clone();
        // The first sentence gates time-to-first-audio.
        let priority = if seq == FIRST_SEQ {
            Priority::High
        } else {
            Priority::Normal
        };
        let options = self.options(token).priority(priority);

        tasks.spawn(async move {
            let mut unit = SentenceUnit::pending(seq, text);
            let key = CacheKey::for_synthesis(&voice, &unit.text);
            if let Some(audio) = cache.get_audio(&key) {
                log::debug!("pipeline: sentence {seq} served from audio cache");
                unit.audio = Some(audio);
                return (seq, Ok(unit));
            }

            let input = unit.text.clone();
            let result = queue
                .submit(ResourceClass::Synthesis, options, move || {
                    let synthesizer = Arc::clone(&synthesizer);
                    let input = input.clone();
                    let voice = voice.clone();
                    async move { synthesizer.synthesize(&input, &voice).await }
                })
                .await;

            let unit = result.map(|audio| {
                let _ = cache.set_audio(&key, audio.clone());
                unit.audio = Some(audio);
                unit
            });
            (seq, unit)
        });
    }

    /// Sequential player: one clip at a time, each awaited to completion.
    fn spawn_playback(&self, token: &CancellationToken) -> (mpsc::UnboundedSender<SentenceUnit>, Playback) {
        let (tx, mut rx) = mpsc::unbounded_channel::<SentenceUnit>();
        let player = Arc::clone(&self.backends.player);
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let token = token.clone();

        let handle = tokio::spawn(async move {
            let mut played = Vec::new();
            loop {
                // A stopped turn must not start another clip, even one
                // already queued.
                let unit = tokio::select! {
                    biased;
                    () = token.cancelled() => return Err(TaskError::Cancelled),
                    unit = rx.recv() => match unit {
                        Some(unit) => unit,
                        None => break,
                    },
                };
                if !unit.is_ready() {
                    log::warn!("pipeline: sentence {} reached playback without audio", unit.seq);
                    continue;
                }
                let audio = unit.audio.clone().unwrap_or_default();
                transition(&state, &events, TurnState::Playing);
                events.emit(ConversationEvent::SpeechStart {
                    seq: unit.seq,
                    text: unit.text.clone(),
                });
                tokio::select! {
                    biased;
                    () = token.cancelled() => return Err(TaskError::Cancelled),
                    r = player.play(&audio) => r?,
                }
                events.emit(ConversationEvent::SpeechEnd { seq: unit.seq });
                played.push(unit.text);
            }
            Ok(played)
        });
        (tx, handle)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn options(&self, token: &CancellationToken) -> TaskOptions {
        TaskOptions::new().cancel(token.child_token())
    }

    fn transition(&self, to: TurnState) {
        transition(&self.state, &self.events, to);
    }

    fn lock_history(&self) -> MutexGuard<'_, ConversationHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, QueueConfig};
    use crate::pipeline::events::EventKind;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::AtomicUsize;

    // -----------------------------------------------------------------------
    // Test doubles
    // -----------------------------------------------------------------------

    struct FixedRecognizer(&'static str);

    #[async_trait]
    impl Recognizer for FixedRecognizer {
        async fn transcribe(&self, _audio: Bytes) -> Result<Transcript, TaskError> {
            Ok(Transcript::new(self.0))
        }
    }

    /// Streams one scripted list of fragments per call.
    #[derive(Default)]
    struct ScriptedGenerator {
        replies: Mutex<VecDeque<Vec<&'static str>>>,
        delay: Duration,
        /// First call only: hang this long after the first fragment.
        stall: Duration,
        calls: AtomicUsize,
        context_sizes: Mutex<Vec<usize>>,
    }

    impl ScriptedGenerator {
        fn new(replies: Vec<Vec<&'static str>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                ..Self::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(vec![vec!["Too late."]])
            }
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, messages: &[ChatMessage]) -> Result<String, TaskError> {
            let (tx, _rx) = mpsc::channel(64);
            self.generate_stream(messages, tx).await
        }

        async fn generate_stream(
            &self,
            messages: &[ChatMessage],
            sink: mpsc::Sender<String>,
        ) -> Result<String, TaskError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.context_sizes.lock().unwrap().push(messages.len());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let fragments = self.replies.lock().unwrap().pop_front().unwrap_or_default();
            let mut full = String::new();
            for (i, f) in fragments.into_iter().enumerate() {
                if call == 0 && i == 1 && !self.stall.is_zero() {
                    tokio::time::sleep(self.stall).await;
                }
                full.push_str(f);
                let _ = sink.send(f.to_string()).await;
            }
            Ok(full)
        }
    }

    /// Returns the sentence text as its "audio", after a per-text delay.
    #[derive(Default)]
    struct DelayedSynthesizer {
        delays: HashMap<&'static str, Duration>,
        fail_on: Option<&'static str>,
        completed: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Synthesizer for DelayedSynthesizer {
        async fn synthesize(&self, text: &str, _voice: &str) -> Result<Bytes, TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.delays.get(text) {
                tokio::time::sleep(*d).await;
            }
            if self.fail_on == Some(text) {
                return Err(TaskError::Rejected("voice not found".into()));
            }
            self.completed.lock().unwrap().push(text.to_string());
            Ok(Bytes::from(text.to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingPlayer {
        clips: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AudioPlayer for RecordingPlayer {
        async fn play(&self, clip: &Bytes) -> Result<(), TaskError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.clips
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(clip).into_owned());
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    struct Harness {
        session: Arc<ConversationSession>,
        generator: Arc<ScriptedGenerator>,
        synthesizer: Arc<DelayedSynthesizer>,
        player: Arc<RecordingPlayer>,
        queue: AdmissionQueue,
    }

    fn harness(
        generator: ScriptedGenerator,
        synthesizer: DelayedSynthesizer,
        config: PipelineConfig,
    ) -> Harness {
        harness_with_queue(generator, synthesizer, config, QueueConfig::default())
    }

    fn harness_with_queue(
        generator: ScriptedGenerator,
        synthesizer: DelayedSynthesizer,
        config: PipelineConfig,
        mut queue_config: QueueConfig,
    ) -> Harness {
        for class in ResourceClass::ALL {
            let c = queue_config.class_mut(class);
            c.retry_base_delay_ms = 1;
            c.retry_max_delay_ms = 2;
        }
        let queue = AdmissionQueue::start(queue_config);
        let cache = Arc::new(ResponseCache::new(&CacheConfig::default()));

        let generator = Arc::new(generator);
        let synthesizer = Arc::new(synthesizer);
        let player = Arc::new(RecordingPlayer::default());
        let backends = Backends {
            recognizer: Arc::new(FixedRecognizer("hello")),
            generator: generator.clone(),
            synthesizer: synthesizer.clone(),
            player: player.clone(),
        };

        let session = Arc::new(ConversationSession::new(
            queue.clone(),
            cache,
            backends,
            config,
            "alloy",
        ));
        Harness {
            session,
            generator,
            synthesizer,
            player,
            queue,
        }
    }

    fn audio() -> Bytes {
        Bytes::from_static(b"RIFF....WAVE")
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ConversationEvent>) -> Vec<ConversationEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    async fn wait_for(session: &ConversationSession, target: TurnState) {
        for _ in 0..1_000 {
            if lock_state(&session.state).turn == target {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("session never reached {target}");
    }

    // -----------------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn playback_follows_sentence_order_when_synthesis_finishes_out_of_order() {
        let h = harness(
            ScriptedGenerator::new(vec![vec!["Hi! ", "(pause) ", "How are you?"]]),
            DelayedSynthesizer {
                delays: HashMap::from([
                    ("Hi!", Duration::from_millis(200)),
                    ("How are you?", Duration::from_millis(10)),
                ]),
                ..DelayedSynthesizer::default()
            },
            PipelineConfig::default(),
        );
        let mut events = h.session.subscribe();

        let outcome = h.session.run_turn(audio()).await.unwrap();

        // The second sentence really did finish first.
        assert_eq!(
            *h.synthesizer.completed.lock().unwrap(),
            vec!["How are you?", "Hi!"]
        );
        assert_eq!(*h.player.clips.lock().unwrap(), vec!["Hi!", "How are you?"]);
        assert_eq!(outcome.spoken, vec!["Hi!", "How are you?"]);
        assert_eq!(outcome.reply, "Hi! How are you?");
        assert_eq!(outcome.kind, ReplyKind::Generated);
        assert_eq!(outcome.transcript.text, "hello");

        let events = drain(&mut events);
        assert_eq!(events.first(), Some(&ConversationEvent::TurnStart { turn_id: 1 }));
        assert_eq!(
            events.last(),
            Some(&ConversationEvent::TurnEnd {
                turn_id: 1,
                completed: true
            })
        );
        let speech: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                ConversationEvent::SpeechStart { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect();
        assert_eq!(speech, vec![1, 2]);
        assert!(events.contains(&ConversationEvent::Message {
            role: Role::User,
            content: "hello".into()
        }));
        assert!(!events.iter().any(|e| matches!(e, ConversationEvent::Error { .. })));
        assert_eq!(lock_state(&h.session.state).turn, TurnState::Idle);
        h.queue.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn assistant_text_is_announced_sentence_by_sentence_before_playback_ends() {
        let h = harness(
            ScriptedGenerator::new(vec![vec!["Hi! ", "How are you?"]]),
            DelayedSynthesizer {
                delays: HashMap::from([("Hi!", Duration::from_millis(50))]),
                ..DelayedSynthesizer::default()
            },
            PipelineConfig::default(),
        );
        let mut events = h.session.subscribe();
        h.session.run_turn(audio()).await.unwrap();

        let events = drain(&mut events);
        let said: Vec<(usize, &str)> = events
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match e {
                ConversationEvent::Message {
                    role: Role::Assistant,
                    content,
                } => Some((i, content.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(
            said.iter().map(|(_, text)| *text).collect::<Vec<_>>(),
            vec!["Hi!", "How are you?"]
        );

        let last_speech_end = events
            .iter()
            .rposition(|e| matches!(e, ConversationEvent::SpeechEnd { seq: 2 }))
            .unwrap();
        assert!(said.iter().all(|(i, _)| *i < last_speech_end));
        h.queue.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn states_progress_through_the_turn() {
        let h = harness(
            ScriptedGenerator::new(vec![vec!["Sure."]]),
            DelayedSynthesizer::default(),
            PipelineConfig::default(),
        );
        let mut events = h.session.subscribe();
        h.session.run_turn(audio()).await.unwrap();

        let path: Vec<TurnState> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                ConversationEvent::StatusChange { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            path,
            vec![
                TurnState::Capturing,
                TurnState::Transcribing,
                TurnState::Generating,
                TurnState::Synthesizing,
                TurnState::Playing,
                TurnState::Idle,
            ]
        );
        h.queue.shutdown();
    }

    // -----------------------------------------------------------------------
    // Empty replies
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn empty_replies_fall_back_to_spoken_utterance() {
        let mut config = PipelineConfig::default();
        config.turn_timeout_secs = 5;
        let h = harness(
            ScriptedGenerator::new(vec![vec!["(pause)"], vec![""]]),
            DelayedSynthesizer::default(),
            config,
        );

        let outcome = h.session.run_turn(audio()).await.unwrap();

        assert_eq!(outcome.kind, ReplyKind::Fallback);
        assert!(!outcome.spoken.is_empty());
        assert!(outcome.reply.contains("hello"));
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*h.player.clips.lock().unwrap(), outcome.spoken);
        h.queue.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_reply_is_retried_with_trimmed_context() {
        let mut config = PipelineConfig::default();
        config.trimmed_context_messages = 2;
        let h = harness(
            ScriptedGenerator::new(vec![vec!["Sure."], vec![""], vec!["Okay then."]]),
            DelayedSynthesizer::default(),
            config,
        );

        h.session.run_turn(audio()).await.unwrap();
        let outcome = h.session.run_turn(audio()).await.unwrap();

        assert_eq!(outcome.kind, ReplyKind::Generated);
        assert_eq!(outcome.spoken, vec!["Okay then."]);
        // system + [user, assistant, user], then system + last two.
        assert_eq!(*h.generator.context_sizes.lock().unwrap(), vec![2, 4, 3]);
        h.queue.shutdown();
    }

    // -----------------------------------------------------------------------
    // Caching
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn generation_timeout_after_partial_output_is_not_replayed() {
        let mut queue_config = QueueConfig::default();
        queue_config.class_mut(ResourceClass::Generation).timeout_ms = 2_000;
        let reply = vec!["First sentence here. ", "Second one."];
        let h = harness_with_queue(
            ScriptedGenerator {
                stall: Duration::from_secs(10),
                ..ScriptedGenerator::new(vec![reply.clone(), reply])
            },
            DelayedSynthesizer::default(),
            PipelineConfig::default(),
            queue_config,
        );

        let outcome = h.session.run_turn(audio()).await.unwrap();

        assert_eq!(outcome.spoken, vec!["First sentence here."]);
        assert_eq!(outcome.kind, ReplyKind::Generated);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*h.player.clips.lock().unwrap(), vec!["First sentence here."]);

        let history = h.session.history();
        let assistant: Vec<&str> = history
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(assistant, vec!["First sentence here."]);
        assert_eq!(lock_state(&h.session.state).turn, TurnState::Idle);
        h.queue.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_context_is_served_from_caches() {
        let mut config = PipelineConfig::default();
        config.fingerprint_messages = 1;
        let h = harness(
            ScriptedGenerator::new(vec![vec!["Hi!"]]),
            DelayedSynthesizer::default(),
            config,
        );

        let first = h.session.run_turn(audio()).await.unwrap();
        let second = h.session.run_turn(audio()).await.unwrap();

        assert_eq!(first.kind, ReplyKind::Generated);
        assert_eq!(second.kind, ReplyKind::Cached);
        assert_eq!(second.spoken, vec!["Hi!"]);
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.synthesizer.calls.load(Ordering::SeqCst), 1);
        h.queue.shutdown();
    }

    // -----------------------------------------------------------------------
    // Failures
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn synthesis_failure_fails_turn_once_and_resets() {
        let h = harness(
            ScriptedGenerator::new(vec![vec!["Hi! How are you?"], vec!["Bye."]]),
            DelayedSynthesizer {
                fail_on: Some("How are you?"),
                ..DelayedSynthesizer::default()
            },
            PipelineConfig::default(),
        );
        let mut events = h.session.subscribe();

        let err = h.session.run_turn(audio()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Synthesis { seq: 2, .. }));

        let events = drain(&mut events);
        let errors = events
            .iter()
            .filter(|e| matches!(e, ConversationEvent::Error { .. }))
            .count();
        assert_eq!(errors, 1);
        assert_eq!(
            events.last(),
            Some(&ConversationEvent::TurnEnd {
                turn_id: 1,
                completed: false
            })
        );
        {
            let st = lock_state(&h.session.state);
            assert_eq!(st.turn, TurnState::Idle);
            assert!(st.error_message.is_some());
        }

        // The session is usable again.
        let outcome = h.session.run_turn(audio()).await.unwrap();
        assert_eq!(outcome.spoken, vec!["Bye."]);
        h.queue.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_audio_is_a_recognition_error() {
        let h = harness(
            ScriptedGenerator::default(),
            DelayedSynthesizer::default(),
            PipelineConfig::default(),
        );
        let err = h.session.run_turn(Bytes::new()).await.unwrap_err();
        assert_eq!(err, PipelineError::Recognition(TaskError::EmptyResponse));
        assert_eq!(h.generator.calls.load(Ordering::SeqCst), 0);
        h.queue.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_turn_times_out_and_resets() {
        let mut config = PipelineConfig::default();
        config.turn_timeout_secs = 1;
        let h = harness(
            ScriptedGenerator::slow(Duration::from_secs(30)),
            DelayedSynthesizer::default(),
            config,
        );
        let mut errors = h.session.events().subscribe_to(&[EventKind::Error]);

        let err = h.session.run_turn(audio()).await.unwrap_err();
        assert_eq!(err, PipelineError::TurnTimeout(Duration::from_secs(1)));
        assert_eq!(drain(&mut errors).len(), 1);
        assert_eq!(lock_state(&h.session.state).turn, TurnState::Idle);
        h.queue.shutdown();
    }

    // -----------------------------------------------------------------------
    // Concurrency control
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn second_turn_is_refused_while_first_is_active() {
        let h = harness(
            ScriptedGenerator::slow(Duration::from_secs(2)),
            DelayedSynthesizer::default(),
            PipelineConfig::default(),
        );

        let session = Arc::clone(&h.session);
        let first = tokio::spawn(async move { session.run_turn(audio()).await });
        wait_for(&h.session, TurnState::Generating).await;

        assert_eq!(h.session.run_turn(audio()).await, Err(PipelineError::Busy));

        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome.spoken, vec!["Too late."]);
        h.queue.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_active_turn_without_error_event() {
        let h = harness(
            ScriptedGenerator::slow(Duration::from_secs(3600)),
            DelayedSynthesizer::default(),
            PipelineConfig::default(),
        );
        let mut events = h.session.subscribe();

        let session = Arc::clone(&h.session);
        let turn = tokio::spawn(async move { session.run_turn(audio()).await });
        wait_for(&h.session, TurnState::Generating).await;

        h.session.stop();
        assert_eq!(turn.await.unwrap(), Err(PipelineError::Cancelled));

        let events = drain(&mut events);
        assert!(!events.iter().any(|e| matches!(e, ConversationEvent::Error { .. })));
        assert_eq!(
            events.last(),
            Some(&ConversationEvent::TurnEnd {
                turn_id: 1,
                completed: false
            })
        );
        assert_eq!(lock_state(&h.session.state).turn, TurnState::Idle);

        // The cancelled generation task leaves the queue.
        for _ in 0..100 {
            if h.queue.stats().processing() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.queue.stats().processing(), 0);
        h.queue.shutdown();
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn health_check_covers_every_backend() {
        let h = harness(
            ScriptedGenerator::default(),
            DelayedSynthesizer::default(),
            PipelineConfig::default(),
        );
        let report = h.session.health_check().await;
        assert!(report.is_healthy());
        assert!(!report.high_load);
        assert_eq!(
            h.queue
                .stats()
                .class(ResourceClass::HealthCheck)
                .unwrap()
                .completed,
            3
        );
        h.queue.shutdown();
    }
}
