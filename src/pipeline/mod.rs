//! Conversation pipeline: one spoken turn from utterance to played reply.
//!
//! # Architecture
//!
//! ```text
//! audio ──▶ ConversationSession::run_turn()
//!              │
//!              ├─ Recognition  (queue)        → Message{User}
//!              ├─ Generation   (queue, stream) ─▶ SentenceSegmenter
//!              │                                     │ seq 1, 2, 3 …
//!              ├─ Synthesis    (queue, concurrent) ◀─┘
//!              │      └─ completions in any order ─▶ ReorderBuffer
//!              └─ Playback     (one clip at a time, in seq order)
//!
//! SessionState (Arc<Mutex<…>>) ←── polled by the host
//! EventBus ──▶ TurnStart / StatusChange / SpeechStart … / TurnEnd
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voice_relay::backend::FilePlayer;
//! use voice_relay::config::AppConfig;
//! use voice_relay::services::Services;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = AppConfig::default();
//!     let services = Services::start(&config);
//!     let player = Arc::new(FilePlayer::new("replies", "mp3"));
//!     let session = services.session(&config, player);
//!
//!     let audio = bytes::Bytes::from(std::fs::read("question.wav").unwrap());
//!     match session.run_turn(audio).await {
//!         Ok(outcome) => println!("assistant: {}", outcome.reply),
//!         Err(e) => eprintln!("turn failed: {e}"),
//!     }
//!     services.shutdown().await;
//! }
//! ```

pub mod events;
pub mod fallback;
pub mod history;
pub mod reorder;
pub mod runner;
pub mod sentence;
pub mod state;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use events::{ConversationEvent, EventBus, EventKind};
pub use fallback::fallback_reply;
pub use history::ConversationHistory;
pub use reorder::{ReorderBuffer, FIRST_SEQ};
pub use runner::{Backends, ConversationSession, HealthReport, PipelineError, ReplyKind, TurnOutcome};
pub use sentence::{strip_stage_directions, SentenceSegmenter, SentenceUnit};
pub use state::{new_shared_state, SessionState, SharedState, TurnState};
