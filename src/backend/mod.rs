//! Backend service contracts and their HTTP implementations.
//!
//! This module provides:
//! * [`Recognizer`], [`Generator`], [`Synthesizer`], [`AudioPlayer`] — the
//!   async contracts the orchestrator consumes.
//! * [`HttpRecognizer`], [`HttpGenerator`], [`HttpSynthesizer`] —
//!   OpenAI-compatible adapters executed through the connection pool.
//! * [`FilePlayer`] — writes clips to disk in playback order.
//! * [`ChatMessage`] / [`Transcript`] — the data crossing the boundary.

pub mod extract;
pub mod http;
pub mod message;
pub mod player;
pub mod sse;
pub mod traits;

pub use http::{HttpGenerator, HttpRecognizer, HttpSynthesizer};
pub use message::{ChatMessage, Role, Transcript};
pub use player::FilePlayer;
pub use traits::{AudioPlayer, Generator, Recognizer, Synthesizer};
