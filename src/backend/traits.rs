//! Async contracts for the external backend services.
//!
//! The orchestrator only ever talks to these traits, so tests can swap in
//! scripted doubles and deployments can swap providers.  Implementors must
//! be `Send + Sync` so they can be shared as `Arc<dyn …>` across the tasks a
//! turn fans out to.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::message::{ChatMessage, Transcript};
use crate::error::TaskError;

// ---------------------------------------------------------------------------
// Recognizer
// ---------------------------------------------------------------------------

/// Speech recognition: binary audio in, text out.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn transcribe(&self, audio: Bytes) -> Result<Transcript, TaskError>;

    async fn health(&self) -> Result<(), TaskError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Language-model generation over an ordered list of role-tagged messages.
#[async_trait]
pub trait Generator: Send + Sync {
    /// One complete reply.
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, TaskError>;

    /// Stream reply fragments into `sink` as they arrive and return the full
    /// text.  The default sends the buffered reply as a single fragment.
    ///
    /// If the stream breaks after at least one fragment was sent,
    /// implementations return [`TaskError::Interrupted`] so the attempt is
    /// not replayed.
    async fn generate_stream(
        &self,
        messages: &[ChatMessage],
        sink: mpsc::Sender<String>,
    ) -> Result<String, TaskError> {
        let text = self.generate(messages).await?;
        if !text.is_empty() {
            sink.send(text.clone())
                .await
                .map_err(|_| TaskError::Cancelled)?;
        }
        Ok(text)
    }

    async fn health(&self) -> Result<(), TaskError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Synthesizer
// ---------------------------------------------------------------------------

/// Speech synthesis: text plus voice selector in, binary audio out.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Bytes, TaskError>;

    async fn health(&self) -> Result<(), TaskError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AudioPlayer
// ---------------------------------------------------------------------------

/// Audio output.  `play` resolves only once the clip has finished.
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    async fn play(&self, clip: &Bytes) -> Result<(), TaskError>;
}
