//! Stable content-derived cache keys.
//!
//! Keys are SHA-256 digests so they stay identical across processes and do
//! not grow with the size of the conversation.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::backend::ChatMessage;

/// A stable hash of the semantic content being cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Fingerprint of the last `window` messages of a conversation.
    ///
    /// Two conversations that end with the same role-tagged messages map to
    /// the same key regardless of what came before the window.
    pub fn for_context(messages: &[ChatMessage], window: usize) -> Self {
        let start = messages.len().saturating_sub(window);
        let mut hasher = Sha256::new();
        hasher.update(b"ctx\0");
        for msg in &messages[start..] {
            hasher.update(msg.role.as_str().as_bytes());
            hasher.update(b":");
            hasher.update(msg.content.as_bytes());
            hasher.update(b"\n");
        }
        Self(hex(&hasher.finalize()))
    }

    /// Key for synthesized audio: the literal text plus the voice it was
    /// rendered with.
    pub fn for_synthesis(voice: &str, text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"tts\0");
        hasher.update(voice.as_bytes());
        hasher.update(b"\0");
        hasher.update(text.as_bytes());
        Self(hex(&hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}
