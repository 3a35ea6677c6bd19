//! Rolling-window conversation history.
//!
//! [`ConversationHistory`] keeps the last *N* role-tagged messages of a
//! session and builds the message list sent to the generation service:
//!
//! ```text
//! system prompt          ← always first, never trimmed
//! user / assistant …     ← oldest first, at most `max_messages`
//! ```
//!
//! [`recent`](ConversationHistory::recent) builds the trimmed list used for
//! the retry after an empty reply.

use std::collections::VecDeque;

use crate::backend::{ChatMessage, Role};

#[derive(Debug, Clone)]
pub struct ConversationHistory {
    system_prompt: String,
    messages: VecDeque<ChatMessage>,
    max_messages: usize,
}

impl ConversationHistory {
    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    pub fn new(system_prompt: impl Into<String>, max_messages: usize) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages: VecDeque::with_capacity(max_messages + 1),
            max_messages: max_messages.max(1),
        }
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Append a message; the oldest entries drop once the window is full.
    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push_back(message);
        while self.messages.len() > self.max_messages {
            self.messages.pop_front();
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::assistant(content));
    }

    /// Forget the conversation; the system prompt stays.
    pub fn reset(&mut self) {
        self.messages.clear();
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// System prompt followed by the whole window.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.with_system(self.messages.iter())
    }

    /// System prompt followed by the last `n` messages only.
    pub fn recent(&self, n: usize) -> Vec<ChatMessage> {
        let skip = self.messages.len().saturating_sub(n);
        self.with_system(self.messages.iter().skip(skip))
    }

    /// Content of the most recent user message.
    pub fn last_user(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn with_system<'a>(&self, tail: impl Iterator<Item = &'a ChatMessage>) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if !self.system_prompt.is_empty() {
            out.push(ChatMessage::system(self.system_prompt.clone()));
        }
        out.extend(tail.cloned());
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_leads_every_list() {
        let mut h = ConversationHistory::new("be brief", 10);
        h.push_user("hello");
        let msgs = h.messages();
        assert_eq!(msgs[0], ChatMessage::system("be brief"));
        assert_eq!(msgs[1], ChatMessage::user("hello"));
    }

    #[test]
    fn window_drops_oldest() {
        let mut h = ConversationHistory::new("", 2);
        h.push_user("a");
        h.push_assistant("b");
        h.push_user("c");
        assert_eq!(h.len(), 2);
        assert_eq!(
            h.messages(),
            vec![ChatMessage::assistant("b"), ChatMessage::user("c")]
        );
    }

    #[test]
    fn recent_trims_to_last_messages() {
        let mut h = ConversationHistory::new("sys", 10);
        for i in 0..5 {
            h.push_user(format!("u{i}"));
            h.push_assistant(format!("a{i}"));
        }
        let trimmed = h.recent(2);
        assert_eq!(trimmed.len(), 3);
        assert_eq!(trimmed[1], ChatMessage::user("u4"));
        assert_eq!(trimmed[2], ChatMessage::assistant("a4"));
    }

    #[test]
    fn last_user_skips_assistant_messages() {
        let mut h = ConversationHistory::new("", 10);
        assert_eq!(h.last_user(), None);
        h.push_user("what time is it");
        h.push_assistant("noon");
        assert_eq!(h.last_user(), Some("what time is it"));
    }

    #[test]
    fn reset_clears_window_only() {
        let mut h = ConversationHistory::new("sys", 10);
        h.push_user("x");
        h.reset();
        assert!(h.is_empty());
        assert_eq!(h.messages(), vec![ChatMessage::system("sys")]);
    }
}
