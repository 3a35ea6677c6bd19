//! Lifecycle notifications published to the host application.
//!
//! Events form one closed enum.  Every subscriber gets its own unbounded
//! channel, so a slow listener never loses events and never blocks the
//! turn.  Events are delivered in emission order.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use super::state::TurnState;
use crate::backend::Role;

// ---------------------------------------------------------------------------
// ConversationEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    TurnStart {
        turn_id: u64,
    },
    TurnEnd {
        turn_id: u64,
        /// `false` when the turn failed, timed out or was stopped.
        completed: bool,
    },
    /// A user transcript or an assistant reply.
    Message {
        role: Role,
        content: String,
    },
    SpeechStart {
        seq: u64,
        text: String,
    },
    SpeechEnd {
        seq: u64,
    },
    /// Emitted exactly once per failed turn.
    Error {
        message: String,
    },
    StatusChange {
        from: TurnState,
        to: TurnState,
    },
}

/// Discriminant of [`ConversationEvent`], for filtered subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TurnStart,
    TurnEnd,
    Message,
    SpeechStart,
    SpeechEnd,
    Error,
    StatusChange,
}

impl ConversationEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConversationEvent::TurnStart { .. } => EventKind::TurnStart,
            ConversationEvent::TurnEnd { .. } => EventKind::TurnEnd,
            ConversationEvent::Message { .. } => EventKind::Message,
            ConversationEvent::SpeechStart { .. } => EventKind::SpeechStart,
            ConversationEvent::SpeechEnd { .. } => EventKind::SpeechEnd,
            ConversationEvent::Error { .. } => EventKind::Error,
            ConversationEvent::StatusChange { .. } => EventKind::StatusChange,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

struct Subscriber {
    kinds: Option<Vec<EventKind>>,
    tx: mpsc::UnboundedSender<ConversationEvent>,
}

/// Fan-out of [`ConversationEvent`]s to any number of subscribers.  Cheap to
/// clone; clones share the subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConversationEvent> {
        self.register(None)
    }

    /// Receive only events of the listed kinds.
    pub fn subscribe_to(&self, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<ConversationEvent> {
        self.register(Some(kinds.to_vec()))
    }

    fn register(&self, kinds: Option<Vec<EventKind>>) -> mpsc::UnboundedReceiver<ConversationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber { kinds, tx });
        rx
    }

    /// Deliver `event` to every interested subscriber.  Subscribers whose
    /// receiver was dropped are removed.
    pub fn emit(&self, event: ConversationEvent) {
        let kind = event.kind();
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subs.retain(|sub| {
            let wanted = sub.kinds.as_ref().map_or(true, |k| k.contains(&kind));
            !wanted || sub.tx.send(event.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
