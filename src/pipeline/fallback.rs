//! Deterministic reply used when generation produces nothing usable.
//!
//! The turn must never end in silence: after the contextual retry also comes
//! back empty, the orchestrator speaks this utterance instead.

/// Words of the user's message quoted back in the fallback.
const EXCERPT_WORDS: usize = 6;

/// Fallback utterance for `last_user`.  Same input, same output.
///
/// ```
/// use voice_relay::pipeline::fallback_reply;
///
/// assert_eq!(
///     fallback_reply(Some("hello")),
///     "Sorry, I lost my train of thought about \"hello\". Could you say that again?"
/// );
/// assert!(!fallback_reply(None).is_empty());
/// ```
pub fn fallback_reply(last_user: Option<&str>) -> String {
    let words: Vec<&str> = last_user
        .map(|text| text.split_whitespace().collect())
        .unwrap_or_default();

    if words.is_empty() {
        return "Sorry, I don't have an answer right now. Could you say that again?".to_string();
    }

    let mut excerpt = words[..words.len().min(EXCERPT_WORDS)].join(" ");
    excerpt = excerpt
        .trim_end_matches(|c: char| matches!(c, '.' | '!' | '?' | ',' | '…'))
        .to_string();
    if words.len() > EXCERPT_WORDS {
        excerpt.push('…');
    }
    format!("Sorry, I lost my train of thought about \"{excerpt}\". Could you say that again?")
}
