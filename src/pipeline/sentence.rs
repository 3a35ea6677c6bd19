//! Sentence segmentation of streamed generation output.
//!
//! Fragments arrive with arbitrary boundaries ("Hi", "! (pa", "use) How").
//! [`SentenceSegmenter`] buffers them and emits a sentence as soon as a
//! terminal punctuation run is followed by whitespace.  CJK terminals need
//! no trailing whitespace.  Punctuation inside `(…)`, `[…]` or `*…*` never
//! ends a sentence.  Those stage-direction groups are then removed by
//! [`strip_stage_directions`] before a sentence is emitted.

use bytes::Bytes;

// ---------------------------------------------------------------------------
// SentenceUnit
// ---------------------------------------------------------------------------

/// One sentence of a reply, from boundary detection to playback.
#[derive(Debug, Clone, PartialEq)]
pub struct SentenceUnit {
    pub seq: u64,
    pub text: String,
    /// `None` while synthesis is pending.
    pub audio: Option<Bytes>,
}

impl SentenceUnit {
    pub fn pending(seq: u64, text: impl Into<String>) -> Self {
        Self {
            seq,
            text: text.into(),
            audio: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.audio.is_some()
    }
}

// ---------------------------------------------------------------------------
// Stage directions
// ---------------------------------------------------------------------------

fn is_terminal(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '…') || is_cjk_terminal(c)
}

fn is_cjk_terminal(c: char) -> bool {
    matches!(c, '。' | '！' | '？')
}

fn is_closing_quote(c: char) -> bool {
    matches!(c, '"' | '\'' | '”' | '’' | '」' | '』')
}

/// Remove `(…)`, `[…]` and `*…*` groups and collapse whitespace.  An
/// unclosed group runs to the end of the text.
///
/// ```
/// use voice_relay::pipeline::strip_stage_directions;
///
/// assert_eq!(strip_stage_directions("(pause) How are you?"), "How are you?");
/// assert_eq!(strip_stage_directions("Well *sighs* okay [laughs]."), "Well okay.");
/// ```
pub fn strip_stage_directions(text: &str) -> String {
    let mut kept = String::with_capacity(text.len());
    let (mut paren, mut bracket, mut star) = (0usize, 0usize, false);
    for c in text.chars() {
        match c {
            '(' => paren += 1,
            ')' if paren > 0 => paren -= 1,
            '[' => bracket += 1,
            ']' if bracket > 0 => bracket -= 1,
            '*' => star = !star,
            _ if paren > 0 || bracket > 0 || star => {}
            _ => kept.push(c),
        }
    }

    // Collapse whitespace and close gaps left before punctuation.
    let mut out = String::with_capacity(kept.len());
    for word in kept.split_whitespace() {
        let attaches = word.starts_with(|c: char| is_terminal(c) || matches!(c, ',' | ';' | ':'));
        if !out.is_empty() && !attaches {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Byte offset just past the first sentence boundary in `text`, or `None`
/// when more input is needed to decide.
fn next_boundary(text: &str) -> Option<usize> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let (mut paren, mut bracket, mut star) = (0usize, 0usize, false);
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i].1;
        match c {
            '(' => paren += 1,
            ')' => paren = paren.saturating_sub(1),
            '[' => bracket += 1,
            ']' => bracket = bracket.saturating_sub(1),
            '*' => star = !star,
            c if is_terminal(c) && paren == 0 && bracket == 0 && !star => {
                let mut j = i + 1;
                while j < chars.len() && (is_terminal(chars[j].1) || is_closing_quote(chars[j].1)) {
                    j += 1;
                }
                let end = chars.get(j).map_or(text.len(), |&(b, _)| b);
                if is_cjk_terminal(c) {
                    return Some(end);
                }
                match chars.get(j) {
                    Some(&(_, next)) if next.is_whitespace() => return Some(end),
                    // "3.5", "e.g." mid-word: not a boundary.
                    Some(_) => {
                        i = j;
                        continue;
                    }
                    None => return None,
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

// ---------------------------------------------------------------------------
// SentenceSegmenter
// ---------------------------------------------------------------------------

/// Incremental sentence splitter with stage-direction removal.
#[derive(Debug, Clone)]
pub struct SentenceSegmenter {
    buffer: String,
    /// Filtered text too short to stand alone, merged into the next sentence.
    carry: String,
    min_chars: usize,
}

impl SentenceSegmenter {
    pub fn new(min_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            carry: String::new(),
            min_chars,
        }
    }

    /// Feed one fragment; returns every sentence completed by it.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);
        let mut sentences = Vec::new();
        while let Some(end) = next_boundary(&self.buffer) {
            let raw: String = self.buffer.drain(..end).collect();
            if let Some(sentence) = self.accept(&raw, false) {
                sentences.push(sentence);
            }
        }
        sentences
    }

    /// End of stream: flush whatever is left, regardless of length.
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buffer);
        self.accept(&raw, true)
    }

    fn accept(&mut self, raw: &str, flush: bool) -> Option<String> {
        let filtered = strip_stage_directions(raw);
        let candidate = match (self.carry.is_empty(), filtered.is_empty()) {
            (true, _) => filtered,
            (false, true) => std::mem::take(&mut self.carry),
            (false, false) => format!("{} {filtered}", std::mem::take(&mut self.carry)),
        };
        if candidate.is_empty() {
            return None;
        }
        if !flush && candidate.chars().count() < self.min_chars {
            self.carry = candidate;
            return None;
        }
        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(fragments: &[&str], min_chars: usize) -> Vec<String> {
        let mut seg = SentenceSegmenter::new(min_chars);
        let mut out: Vec<String> = fragments.iter().flat_map(|f| seg.push(f)).collect();
        out.extend(seg.finish());
        out
    }

    // ---- strip_stage_directions ---

    #[test]
    fn strips_all_group_kinds() {
        assert_eq!(strip_stage_directions("Hi! (pause)"), "Hi!");
        assert_eq!(strip_stage_directions("[whispers] Come here."), "Come here.");
        assert_eq!(strip_stage_directions("Oh *laughs*, sure."), "Oh, sure.");
        assert_eq!(strip_stage_directions("(clears throat)"), "");
    }

    #[test]
    fn unclosed_group_runs_to_end() {
        assert_eq!(strip_stage_directions("Okay. (trails off"), "Okay.");
    }

    // ---- SentenceSegmenter ---

    #[test]
    fn splits_streamed_reply_with_stage_direction() {
        let out = segment(&["Hi", "! (pa", "use) How are", " you?"], 2);
        assert_eq!(out, vec!["Hi!", "How are you?"]);
    }

    #[test]
    fn emits_sentence_as_soon_as_boundary_is_seen() {
        let mut seg = SentenceSegmenter::new(2);
        assert!(seg.push("Hello there.").is_empty(), "needs lookahead");
        assert_eq!(seg.push(" Next"), vec!["Hello there."]);
        assert_eq!(seg.finish().as_deref(), Some("Next"));
    }

    #[test]
    fn decimals_and_punctuation_runs() {
        let out = segment(&["Pi is 3.14. Really?! Yes."], 2);
        assert_eq!(out, vec!["Pi is 3.14.", "Really?!", "Yes."]);
    }

    #[test]
    fn punctuation_inside_directions_is_not_a_boundary() {
        let out = segment(&["Sure (thinks. hard) thing. Done."], 2);
        assert_eq!(out, vec!["Sure thing.", "Done."]);
    }

    #[test]
    fn cjk_terminals_need_no_space() {
        let out = segment(&["你好。今天好吗？"], 1);
        assert_eq!(out, vec!["你好。", "今天好吗？"]);
    }

    #[test]
    fn short_fragments_merge_into_next_sentence() {
        let out = segment(&["Oh. I see. Fine."], 4);
        assert_eq!(out, vec!["Oh. I see.", "Fine."]);
    }

    #[test]
    fn directions_only_reply_yields_nothing() {
        assert!(segment(&["(pause) [sighs]"], 2).is_empty());
    }

    #[test]
    fn closing_quote_stays_with_sentence() {
        let out = segment(&["He said \"go.\" Then left."], 2);
        assert_eq!(out, vec!["He said \"go.\"", "Then left."]);
    }

    #[test]
    fn sentence_unit_readiness() {
        let mut unit = SentenceUnit::pending(1, "Hi!");
        assert!(!unit.is_ready());
        unit.audio = Some(Bytes::from_static(b"pcm"));
        assert!(unit.is_ready());
    }
}
