//! Incremental Server-Sent Events decoder for streamed chat completions.
//!
//! Chunks arrive with arbitrary boundaries; the decoder buffers bytes until a
//! full line is available and yields the `data:` payloads.  Comments, blank
//! lines and other fields are skipped.

use bytes::BytesMut;

/// Payload of one `data:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    /// The `[DONE]` end-of-stream marker.
    Done,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Feed one network chunk and collect every complete event in it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            // Invalid UTF-8 lines are dropped.
            if let Some(event) = std::str::from_utf8(&line).ok().and_then(parse_line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line that had no newline.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = self.buffer.split();
        std::str::from_utf8(&rest).ok().and_then(parse_line)
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }
    let data = trimmed
        .strip_prefix("data:")
        .map(str::trim)
        .filter(|d| !d.is_empty())?;
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    Some(SseEvent::Data(data.to_string()))
}

/// Text delta of one streamed chat-completion chunk, if any.
pub fn delta_content(data: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(data).ok()?;
    json["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_split_across_chunks_are_reassembled() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"data: {\"a\"").is_empty());
        let events = dec.push(b":1}\n\ndata: [DONE]\n");
        assert_eq!(
            events,
            vec![SseEvent::Data("{\"a\":1}".into()), SseEvent::Done]
        );
    }

    #[test]
    fn comments_blank_lines_and_crlf_are_handled() {
        let mut dec = SseDecoder::new();
        let events = dec.push(b": keep-alive\r\n\r\nevent: x\r\ndata:hi\r\n");
        assert_eq!(events, vec![SseEvent::Data("hi".into())]);
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"data: tail").is_empty());
        assert_eq!(dec.finish(), Some(SseEvent::Data("tail".into())));
        assert_eq!(dec.finish(), None);
    }

    #[test]
    fn delta_content_reads_openai_chunks() {
        let chunk = r#"{"choices":[{"delta":{"content":"Hi!"}}]}"#;
        assert_eq!(delta_content(chunk).as_deref(), Some("Hi!"));
        assert_eq!(delta_content(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#), None);
        assert_eq!(delta_content("not json"), None);
    }
}
