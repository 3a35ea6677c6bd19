//! Local text extraction for responses that are not valid JSON.
//!
//! Some OpenAI-compatible servers answer with truncated JSON, JSON wrapped
//! in log noise, or plain text.  Before reporting a parse failure, the
//! adapters try to pull the reply text out of the raw body.

/// Keys whose string value is taken as the reply text, in order of
/// preference.
const TEXT_KEYS: [&str; 3] = ["content", "text", "response"];

/// Best-effort reply text from a raw body, or `None` when nothing usable
/// is found.
pub fn extract_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    for key in TEXT_KEYS {
        if let Some(value) = string_field(trimmed, key).filter(|v| !v.trim().is_empty()) {
            return Some(value.trim().to_string());
        }
    }

    // Anything that does not look like structured data is taken verbatim.
    let looks_structured = trimmed.starts_with('{') || trimmed.starts_with('[');
    (!looks_structured).then(|| trimmed.to_string())
}

/// Value of the first `"key": "…"` pair in `raw`, with JSON escapes decoded.
/// Tolerates a missing closing quote (truncated body).
fn string_field(raw: &str, key: &str) -> Option<String> {
    let needle = format!("\"{key}\"");
    let mut search_from = 0;
    while let Some(found) = raw[search_from..].find(&needle) {
        let after_key = search_from + found + needle.len();
        search_from = after_key;

        let rest = raw[after_key..].trim_start();
        let Some(rest) = rest.strip_prefix(':') else {
            continue;
        };
        let Some(body) = rest.trim_start().strip_prefix('"') else {
            continue;
        };
        return Some(unescape_until_quote(body));
    }
    None
}

fn unescape_until_quote(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => break,
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => {}
                Some('u') => {
                    let code: String = chars.by_ref().take(4).collect();
                    if let Some(ch) = u32::from_str_radix(&code, 16).ok().and_then(char::from_u32) {
                        out.push(ch);
                    }
                }
                Some(other) => out.push(other),
                None => break,
            },
            other => out.push(other),
        }
    }
    out
}
