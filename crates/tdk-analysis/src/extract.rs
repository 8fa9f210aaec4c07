//! Transcript text extraction.
//!
//! Transcript pages arrive as UTF-8 plain text or HTML. Extraction is
//! deliberately minimal: strict UTF-8 (a decode failure is a permanent
//! error, not a retry), tag stripping with script/style suppression, a small
//! entity table, and whitespace collapsing. Anything fancier (PDF) is an
//! external renderer's job.

use std::fmt;

#[derive(Debug)]
pub enum ExtractError {
    /// Bytes are not valid UTF-8 — permanent.
    Decode(String),
    /// Extraction produced no usable text — permanent.
    Empty,
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::Decode(msg) => write!(f, "transcript decode failed: {msg}"),
            ExtractError::Empty => write!(f, "transcript extraction produced no text"),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Extract plain text from raw transcript bytes.
pub fn extract_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let raw = std::str::from_utf8(bytes).map_err(|e| ExtractError::Decode(e.to_string()))?;

    let trimmed = raw.trim_start();
    let text = if trimmed.starts_with('<') {
        strip_html(raw)
    } else {
        collapse_whitespace(raw)
    };

    if text.trim().is_empty() {
        return Err(ExtractError::Empty);
    }
    Ok(text)
}

/// Remove tags, drop script/style bodies, decode common entities.
fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut chars = html.char_indices().peekable();
    let mut suppressed_until: Option<&str> = None;

    while let Some((idx, c)) = chars.next() {
        if c == '<' {
            let rest = &html[idx..];
            let close = match rest.find('>') {
                Some(p) => p,
                None => break,
            };
            let tag = rest[1..close].trim();
            let tag_name = tag
                .trim_start_matches('/')
                .split(|ch: char| ch.is_whitespace() || ch == '>')
                .next()
                .unwrap_or("")
                .to_ascii_lowercase();

            match suppressed_until {
                Some(end) if tag.starts_with('/') && tag_name == end => {
                    suppressed_until = None;
                }
                None if tag_name == "script" || tag_name == "style" => {
                    suppressed_until = Some(if tag_name == "script" { "script" } else { "style" });
                }
                _ => {}
            }

            // Block-level boundaries become line breaks so speaker turns
            // survive the strip.
            if suppressed_until.is_none()
                && matches!(tag_name.as_str(), "p" | "div" | "br" | "li" | "tr" | "h1" | "h2" | "h3")
            {
                out.push('\n');
            }

            // Skip to the closing '>'.
            while let Some(&(j, _)) = chars.peek() {
                if j > idx + close {
                    break;
                }
                chars.next();
            }
            continue;
        }

        if suppressed_until.is_none() {
            out.push(c);
        }
    }

    collapse_whitespace(&decode_entities(&out))
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

/// Collapse runs of blank space while keeping paragraph breaks.
fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for line in s.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            if !out.ends_with("\n\n") && !out.is_empty() {
                out.push('\n');
            }
            continue;
        }
        out.push_str(&line);
        out.push('\n');
    }
    out.trim().to_string()
}
