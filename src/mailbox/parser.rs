//! Raw RFC 822 → [`ExternalMessage`]: text extraction, normalization and
//! segmentation. Pure functions, no I/O.

use std::sync::LazyLock;

use mail_parser::{MessageParser, MimeHeaders, PartType};
use regex::Regex;

use super::ExternalMessage;
use crate::error::MailboxError;

static SCRIPT_STYLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)\s*>").unwrap());
static LINE_BREAK_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</(p|div|tr|li|h[1-6]|blockquote|table)\s*>").unwrap()
});
static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" +").unwrap());
static NEWLINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?: *\n *)+").unwrap());
static TABS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\t+").unwrap());

/// An attachment as found in the MIME tree, not yet on disk.
#[derive(Debug, Clone)]
pub struct RawAttachment {
    pub name: String,
    pub contents: Vec<u8>,
}

/// Result of parsing; `message.attachments` is empty until the raw
/// attachments are written to a cache.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub message: ExternalMessage,
    pub attachments: Vec<RawAttachment>,
}

/// Parse a raw message into headers, normalized text segments and
/// attachments.
pub fn parse_message(id: u32, raw: &[u8], segment_size: usize) -> Result<ParsedMessage, MailboxError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or(MailboxError::Parse { id })?;

    let from = parsed.from().and_then(|addr| addr.first());
    let sender_address = from
        .and_then(|a| a.address())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let sender_name = from
        .and_then(|a| a.name())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let subject = parsed
        .subject()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let date = parsed
        .date()
        .and_then(|d| chrono::DateTime::from_timestamp(d.to_timestamp(), 0));

    let segments = extract_text(&parsed)
        .map(|text| split_segments(&normalize_text(&text), segment_size))
        .unwrap_or_default();

    let attachments = parsed
        .attachments()
        .enumerate()
        .map(|(i, part)| RawAttachment {
            name: part
                .attachment_name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("attachment-{}", i + 1)),
            contents: part.contents().to_vec(),
        })
        .collect();

    Ok(ParsedMessage {
        message: ExternalMessage {
            id,
            sender_name,
            sender_address,
            subject,
            date,
            segments,
            attachments: Vec::new(),
        },
        attachments,
    })
}

/// Readable text of a message. The HTML part wins over the plain-text
/// part when both exist.
fn extract_text(parsed: &mail_parser::Message) -> Option<String> {
    if let Some(part) = parsed.html_part(0)
        && let PartType::Html(html) = &part.body
    {
        let text = html_to_text(html);
        if !text.trim().is_empty() {
            return Some(text);
        }
    }
    parsed
        .body_text(0)
        .map(|t| t.into_owned())
        .filter(|t| !t.trim().is_empty())
}

/// Strip markup from an HTML body, keeping block boundaries as newlines.
pub fn html_to_text(html: &str) -> String {
    let text = SCRIPT_STYLE.replace_all(html, "");
    let text = LINE_BREAK_TAG.replace_all(&text, "\n");
    let text = ANY_TAG.replace_all(&text, "");
    decode_entities(&text)
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Collapse whitespace runs: spaces to one space, newlines (with the
/// spaces around them) to one newline, tabs to two spaces. Angle
/// brackets and non-breaking spaces are dropped.
pub fn normalize_text(text: &str) -> String {
    let text: String = text
        .replace("\r\n", "\n")
        .chars()
        .filter_map(|c| match c {
            '<' | '>' => None,
            '\u{a0}' => Some(' '),
            '\r' => Some('\n'),
            c => Some(c),
        })
        .collect();
    let text = SPACES.replace_all(&text, " ");
    let text = NEWLINES.replace_all(&text, "\n");
    let text = TABS.replace_all(&text, "  ");
    text.trim().to_string()
}

/// Cut text into segments of at most `size` characters. Empty text
/// gives no segments.
pub fn split_segments(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}
