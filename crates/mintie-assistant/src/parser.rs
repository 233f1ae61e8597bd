//! Normalizes raw assistant response bodies into `{content, sources}`.
//!
//! The upstream API answers in one of two shapes: a single JSON document, or
//! a line-oriented pseudo-streaming protocol (`f:{"messageId":...}` frame
//! markers, `<n>:[...]` event records, `0:"..."` plain-text fallbacks).
//! Frame markers delimit generation blocks; only the last block is
//! authoritative, and a `tool-result` record inside it discards the narrative
//! that preceded the tool call. Parsing never fails: malformed payloads
//! degrade to best-effort text, and only a recognized-but-empty stream maps
//! to the apology string.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::{DocsLink, ParsedAnswer};

/// Documentation base used when a workspace has no configured docs URL.
pub const DEFAULT_DOCS_BASE_URL: &str = "https://mintlify.com/docs/";

/// Shown when no answer text could be extracted from a recognized payload.
pub const EMPTY_ANSWER_APOLOGY: &str = "Sorry, I couldn't process the response properly.";

const FRAME_MARKER_PREFIX: &str = "f:{\"messageId\":";

/// Decodes `raw` into a normalized answer, resolving relative documentation
/// links against `docs_base_url` (or the default base when `None`).
pub fn parse_assistant_response(raw: &str, docs_base_url: Option<&str>) -> ParsedAnswer {
    let base_url = docs_base_url
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_DOCS_BASE_URL);

    let mut recognized_stream = false;
    let (mut content, sources) = match decode_structured_document(raw) {
        Some(decoded) => decoded,
        None => {
            let decoded = decode_line_protocol(raw);
            recognized_stream = decoded.recognized;
            (decoded.content, decoded.sources)
        }
    };

    // Last resort: show the raw payload rather than silence. A recognized
    // stream that legitimately carried no text (tool-result with nothing
    // after it, sources-only block) skips this and lands on the apology.
    if content.trim().is_empty() && !recognized_stream {
        content = raw.to_string();
    }

    let cleaned = resolve_relative_links(&clean_answer_text(&content), base_url);
    ParsedAnswer {
        content: if cleaned.is_empty() {
            EMPTY_ANSWER_APOLOGY.to_string()
        } else {
            cleaned
        },
        sources,
    }
}

/// Resolves a citation link the way the parser resolves in-text links:
/// Slack hyperlink tokens and `/`-rooted paths join the docs base, absolute
/// URLs pass through.
pub fn resolve_docs_link(link: &str, docs_base_url: &str) -> String {
    if link.starts_with("</") && link.contains('|') && link.ends_with('>') {
        let inner = &link[1..link.len() - 1];
        if let Some((path, _label)) = inner.split_once('|') {
            return join_docs_url(docs_base_url, path);
        }
    }
    if link.starts_with("http") {
        return link.to_string();
    }
    join_docs_url(docs_base_url, link)
}

fn join_docs_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn decode_structured_document(raw: &str) -> Option<(String, Vec<DocsLink>)> {
    let document: Value = serde_json::from_str(raw).ok()?;
    match document {
        Value::String(text) => Some((text, Vec::new())),
        Value::Object(fields) => {
            let text = fields
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| fields.get("content").and_then(Value::as_str))
                .map(str::to_string);
            let sources = match fields.get("sources") {
                Some(Value::Array(items)) => Some(decode_sources(items)),
                _ => None,
            };
            if text.is_none() && sources.is_none() {
                return None;
            }
            Some((text.unwrap_or_default(), sources.unwrap_or_default()))
        }
        _ => None,
    }
}

enum StreamRecord {
    FrameMarker,
    TextDelta(String),
    Sources(Vec<DocsLink>),
    ToolResult,
    PlainText(String),
    Unrecognized,
}

struct LineDecode {
    content: String,
    sources: Vec<DocsLink>,
    recognized: bool,
}

fn decode_line_protocol(raw: &str) -> LineDecode {
    let mut blocks: Vec<Vec<StreamRecord>> = Vec::new();
    let mut current: Vec<StreamRecord> = Vec::new();
    let mut recognized = false;

    for line in raw.lines().filter(|line| !line.trim().is_empty()) {
        let record = classify_stream_line(line);
        if !matches!(record, StreamRecord::Unrecognized) {
            recognized = true;
        }
        if matches!(record, StreamRecord::FrameMarker) && !current.is_empty() {
            blocks.push(std::mem::take(&mut current));
        }
        current.push(record);
    }
    if !current.is_empty() {
        blocks.push(current);
    }

    let Some(final_block) = blocks.pop() else {
        return LineDecode {
            content: String::new(),
            sources: Vec::new(),
            recognized,
        };
    };

    // A tool call discards the narrative generated before it; only fragments
    // after the last tool-result record contribute to the message.
    let boundary = final_block
        .iter()
        .rposition(|record| matches!(record, StreamRecord::ToolResult));

    let mut content = String::new();
    let mut sources = Vec::new();
    let mut plain_fallback = String::new();
    for (index, record) in final_block.into_iter().enumerate() {
        match record {
            StreamRecord::TextDelta(fragment) => {
                if boundary.map_or(true, |b| index > b) {
                    content.push_str(&fragment);
                }
            }
            StreamRecord::Sources(list) => sources = list,
            StreamRecord::PlainText(text) => plain_fallback.push_str(&text),
            StreamRecord::FrameMarker | StreamRecord::ToolResult | StreamRecord::Unrecognized => {}
        }
    }
    if content.is_empty() {
        content = plain_fallback;
    }

    LineDecode {
        content,
        sources,
        recognized,
    }
}

fn classify_stream_line(line: &str) -> StreamRecord {
    if line.starts_with(FRAME_MARKER_PREFIX) {
        return StreamRecord::FrameMarker;
    }
    if let Some(payload) = indexed_record_payload(line) {
        return decode_indexed_record(payload);
    }
    if let Some(text) = decode_plain_text_record(line) {
        return StreamRecord::PlainText(text);
    }
    StreamRecord::Unrecognized
}

/// Extracts the `...` from an `<n>:[...]` record line.
fn indexed_record_payload(line: &str) -> Option<&str> {
    let (index, rest) = line.split_once(':')?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let inner = rest.strip_prefix('[')?.strip_suffix(']')?;
    if inner.is_empty() {
        return None;
    }
    Some(inner)
}

fn decode_indexed_record(payload: &str) -> StreamRecord {
    // The array's sole element is usually a JSON-encoded string wrapping the
    // event object; it may also be the object itself.
    let event_json = if payload.len() >= 2 && payload.starts_with('"') && payload.ends_with('"') {
        unescape_embedded_json(&payload[1..payload.len() - 1])
    } else {
        payload.to_string()
    };

    let event: Value = match serde_json::from_str(&event_json) {
        Ok(value) => value,
        Err(error) => {
            tracing::debug!("skipping undecodable stream record: {error}");
            return StreamRecord::Unrecognized;
        }
    };

    match event.get("type").and_then(Value::as_str) {
        Some("text-delta") => match event.get("textDelta").and_then(Value::as_str) {
            Some(fragment) if !fragment.is_empty() => StreamRecord::TextDelta(fragment.to_string()),
            _ => StreamRecord::Unrecognized,
        },
        Some("sources") => match event.get("sources") {
            Some(Value::Array(items)) => StreamRecord::Sources(decode_sources(items)),
            _ => StreamRecord::Unrecognized,
        },
        Some("tool-result") => StreamRecord::ToolResult,
        _ => StreamRecord::Unrecognized,
    }
}

/// Reverses the one level of escaping applied when the event object is
/// embedded as a JSON string inside the record array.
fn unescape_embedded_json(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(ch);
        }
    }
    out
}

fn decode_sources(items: &[Value]) -> Vec<DocsLink> {
    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<DocsLink>(item.clone()) {
            Ok(link) => Some(link),
            Err(error) => {
                tracing::debug!("skipping undecodable source entry: {error}");
                None
            }
        })
        .collect()
}

/// Decodes a `0:"..."` plain-text fallback line.
fn decode_plain_text_record(line: &str) -> Option<String> {
    let rest = line.strip_prefix("0:\"")?;
    let end = rest.rfind('"')?;
    let inner = &rest[..end];
    match serde_json::from_str::<String>(&format!("\"{inner}\"")) {
        Ok(text) => Some(text),
        Err(_) => Some(inner.to_string()),
    }
}

fn clean_answer_text(text: &str) -> String {
    let unescaped = text.trim().replace("\\n", "\n").replace("\\t", " ");
    let fenced = collapse_tilde_runs(&convert_tilde_fence_lines(&unescaped));
    strip_links_inside_fences(&fenced)
}

/// Rewrites lines opening with `~~~` to backtick fences, keeping a bare
/// language tag when one follows the fence.
fn convert_tilde_fence_lines(text: &str) -> String {
    text.split('\n')
        .map(|line| {
            let Some(rest) = line.strip_prefix("~~~") else {
                return line.to_string();
            };
            let rest = rest.trim_start_matches('~');
            let tag = rest.trim();
            if tag.is_empty() {
                "```".to_string()
            } else if tag.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
                format!("```{tag}")
            } else {
                format!("```{rest}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collapses any remaining run of three or more tildes to a backtick fence.
fn collapse_tilde_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '~' {
            out.push(ch);
            continue;
        }
        let mut run = 1_usize;
        while chars.peek() == Some(&'~') {
            chars.next();
            run += 1;
        }
        if run >= 3 {
            out.push_str("```");
        } else {
            for _ in 0..run {
                out.push('~');
            }
        }
    }
    out
}

fn fenced_link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"```([^`]*)\[([^\]]+)\]\(([^)]+)\)([^`]*)```").expect("valid fence pattern")
    })
}

/// Code blocks must never carry unrendered link markup; each pass collapses
/// one `[text](url)` inside a fence to its visible text.
fn strip_links_inside_fences(text: &str) -> String {
    let pattern = fenced_link_pattern();
    let mut current = text.to_string();
    for _ in 0..64 {
        if !pattern.is_match(&current) {
            break;
        }
        current = pattern
            .replace(&current, "```${1}${2}${4}```")
            .into_owned();
    }
    current
}

fn rooted_link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[([^\]]+)\]\(/([^)]+)\)").expect("valid link pattern"))
}

fn reversed_rooted_link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\(([^)]+)\)\[/([^\]]+)\]").expect("valid link pattern"))
}

fn reversed_link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\(([^)]+)\)\[([^\]]+)\]").expect("valid link pattern"))
}

/// Rewrites relative documentation links, including the reversed
/// `(text)[path]` author-error variants, to absolute URLs.
fn resolve_relative_links(text: &str, docs_base_url: &str) -> String {
    let resolve = |caps: &Captures| {
        format!(
            "[{}]({})",
            &caps[1],
            join_docs_url(docs_base_url, &caps[2])
        )
    };
    let pass_one = rooted_link_pattern().replace_all(text, resolve);
    let pass_two = reversed_rooted_link_pattern().replace_all(&pass_one, resolve);
    reversed_link_pattern()
        .replace_all(&pass_two, resolve)
        .into_owned()
}
