//! Tolerant response parser
//!
//! Models are asked for comma-separated tags but answer in every shape:
//! bullet lists, numbered lists, JSON, `Tags:` labels, code fences, reasoning
//! blocks, trailing confidences. The parser never fails; it returns the tags
//! it could recognise, and an empty list marks the response unparseable.

use once_cell::sync::Lazy;

/// Longest accepted tag, in words
const MAX_TAG_WORDS: usize = 6;
/// Longest accepted tag, in characters
const MAX_TAG_CHARS: usize = 64;

/// Leading labels models put before the list
static LABELS: Lazy<Vec<&'static str>> =
    Lazy::new(|| vec!["tags", "keywords", "output", "answer", "contextual tags"]);

/// One recognised tag with an optional model-reported confidence
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTag {
    pub text: String,
    pub confidence: Option<f32>,
}

/// Parse raw model output into tags (possibly empty)
pub fn parse_tags(raw: &str) -> Vec<ParsedTag> {
    let text = strip_reasoning(raw);
    let text = strip_code_fences(&text);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if let Some(tags) = parse_json(trimmed) {
        return tags;
    }

    let mut tags: Vec<ParsedTag> = Vec::new();
    for line in trimmed.lines() {
        let line = strip_label(strip_list_marker(line.trim()));
        for piece in line.split([',', ';', '|']) {
            if let Some(tag) = clean_piece(piece) {
                if !tags.iter().any(|t| t.text.eq_ignore_ascii_case(&tag.text)) {
                    tags.push(tag);
                }
            }
        }
    }
    tags
}

/// Drop `<think>...</think>` blocks (an unclosed block swallows the rest)
fn strip_reasoning(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

fn strip_code_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Accept `["a","b"]` or `{"tags":["a","b"]}`
fn parse_json(text: &str) -> Option<Vec<ParsedTag>> {
    if !(text.starts_with('[') || text.starts_with('{')) {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let items = match &value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(map) => map
            .get("tags")
            .or_else(|| map.get("keywords"))?
            .as_array()?,
        _ => return None,
    };

    let mut tags = Vec::new();
    for item in items {
        let parsed = match item {
            serde_json::Value::String(s) => clean_piece(s),
            serde_json::Value::Object(obj) => {
                let name = obj
                    .get("tag")
                    .or_else(|| obj.get("name"))
                    .and_then(|v| v.as_str());
                let confidence = obj
                    .get("confidence")
                    .or_else(|| obj.get("weight"))
                    .and_then(|v| v.as_f64())
                    .map(|c| c as f32);
                name.and_then(clean_piece).map(|mut tag| {
                    tag.confidence = confidence.or(tag.confidence);
                    tag
                })
            }
            _ => None,
        };
        tags.extend(parsed);
    }
    Some(tags)
}

/// Remove `-`, `*`, `•`, `1.`, `2)` list markers
fn strip_list_marker(line: &str) -> &str {
    let line = line.trim_start_matches(['-', '*', '•', '·']).trim_start();
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let after = &line[digits..];
        // "3.5mm lens" is a tag, "3. lens" is a list item
        if let Some(rest) = after.strip_prefix('.').or_else(|| after.strip_prefix(')')) {
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                return rest.trim_start();
            }
        }
    }
    line
}

/// Remove a leading `Tags:` style label
fn strip_label(line: &str) -> &str {
    if let Some((head, tail)) = line.split_once(':') {
        let head = head.trim().trim_matches('*').trim().to_lowercase();
        if LABELS.iter().any(|label| *label == head) {
            return tail.trim();
        }
    }
    line
}

/// Clean one comma-separated piece; `None` when it isn't a plausible tag
fn clean_piece(piece: &str) -> Option<ParsedTag> {
    let mut text = piece.trim();
    let mut confidence = None;

    // Trailing "(0.85)" or "(85%)"
    if let Some(open) = text.rfind('(') {
        if let Some(inner) = text[open + 1..].strip_suffix(')') {
            let inner = inner.trim();
            let value = match inner.strip_suffix('%') {
                Some(pct) => pct.trim().parse::<f32>().ok().map(|v| v / 100.0),
                None => inner.parse::<f32>().ok(),
            };
            if let Some(value) = value.filter(|v| v.is_finite()) {
                confidence = Some(value.clamp(0.0, 1.0));
                text = text[..open].trim();
            }
        }
    }

    let text = text
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '*' || c == '.')
        .trim();

    if text.is_empty()
        || text.chars().count() > MAX_TAG_CHARS
        || text.split_whitespace().count() > MAX_TAG_WORDS
        || !text.chars().any(char::is_alphanumeric)
    {
        return None;
    }

    Some(ParsedTag {
        text: text.to_string(),
        confidence,
    })
}
