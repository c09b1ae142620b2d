//! Field maps: dotted-path descriptions of custom (non-OpenAI) APIs.
//!
//! A field map tells the stream parser and the payload builder where to
//! find things inside arbitrary JSON: which path carries generated text,
//! which carries reasoning text, where the prompt should be written into
//! the request template, and how stream records are framed.

use serde_json::Map;

use crate::prelude::*;

/// Dotted-path configuration for parsing a custom API.
///
/// All fields are strings; an empty string means "not configured". The
/// framing fields have the SSE-compatible defaults, so an empty mapping
/// parses OpenAI-style streams out of the box.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct FieldMapping {
    /// Prefix stripped from every stream record before parsing.
    pub stream_prefix: String,

    /// Format of the record payload. Only `"json"` triggers JSON parsing.
    pub data_format: String,

    /// Sentinel record (after prefix stripping) that terminates the stream.
    pub stop_flag: String,

    /// Alternative prefix stripped from the final record, when the API
    /// frames its terminator differently from its data records.
    pub end_prefix: String,

    /// Dotted path whose value equals [`stop_flag`](Self::stop_flag) on the
    /// final record, for APIs that signal the end in-band.
    pub end_field: String,

    /// Dotted path of the generated text inside one record.
    pub content: String,

    /// Dotted path of the reasoning text inside one record.
    pub reasoning_content: String,

    /// Dotted path in the *request* template where the prompt is written.
    pub prompt: String,

    /// Dotted path of the token-usage object inside a record.
    pub usage: String,
}

impl Default for FieldMapping {
    fn default() -> Self {
        FieldMapping {
            stream_prefix: "data:".to_owned(),
            data_format: "json".to_owned(),
            stop_flag: "[DONE]".to_owned(),
            end_prefix: String::new(),
            end_field: String::new(),
            content: String::new(),
            reasoning_content: String::new(),
            prompt: String::new(),
            usage: String::new(),
        }
    }
}

impl FieldMapping {
    /// Parse a field mapping from its JSON text form. An empty or
    /// whitespace-only string yields the default mapping.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
            .with_context(|| format!("invalid field mapping: {raw:?}"))
    }

    /// The mapping used for OpenAI `/chat/completions` streams.
    pub fn chat_completions() -> Self {
        FieldMapping {
            content: "choices.0.delta.content".to_owned(),
            reasoning_content: "choices.0.delta.reasoning_content".to_owned(),
            usage: "usage".to_owned(),
            ..Self::default()
        }
    }

    /// Fill unset extraction paths with the OpenAI defaults. Framing
    /// fields keep whatever the caller configured.
    pub fn with_chat_completions_defaults(mut self) -> Self {
        let defaults = Self::chat_completions();
        if self.content.is_empty() {
            self.content = defaults.content;
        }
        if self.reasoning_content.is_empty() {
            self.reasoning_content = defaults.reasoning_content;
        }
        if self.usage.is_empty() {
            self.usage = defaults.usage;
        }
        self
    }

    /// `Some(path)` if the given field is configured.
    pub fn opt(field: &str) -> Option<&str> {
        if field.is_empty() { None } else { Some(field) }
    }
}

/// Resolve a list index segment, allowing negative indices that are
/// already in range.
fn normalize_index(segment: &str, len: usize) -> Option<usize> {
    let idx: i64 = segment.parse().ok()?;
    let idx = if idx < 0 { len as i64 + idx } else { idx };
    if idx >= 0 && (idx as usize) < len {
        Some(idx as usize)
    } else {
        None
    }
}

/// Read the value at a dotted path.
///
/// Integer segments index lists; other segments read object keys. When the
/// current value is a list but the segment is not an integer, we descend
/// into element 0 and retry the same segment, for compatibility with APIs
/// whose single-choice responses are written without the index.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    let mut current = value;
    for segment in path.split('.') {
        loop {
            match current {
                Value::Array(items) => {
                    if segment.parse::<i64>().is_ok() {
                        let idx = normalize_index(segment, items.len())?;
                        current = &items[idx];
                        break;
                    }
                    current = items.first()?;
                }
                Value::Object(map) => {
                    current = map.get(segment)?;
                    break;
                }
                _ => return None,
            }
        }
    }
    Some(current)
}

/// Read the value at a dotted path as text. Missing segments, nulls and
/// non-string scalars degrade gracefully: missing and null yield `""`.
pub fn get_path_string(value: &Value, path: &str) -> String {
    match get_path(value, path) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

/// Write `new_value` at a dotted path, returning whether the write landed.
///
/// Missing object keys are created along the way; list indices must
/// already be in range (negative indices count from the end). A list met
/// where a key segment was expected descends into element 0, mirroring
/// [`get_path`].
pub fn set_path(value: &mut Value, path: &str, new_value: Value) -> bool {
    if path.is_empty() {
        return false;
    }
    let segments: Vec<&str> = path.split('.').collect();
    set_path_inner(value, &segments, new_value)
}

fn set_path_inner(current: &mut Value, segments: &[&str], new_value: Value) -> bool {
    let Some((segment, rest)) = segments.split_first() else {
        return false;
    };
    match current {
        Value::Array(items) => {
            if segment.parse::<i64>().is_ok() {
                let Some(idx) = normalize_index(segment, items.len()) else {
                    return false;
                };
                if rest.is_empty() {
                    items[idx] = new_value;
                    true
                } else {
                    set_path_inner(&mut items[idx], rest, new_value)
                }
            } else {
                // Retry the same segment inside element 0.
                let Some(first) = items.first_mut() else {
                    return false;
                };
                set_path_inner(first, segments, new_value)
            }
        }
        Value::Object(map) => {
            if rest.is_empty() {
                map.insert((*segment).to_owned(), new_value);
                true
            } else {
                let child = map
                    .entry((*segment).to_owned())
                    .or_insert_with(|| Value::Object(Map::new()));
                set_path_inner(child, rest, new_value)
            }
        }
        _ => false,
    }
}
