//! The streaming-response state machine.
//!
//! Incoming bytes are framed into records (the segments between two
//! `\n\n`), each record runs through a per-request state machine that
//! strips prefixes, watches for the stop sentinel, extracts content and
//! reasoning text through the field map, and emits fine-grained timing
//! events as the first tokens of each phase arrive.

use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt as _};

use crate::{
    errors::RequestError,
    fieldmap::{self, FieldMapping},
    metrics::{
        MetricSink, TIME_TO_FIRST_OUTPUT_TOKEN, TIME_TO_FIRST_REASONING_TOKEN,
        TIME_TO_REASONING_COMPLETION,
    },
    prelude::*,
};

/// Token usage as reported by the server. Field names vary between
/// providers, so both `*_tokens` and `*_token_count` spellings are read.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct UsageTokens {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl UsageTokens {
    /// Read usage counts out of a JSON value, if it looks like a usage map.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let read = |primary: &str, alternate: &str| -> Option<u64> {
            map.get(primary)
                .or_else(|| map.get(alternate))
                .and_then(Value::as_u64)
        };
        let usage = UsageTokens {
            prompt_tokens: read("prompt_tokens", "prompt_token_count"),
            completion_tokens: read("completion_tokens", "completion_token_count"),
            total_tokens: read("total_tokens", "total_token_count"),
        };
        if usage.prompt_tokens.is_none()
            && usage.completion_tokens.is_none()
            && usage.total_tokens.is_none()
        {
            return None;
        }
        Some(usage)
    }

    /// Usage is authoritative when both completion and total counts are
    /// present and non-zero; token counting is then skipped entirely.
    pub fn is_authoritative(&self) -> bool {
        self.completion_tokens.is_some_and(|n| n != 0)
            && self.total_tokens.is_some_and(|n| n != 0)
    }
}

/// Per-request accumulator, live for exactly one request.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    pub first_output_token_seen: bool,
    pub first_output_token_time: Option<Instant>,
    pub first_reasoning_token_seen: bool,
    pub first_reasoning_token_time: Option<Instant>,
    pub reasoning_active: bool,
    pub reasoning_ended: bool,
    pub content: String,
    pub reasoning_content: String,
    pub usage: Option<UsageTokens>,
    /// Set once an authoritative usage record arrived; content buffers stop
    /// accumulating from that point on.
    pub usage_extracted: bool,
}

/// What to do after one record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    Continue,
    StreamEnd,
}

/// Frames a byte stream into records separated by blank lines.
pub struct RecordStream<S> {
    inner: S,
    buffer: BytesMut,
    source_done: bool,
}

impl<S> RecordStream<S>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    pub fn new(inner: S) -> Self {
        RecordStream {
            inner,
            buffer: BytesMut::new(),
            source_done: false,
        }
    }

    /// Yield the next record, or `None` once the underlying stream closed
    /// and the buffer drained.
    pub async fn next_record(&mut self) -> Option<Result<Vec<u8>, RequestError>> {
        loop {
            if let Some(record) = self.extract_record() {
                return Some(Ok(record));
            }
            if self.source_done {
                return self.flush_tail().map(Ok);
            }
            match self.inner.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => return Some(Err(err.into())),
                None => self.source_done = true,
            }
        }
    }

    /// Split off the first complete `\n\n`-terminated record.
    fn extract_record(&mut self) -> Option<Vec<u8>> {
        let boundary = self
            .buffer
            .windows(2)
            .position(|window| window == b"\n\n")?;
        let mut record = self.buffer.split_to(boundary + 2);
        record.truncate(boundary);
        Some(trim_record(&record))
    }

    /// The final record may end with the stream instead of a blank line.
    fn flush_tail(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }
        let len = self.buffer.len();
        let tail = trim_record(&self.buffer.split_to(len));
        if tail.is_empty() { None } else { Some(tail) }
    }
}

fn trim_record(raw: &[u8]) -> Vec<u8> {
    let mut slice = raw;
    while slice.first() == Some(&b'\n') || slice.first() == Some(&b'\r') {
        slice = &slice[1..];
    }
    while slice.last() == Some(&b'\n') || slice.last() == Some(&b'\r') {
        slice = &slice[..slice.len() - 1];
    }
    slice.to_vec()
}

/// The per-request state machine over framed records.
pub struct StreamParser<'a> {
    mapping: &'a FieldMapping,
    sink: &'a MetricSink,
    start: Instant,
}

impl<'a> StreamParser<'a> {
    /// `start` is the instant the request was issued; timing events are
    /// milliseconds measured from it.
    pub fn new(mapping: &'a FieldMapping, sink: &'a MetricSink, start: Instant) -> Self {
        StreamParser {
            mapping,
            sink,
            start,
        }
    }

    /// Run one record through the machine, updating `metrics`.
    pub fn process_record(
        &self,
        record: &[u8],
        metrics: &mut StreamMetrics,
    ) -> Result<RecordOutcome, RequestError> {
        let text = String::from_utf8_lossy(record);
        let processed = self.strip_prefixes(&text);
        if processed.is_empty() {
            return Ok(RecordOutcome::Continue);
        }
        if processed == self.mapping.stop_flag {
            return Ok(RecordOutcome::StreamEnd);
        }

        if self.mapping.data_format != "json" {
            // Raw-text streams: every record is a content chunk; the stream
            // only ends when the connection closes.
            self.note_content_chunk(&processed, metrics);
            return Ok(RecordOutcome::Continue);
        }

        let parsed: Value = serde_json::from_str(&processed).map_err(|err| {
            RequestError::StreamFormat(format!(
                "unparseable record {processed:?}: {err}"
            ))
        })?;

        if let Some(end_field) = FieldMapping::opt(&self.mapping.end_field) {
            if fieldmap::get_path_string(&parsed, end_field) == self.mapping.stop_flag {
                return Ok(RecordOutcome::StreamEnd);
            }
        }

        if let Some(reason) = response_error(&parsed) {
            return Err(RequestError::ResponseError(reason));
        }

        if let Some(usage_path) = FieldMapping::opt(&self.mapping.usage) {
            if let Some(usage_value) = fieldmap::get_path(&parsed, usage_path) {
                if let Some(usage) = UsageTokens::from_value(usage_value) {
                    metrics.usage = Some(usage);
                    if usage.is_authoritative() {
                        metrics.usage_extracted = true;
                    }
                }
            }
        }

        let content_chunk =
            fieldmap::get_path_string(&parsed, &self.mapping.content);
        let reasoning_chunk =
            fieldmap::get_path_string(&parsed, &self.mapping.reasoning_content);

        if !content_chunk.is_empty() {
            self.note_content_chunk(&content_chunk, metrics);
        }

        if !reasoning_chunk.is_empty() {
            metrics.reasoning_active = true;
            if !metrics.first_reasoning_token_seen {
                metrics.first_reasoning_token_seen = true;
                let now = Instant::now();
                metrics.first_reasoning_token_time = Some(now);
                self.sink.record_success(
                    TIME_TO_FIRST_REASONING_TOKEN,
                    duration_ms(self.start, now),
                    reasoning_chunk.len() as u64,
                );
            }
            if !metrics.usage_extracted {
                metrics.reasoning_content.push_str(&reasoning_chunk);
            }
        } else if metrics.reasoning_active
            && !metrics.reasoning_ended
            && !content_chunk.is_empty()
        {
            // Reasoning stops the moment content starts flowing without it.
            if let Some(first) = metrics.first_reasoning_token_time {
                metrics.reasoning_ended = true;
                self.sink.record_success(
                    TIME_TO_REASONING_COMPLETION,
                    duration_ms(first, Instant::now()),
                    metrics.reasoning_content.len() as u64,
                );
            }
        }

        Ok(RecordOutcome::Continue)
    }

    fn note_content_chunk(&self, chunk: &str, metrics: &mut StreamMetrics) {
        if !metrics.first_output_token_seen {
            metrics.first_output_token_seen = true;
            let now = Instant::now();
            metrics.first_output_token_time = Some(now);
            self.sink.record_success(
                TIME_TO_FIRST_OUTPUT_TOKEN,
                duration_ms(self.start, now),
                chunk.len() as u64,
            );
        }
        if !metrics.usage_extracted {
            metrics.content.push_str(chunk);
        }
    }

    /// Strip the configured record prefix. Multi-line records have the
    /// prefix stripped per line and are joined back with newlines.
    fn strip_prefixes(&self, text: &str) -> String {
        let strip_line = |line: &str| -> String {
            let line = line.trim();
            if let Some(end_prefix) = FieldMapping::opt(&self.mapping.end_prefix) {
                if let Some(rest) = line.strip_prefix(end_prefix) {
                    return rest.trim_start().to_owned();
                }
            }
            if !self.mapping.stream_prefix.is_empty() {
                if let Some(rest) = line.strip_prefix(&self.mapping.stream_prefix) {
                    return rest.trim_start().to_owned();
                }
            }
            line.to_owned()
        };

        if text.contains('\n') {
            text.lines()
                .map(strip_line)
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        } else {
            strip_line(text)
        }
    }
}

/// Milliseconds between two instants.
pub fn duration_ms(from: Instant, to: Instant) -> f64 {
    to.saturating_duration_since(from).as_secs_f64() * 1000.0
}

/// Application-level error indicators inside a parsed response.
pub fn response_error(parsed: &Value) -> Option<String> {
    let describe = || format!("response={parsed}");

    if let Some(code) = parsed.get("code").and_then(Value::as_i64) {
        if code < 0 {
            return Some(describe());
        }
    }
    match parsed.get("error") {
        Some(Value::Null) | None => {}
        Some(Value::String(text)) if text.trim().is_empty() => {}
        Some(Value::Object(map)) => {
            if map.contains_key("type") || map.contains_key("message") {
                return Some(describe());
            }
            if !map.is_empty() {
                return Some(describe());
            }
        }
        Some(_) => return Some(describe()),
    }
    if parsed.get("object").and_then(Value::as_str) == Some("error") {
        return Some(describe());
    }
    if parsed.get("event").and_then(Value::as_str) == Some("error") {
        return Some(describe());
    }
    None
}
