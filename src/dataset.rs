//! Prompt datasets: lazy, finite, cyclically-restartable prompt sources.
//!
//! A dataset arrives in one of four shapes: empty (the request template is
//! already complete), the literal `"default"` (built-in prompts), inline
//! JSONL pasted straight into the task, or a filesystem path to a JSONL
//! file. Images referenced by path are base64-encoded once at load time,
//! not per request.

use std::sync::atomic::{AtomicUsize, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::{errors::DatasetError, prelude::*};

/// Built-in prompts backing the `"default"` dataset mode.
const BUILTIN_PROMPTS: &[&str] = &[
    "Tell me about the history of Artificial Intelligence.",
    "Explain the difference between supervised and unsupervised learning.",
    "Write a short story about a robot discovering music.",
    "Summarize the plot of Journey to the West in three sentences.",
    "What are the trade-offs between latency and throughput in serving LLMs?",
    "Translate the sentence 'knowledge is power' into French and Japanese.",
    "Describe how transformers use attention, for a high-school audience.",
    "List five practical uses of text embeddings.",
];

/// Records above this count still load, but deserve a warning.
const QUEUE_SIZE_WARNING: usize = 1_000_000;

/// One dataset entry.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PromptRecord {
    pub id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl PromptRecord {
    fn text(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        PromptRecord {
            id: id.into(),
            prompt: prompt.into(),
            image_base64: None,
            image_url: None,
        }
    }
}

/// How the `test_data` selector is interpreted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatasetMode {
    /// No dataset; the request template must be intrinsically complete.
    Empty,
    /// The built-in prompt set.
    Default,
    /// JSONL content carried inline in the task record.
    Inline(String),
    /// A JSONL file on disk.
    File(PathBuf),
}

impl DatasetMode {
    /// Classify a raw `test_data` selector string.
    pub fn from_selector(test_data: &str) -> Self {
        let trimmed = test_data.trim();
        if trimmed.is_empty() {
            DatasetMode::Empty
        } else if trimmed == "default" {
            DatasetMode::Default
        } else if trimmed.starts_with('{') || trimmed.contains('\n') {
            DatasetMode::Inline(trimmed.to_owned())
        } else {
            DatasetMode::File(PathBuf::from(trimmed))
        }
    }

    /// Does this selector point at a file we own and should delete when the
    /// task reaches a terminal status?
    pub fn is_cleanup_candidate(test_data: &str) -> bool {
        matches!(Self::from_selector(test_data), DatasetMode::File(_))
    }
}

/// A finite prompt sequence that wraps around after the last record.
#[derive(Debug)]
pub struct PromptSource {
    records: Vec<PromptRecord>,
    cursor: AtomicUsize,
}

impl PromptSource {
    /// A source with no records. `next()` always yields `None`.
    pub fn empty() -> Self {
        PromptSource {
            records: Vec::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Load a source for the given selector and chat type.
    pub fn load(test_data: &str, chat_type: u8) -> Result<Self, DatasetError> {
        match DatasetMode::from_selector(test_data) {
            DatasetMode::Empty => Ok(Self::empty()),
            DatasetMode::Default => Ok(Self::from_records(
                BUILTIN_PROMPTS
                    .iter()
                    .enumerate()
                    .map(|(i, prompt)| PromptRecord::text(i.to_string(), *prompt))
                    .collect(),
            )),
            DatasetMode::Inline(content) => Self::parse_jsonl(&content, chat_type),
            DatasetMode::File(path) => {
                let content = std::fs::read_to_string(&path).map_err(|source| {
                    DatasetError::Unreadable {
                        path: path.display().to_string(),
                        source,
                    }
                })?;
                Self::parse_jsonl(&content, chat_type)
            }
        }
    }

    fn from_records(records: Vec<PromptRecord>) -> Self {
        if records.len() > QUEUE_SIZE_WARNING {
            warn!(
                record_count = records.len(),
                "dataset is very large; consider sampling it"
            );
        }
        PromptSource {
            records,
            cursor: AtomicUsize::new(0),
        }
    }

    fn parse_jsonl(content: &str, chat_type: u8) -> Result<Self, DatasetError> {
        let mut records = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_line(line, chat_type) {
                Ok(record) => records.push(record),
                Err(err) => warn!("skipping unparseable dataset line: {err}"),
            }
        }
        if records.is_empty() {
            return Err(DatasetError::Empty);
        }
        Ok(Self::from_records(records))
    }

    /// Yield the next record. After the last record, the next call yields
    /// the first record again. `None` iff the source has no records.
    pub fn next(&self) -> Option<&PromptRecord> {
        if self.records.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.records.len();
        Some(&self.records[index])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Parse one JSONL line into a record.
fn parse_line(line: &str, chat_type: u8) -> Result<PromptRecord> {
    let value: Value =
        serde_json::from_str(line).with_context(|| format!("bad JSON: {line:?}"))?;
    let id = value
        .get("id")
        .map(|id| match id {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .ok_or_else(|| anyhow!("missing id field"))?;

    // `prompt` may be a plain string or a list of candidates; take the first.
    let prompt = match value.get("prompt") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => match items.first() {
            Some(Value::String(text)) => text.clone(),
            _ => return Err(anyhow!("prompt list has no text entry")),
        },
        _ => return Err(anyhow!("missing prompt field")),
    };

    let mut record = PromptRecord::text(id, prompt);
    if chat_type == 1 {
        // `image_path` may also be a list; use the first entry.
        let image_path = match value.get("image_path") {
            Some(Value::String(path)) => Some(path.clone()),
            Some(Value::Array(items)) => match items.first() {
                Some(Value::String(path)) => Some(path.clone()),
                _ => None,
            },
            _ => None,
        };
        if let Some(path) = image_path {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("failed to read image {path:?}"))?;
            record.image_base64 = Some(BASE64.encode(bytes));
        }
        if let Some(Value::String(url)) = value.get("image_url") {
            record.image_url = Some(url.clone());
        }
        if let Some(Value::String(data)) = value.get("image_base64") {
            record.image_base64 = Some(data.clone());
        }
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn selector_classification() {
        assert_eq!(DatasetMode::from_selector(""), DatasetMode::Empty);
        assert_eq!(DatasetMode::from_selector("  "), DatasetMode::Empty);
        assert_eq!(DatasetMode::from_selector("default"), DatasetMode::Default);
        assert!(matches!(
            DatasetMode::from_selector(r#"{"id":"1","prompt":"hi"}"#),
            DatasetMode::Inline(_)
        ));
        assert!(matches!(
            DatasetMode::from_selector("/data/prompts.jsonl"),
            DatasetMode::File(_)
        ));
    }

    #[test]
    fn cleanup_only_for_file_paths() {
        assert!(DatasetMode::is_cleanup_candidate("/tmp/upload/1.jsonl"));
        assert!(!DatasetMode::is_cleanup_candidate("default"));
        assert!(!DatasetMode::is_cleanup_candidate(""));
        assert!(!DatasetMode::is_cleanup_candidate(
            "{\"id\":\"1\",\"prompt\":\"hi\"}"
        ));
    }

    #[test]
    fn empty_source_yields_nothing() {
        let source = PromptSource::load("", 0).unwrap();
        assert!(source.next().is_none());
    }

    #[test]
    fn default_source_cycles() {
        let source = PromptSource::load("default", 0).unwrap();
        let len = source.len();
        assert!(len > 0);
        let first = source.next().unwrap().id.clone();
        for _ in 1..len {
            source.next().unwrap();
        }
        // One full lap later we are back at the first record.
        assert_eq!(source.next().unwrap().id, first);
    }

    #[test]
    fn inline_jsonl_skips_bad_lines() {
        let data = "{\"id\":\"a\",\"prompt\":\"hello\"}\nnot json\n{\"id\":\"b\",\"prompt\":[\"from list\"]}";
        let source = PromptSource::load(data, 0).unwrap();
        assert_eq!(source.len(), 2);
        assert_eq!(source.next().unwrap().prompt, "hello");
        assert_eq!(source.next().unwrap().prompt, "from list");
    }

    #[test]
    fn all_bad_lines_is_an_error() {
        let err = PromptSource::load("nope\nstill nope", 0).unwrap_err();
        assert!(matches!(err, DatasetError::Empty));
    }

    #[test]
    fn file_dataset_with_image_is_encoded_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("pic.jpg");
        std::fs::write(&image_path, b"fake-jpeg-bytes").unwrap();

        let data_path = dir.path().join("data.jsonl");
        let mut file = std::fs::File::create(&data_path).unwrap();
        writeln!(
            file,
            r#"{{"id":"1","prompt":"describe","image_path":"{}"}}"#,
            image_path.display()
        )
        .unwrap();

        let source =
            PromptSource::load(data_path.to_str().unwrap(), 1).unwrap();
        let record = source.next().unwrap();
        assert_eq!(record.prompt, "describe");
        assert_eq!(
            record.image_base64.as_deref(),
            Some(BASE64.encode(b"fake-jpeg-bytes").as_str())
        );
    }

    #[test]
    fn missing_file_is_unreadable() {
        let err = PromptSource::load("/definitely/not/here.jsonl", 0).unwrap_err();
        assert!(matches!(err, DatasetError::Unreadable { .. }));
    }
}
