//! Process-wide configuration for one generator run.
//!
//! Built once at generator startup from CLI flags and passed down the call
//! stack explicitly; nothing here mutates after construction.

use std::{collections::HashMap, time::Duration};

use crate::{fieldmap::FieldMapping, prelude::*};

/// Endpoint name recorded for OpenAI-style requests.
pub const ENDPOINT_CHAT_COMPLETIONS: &str = "chat_completions";
/// Endpoint name recorded for field-map-driven requests.
pub const ENDPOINT_CUSTOM_API: &str = "custom_api";

/// The API path that switches the payload builder and parsers into
/// OpenAI chat-completions mode.
pub const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

/// Client certificate configuration, resolved from the task's file paths.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum CertConfig {
    #[default]
    None,
    /// One PEM bundle holding both certificate and key.
    Combined(PathBuf),
    /// Separate certificate and key files.
    Pair(PathBuf, PathBuf),
}

impl CertConfig {
    /// Resolve from raw flag values, ignoring files that do not exist.
    pub fn resolve(cert_file: &str, key_file: &str) -> Self {
        let accessible = |raw: &str| -> Option<PathBuf> {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return None;
            }
            let path = PathBuf::from(trimmed);
            if path.is_file() {
                Some(path)
            } else {
                warn!(file = trimmed, "certificate file not accessible");
                None
            }
        };
        match (accessible(cert_file), accessible(key_file)) {
            (Some(cert), Some(key)) => CertConfig::Pair(cert, key),
            (Some(cert), None) => CertConfig::Combined(cert),
            _ => CertConfig::None,
        }
    }
}

/// Immutable configuration for the current run.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub task_id: String,
    /// Target host, e.g. `http://10.0.0.2:8000`.
    pub host: String,
    /// HTTP path suffix appended to the host.
    pub api_path: String,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    /// JSON request template; empty means "synthesize a chat payload".
    pub request_payload: String,
    pub model_name: String,
    pub system_prompt: String,
    pub stream_mode: bool,
    /// 0 = text, 1 = multimodal.
    pub chat_type: u8,
    pub cert: CertConfig,
    pub field_mapping: FieldMapping,
    /// Dataset selector; see [`crate::dataset::DatasetMode`].
    pub test_data: String,
    pub duration: Duration,
    pub concurrent_users: u32,
    /// Users spawned per second during ramp-up.
    pub spawn_rate: f64,
}

impl RunConfig {
    /// Is this run driving an OpenAI-style `/chat/completions` endpoint?
    pub fn is_chat_completions(&self) -> bool {
        self.api_path == CHAT_COMPLETIONS_PATH
    }

    /// The endpoint name under which successes and failures are recorded.
    pub fn endpoint_name(&self) -> &'static str {
        if self.is_chat_completions() {
            ENDPOINT_CHAT_COMPLETIONS
        } else {
            ENDPOINT_CUSTOM_API
        }
    }

    /// The field mapping with OpenAI extraction defaults filled in when
    /// the run targets `/chat/completions`.
    pub fn effective_field_mapping(&self) -> FieldMapping {
        if self.is_chat_completions() {
            self.field_mapping.clone().with_chat_completions_defaults()
        } else {
            self.field_mapping.clone()
        }
    }

    /// A copy of the headers safe for logging.
    pub fn masked_headers(&self) -> HashMap<String, String> {
        mask_sensitive(&self.headers)
    }
}

/// Parse a JSON-object flag into a string map. Empty input yields the
/// default `Content-Type` header; malformed input is logged and treated
/// the same way rather than aborting the run.
pub fn parse_headers(raw: &str) -> HashMap<String, String> {
    let mut defaults = HashMap::new();
    defaults.insert("Content-Type".to_owned(), "application/json".to_owned());
    if raw.trim().is_empty() {
        return defaults;
    }
    match serde_json::from_str::<HashMap<String, String>>(raw) {
        Ok(mut parsed) => {
            parsed
                .entry("Content-Type".to_owned())
                .or_insert_with(|| "application/json".to_owned());
            parsed
        }
        Err(err) => {
            error!("failed to parse headers JSON {raw:?}: {err}; using defaults");
            defaults
        }
    }
}

/// Parse a JSON-object flag into a cookie map. Empty or malformed input
/// yields no cookies.
pub fn parse_cookies(raw: &str) -> HashMap<String, String> {
    if raw.trim().is_empty() {
        return HashMap::new();
    }
    match serde_json::from_str::<HashMap<String, String>>(raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            error!("failed to parse cookies JSON {raw:?}: {err}; ignoring");
            HashMap::new()
        }
    }
}

/// Parse a boolean flag the way the wire format spells it.
pub fn parse_bool_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1")
}

/// Parse a run time given as either plain seconds or with an `s` suffix.
pub fn parse_run_time(raw: &str) -> Result<Duration> {
    let trimmed = raw.trim().trim_end_matches(['s', 'S']);
    let seconds: u64 = trimmed
        .parse()
        .with_context(|| format!("invalid run time: {raw:?}"))?;
    Ok(Duration::from_secs(seconds))
}

/// Replace sensitive header values with `****` for logging.
pub fn mask_sensitive(map: &HashMap<String, String>) -> HashMap<String, String> {
    map.iter()
        .map(|(key, value)| {
            if key.eq_ignore_ascii_case("authorization") {
                (key.clone(), "****".to_owned())
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

/// Mask authorization values embedded in a spawn command line.
pub fn mask_sensitive_command(args: &[String]) -> Vec<String> {
    let pattern = regex::RegexBuilder::new(r#""authorization"\s*:\s*"[^"]*""#)
        .case_insensitive(true)
        .build()
        .expect("mask regex should be valid");
    args.iter()
        .map(|arg| {
            pattern
                .replace_all(arg, r#""Authorization": "****""#)
                .into_owned()
        })
        .collect()
}
