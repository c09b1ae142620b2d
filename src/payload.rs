//! Request payload construction for virtual user calls.
//!
//! Two shapes come out of here: the OpenAI chat format (when the run
//! targets `/chat/completions`) and arbitrary JSON templates with the
//! prompt written in through a dotted path (custom API mode).

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::{
    config::RunConfig,
    dataset::PromptRecord,
    errors::PayloadError,
    fieldmap::{self, FieldMapping},
    prelude::*,
};

/// Builds one request body per virtual-user iteration.
#[derive(Debug)]
pub struct PayloadBuilder {
    config: Arc<RunConfig>,
    mapping: FieldMapping,
    warned_missing_prompt_path: AtomicBool,
}

impl PayloadBuilder {
    pub fn new(config: Arc<RunConfig>) -> Self {
        let mapping = config.effective_field_mapping();
        PayloadBuilder {
            config,
            mapping,
            warned_missing_prompt_path: AtomicBool::new(false),
        }
    }

    /// Build the request body for this iteration.
    ///
    /// Returns the body plus the user prompt text that went into it (used
    /// later for token counting). With no prompt record the template is
    /// used as-is and the prompt text is read back out of it.
    pub fn build(
        &self,
        record: Option<&PromptRecord>,
    ) -> Result<(Value, String), PayloadError> {
        let template = self.parse_template()?;
        let Some(record) = record else {
            let prompt = fieldmap::get_path_string(&template, &self.mapping.prompt);
            return Ok((template, prompt));
        };

        if self.config.is_chat_completions() {
            Ok(self.build_chat_completions(template, record))
        } else {
            Ok(self.build_custom_api(template, record))
        }
    }

    /// Parse the configured template, or synthesize a minimal chat payload
    /// when none is configured.
    fn parse_template(&self) -> Result<Value, PayloadError> {
        let raw = self.config.request_payload.trim();
        if raw.is_empty() {
            return Ok(json!({
                "model": self.config.model_name,
                "stream": self.config.stream_mode,
                "messages": [{"role": "user", "content": "Hi"}],
            }));
        }
        serde_json::from_str(raw).map_err(PayloadError::InvalidTemplate)
    }

    fn build_chat_completions(
        &self,
        mut template: Value,
        record: &PromptRecord,
    ) -> (Value, String) {
        let user_content = match image_url_for(record) {
            Some(url) => json!([
                {"type": "text", "text": record.prompt},
                {"type": "image_url", "image_url": {"url": url}},
            ]),
            None => Value::String(record.prompt.clone()),
        };

        let mut messages = Vec::new();
        if !self.config.system_prompt.is_empty() {
            messages.push(json!({
                "role": "system",
                "content": self.config.system_prompt,
            }));
        }
        messages.push(json!({"role": "user", "content": user_content}));
        template["messages"] = Value::Array(messages);

        if field_is_unset(template.get("stream")) {
            template["stream"] = Value::Bool(self.config.stream_mode);
        }
        if field_is_unset(template.get("model")) {
            template["model"] = Value::String(self.config.model_name.clone());
        }

        (template, record.prompt.clone())
    }

    fn build_custom_api(
        &self,
        mut template: Value,
        record: &PromptRecord,
    ) -> (Value, String) {
        match FieldMapping::opt(&self.mapping.prompt) {
            Some(path) => {
                if !fieldmap::set_path(
                    &mut template,
                    path,
                    Value::String(record.prompt.clone()),
                ) {
                    warn!(
                        path,
                        "could not write prompt into template; sending it unchanged"
                    );
                }
            }
            None => {
                if !self.warned_missing_prompt_path.swap(true, Ordering::Relaxed) {
                    warn!("No prompt field mapping configured, using original payload");
                }
            }
        }
        (template, record.prompt.clone())
    }
}

/// The image URL a multimodal record contributes, if any. A bare base64
/// payload becomes a JPEG data URL.
fn image_url_for(record: &PromptRecord) -> Option<String> {
    if let Some(url) = &record.image_url {
        return Some(url.clone());
    }
    record
        .image_base64
        .as_ref()
        .map(|data| format!("data:image/jpeg;base64,{data}"))
}

/// Absent, null, or empty-string fields count as unset for auto-fill.
fn field_is_unset(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(text)) => text.is_empty(),
        _ => false,
    }
}
