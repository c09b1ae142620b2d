//! The virtual-user runtime.
//!
//! One cooperative loop per simulated user: fetch a prompt, build the
//! payload, fire the request, dissect the response, emit metrics, pace,
//! repeat. Failures inside an iteration never kill the user; they are
//! recorded and the loop continues at the next pacing interval.

use std::{sync::Arc, time::Instant};

use rand::Rng as _;
use tokio::{task::JoinSet, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    client::LlmClient,
    config::RunConfig,
    dataset::PromptSource,
    errors::RequestError,
    fieldmap::{self, FieldMapping},
    metrics::{MetricSink, TIME_TO_OUTPUT_COMPLETION, TOTAL_TIME},
    payload::PayloadBuilder,
    prelude::*,
    sse::{
        RecordOutcome, RecordStream, StreamMetrics, StreamParser, UsageTokens,
        duration_ms, response_error,
    },
    tokenizer::count_tokens,
};

/// Pacing bounds between iterations, in seconds.
const WAIT_TIME_MIN_SECS: f64 = 1.0;
const WAIT_TIME_MAX_SECS: f64 = 3.0;

/// Everything a virtual user needs, shared across the whole fleet.
#[derive(Debug)]
pub struct UserContext {
    pub config: Arc<RunConfig>,
    pub client: LlmClient,
    pub payload_builder: PayloadBuilder,
    pub mapping: FieldMapping,
    pub prompts: Arc<PromptSource>,
    pub sink: MetricSink,
}

impl UserContext {
    pub fn new(
        config: Arc<RunConfig>,
        prompts: Arc<PromptSource>,
        sink: MetricSink,
    ) -> Result<Self> {
        Ok(UserContext {
            client: LlmClient::new(config.clone())?,
            payload_builder: PayloadBuilder::new(config.clone()),
            mapping: config.effective_field_mapping(),
            config,
            prompts,
            sink,
        })
    }
}

/// Spawn the whole fleet and wait for every user to wind down.
pub async fn run_user_fleet(ctx: Arc<UserContext>, cancel: CancellationToken) {
    let mut users = JoinSet::new();
    for user_index in 0..ctx.config.concurrent_users {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        users.spawn(run_virtual_user(user_index, ctx, cancel));
    }
    while users.join_next().await.is_some() {}
}

/// One simulated user. `user_index` staggers ramp-up so `spawn_rate`
/// users come online per second.
pub async fn run_virtual_user(
    user_index: u32,
    ctx: Arc<UserContext>,
    cancel: CancellationToken,
) {
    let ramp_delay = std::time::Duration::from_secs_f64(
        f64::from(user_index) / ctx.config.spawn_rate.max(0.001),
    );
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = sleep(ramp_delay) => {}
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = run_iteration(&ctx) => {}
        }

        let wait_secs = rand::thread_rng().gen_range(WAIT_TIME_MIN_SECS..WAIT_TIME_MAX_SECS);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(std::time::Duration::from_secs_f64(wait_secs)) => {}
        }
    }
}

/// What one successful request produced.
#[derive(Debug, Default)]
struct IterationOutcome {
    content: String,
    reasoning_content: String,
    usage: Option<UsageTokens>,
}

async fn run_iteration(ctx: &UserContext) {
    let record = ctx.prompts.next().cloned();
    let (body, user_prompt) = match ctx.payload_builder.build(record.as_ref()) {
        Ok(built) => built,
        Err(err) => {
            // A broken template cannot improve by retrying, but the run
            // may still be stopped externally; skip this iteration.
            warn!("skipping iteration, could not build payload: {err}");
            return;
        }
    };

    let endpoint = ctx.config.endpoint_name();
    let start = Instant::now();
    let result = if ctx.config.stream_mode {
        handle_stream_request(ctx, &body, start).await
    } else {
        handle_non_stream_request(ctx, &body, start).await
    };

    match result {
        Ok(outcome) => {
            let (completion_tokens, total_tokens) =
                token_deltas(ctx, &user_prompt, &outcome);
            ctx.sink.record_tokens(completion_tokens, total_tokens);
        }
        Err(err) => {
            ctx.sink.record_failure(
                endpoint,
                duration_ms(start, Instant::now()),
                0,
                &err.to_string(),
            );
        }
    }
}

/// Streaming branch: frame the body into records, run the state machine,
/// then emit the completion events and the endpoint success.
async fn handle_stream_request(
    ctx: &UserContext,
    body: &Value,
    start: Instant,
) -> Result<IterationOutcome, RequestError> {
    let response = ctx.client.post(body).await?;
    let mut records = RecordStream::new(response.bytes_stream());
    let parser = StreamParser::new(&ctx.mapping, &ctx.sink, start);
    let mut metrics = StreamMetrics::default();

    while let Some(record) = records.next_record().await {
        match parser.process_record(&record?, &mut metrics)? {
            RecordOutcome::Continue => {}
            RecordOutcome::StreamEnd => break,
        }
    }

    let now = Instant::now();
    let completion_ms = metrics
        .first_output_token_time
        .map(|first| duration_ms(first, now))
        .unwrap_or(0.0);
    ctx.sink.record_success(
        TIME_TO_OUTPUT_COMPLETION,
        completion_ms,
        metrics.content.len() as u64,
    );
    let total_length = (metrics.content.len() + metrics.reasoning_content.len()) as u64;
    ctx.sink
        .record_success(TOTAL_TIME, duration_ms(start, now), total_length);
    ctx.sink.record_success(
        ctx.config.endpoint_name(),
        duration_ms(start, now),
        metrics.content.len() as u64,
    );

    Ok(IterationOutcome {
        content: metrics.content,
        reasoning_content: metrics.reasoning_content,
        usage: metrics.usage,
    })
}

/// Single-shot branch: parse the whole body at once.
async fn handle_non_stream_request(
    ctx: &UserContext,
    body: &Value,
    start: Instant,
) -> Result<IterationOutcome, RequestError> {
    let response = ctx.client.post(body).await?;
    let parsed: Value = response.json().await.map_err(|err| {
        RequestError::StreamFormat(format!("unparseable response body: {err}"))
    })?;
    let now = Instant::now();

    if let Some(reason) = response_error(&parsed) {
        return Err(RequestError::ResponseError(reason));
    }

    let (content, reasoning_content) = if ctx.config.is_chat_completions() {
        (
            fieldmap::get_path_string(&parsed, "choices.0.message.content"),
            fieldmap::get_path_string(&parsed, "choices.0.message.reasoning_content"),
        )
    } else {
        (
            fieldmap::get_path_string(&parsed, &ctx.mapping.content),
            fieldmap::get_path_string(&parsed, &ctx.mapping.reasoning_content),
        )
    };

    let usage = FieldMapping::opt(&ctx.mapping.usage)
        .and_then(|path| fieldmap::get_path(&parsed, path))
        .and_then(UsageTokens::from_value);

    let total_length = (content.len() + reasoning_content.len()) as u64;
    ctx.sink
        .record_success(TOTAL_TIME, duration_ms(start, now), total_length);
    ctx.sink.record_success(
        ctx.config.endpoint_name(),
        duration_ms(start, now),
        content.len() as u64,
    );

    Ok(IterationOutcome {
        content,
        reasoning_content,
        usage,
    })
}

/// Token accounting for one completed request. An authoritative `usage`
/// block wins outright; otherwise everything is counted locally.
fn token_deltas(
    ctx: &UserContext,
    user_prompt: &str,
    outcome: &IterationOutcome,
) -> (u64, u64) {
    if let Some(usage) = outcome.usage {
        if usage.is_authoritative() {
            return (
                usage.completion_tokens.unwrap_or(0),
                usage.total_tokens.unwrap_or(0),
            );
        }
    }
    let model = &ctx.config.model_name;
    let system_tokens = count_tokens(&ctx.config.system_prompt, model);
    let user_tokens = count_tokens(user_prompt, model);
    let reasoning_tokens = count_tokens(&outcome.reasoning_content, model);
    let content_tokens = count_tokens(&outcome.content, model);

    let completion = reasoning_tokens + content_tokens;
    (completion, completion + system_tokens + user_tokens)
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use crate::config::CertConfig;

    use super::*;

    fn context(stream_mode: bool) -> UserContext {
        let config = Arc::new(RunConfig {
            task_id: "t".to_owned(),
            host: "http://localhost:9".to_owned(),
            api_path: "/chat/completions".to_owned(),
            headers: HashMap::new(),
            cookies: HashMap::new(),
            request_payload: String::new(),
            model_name: "test-model".to_owned(),
            system_prompt: "sys".to_owned(),
            stream_mode,
            chat_type: 0,
            cert: CertConfig::None,
            field_mapping: FieldMapping::default(),
            test_data: String::new(),
            duration: Duration::from_secs(1),
            concurrent_users: 1,
            spawn_rate: 1.0,
        });
        let (sink, _rx) = MetricSink::channel();
        UserContext::new(config, Arc::new(PromptSource::empty()), sink).unwrap()
    }

    #[test]
    fn authoritative_usage_bypasses_counting() {
        let ctx = context(true);
        let outcome = IterationOutcome {
            content: "never counted".to_owned(),
            reasoning_content: String::new(),
            usage: Some(UsageTokens {
                prompt_tokens: Some(4),
                completion_tokens: Some(214),
                total_tokens: Some(218),
            }),
        };
        assert_eq!(token_deltas(&ctx, "prompt", &outcome), (214, 218));
    }

    #[test]
    fn non_authoritative_usage_falls_back_to_counting() {
        let ctx = context(true);
        let outcome = IterationOutcome {
            content: "four words of text".to_owned(),
            reasoning_content: String::new(),
            usage: Some(UsageTokens {
                prompt_tokens: Some(4),
                completion_tokens: Some(0),
                total_tokens: Some(0),
            }),
        };
        let (completion, total) = token_deltas(&ctx, "hello there", &outcome);
        assert!(completion > 0);
        assert!(total > completion);
    }

    #[test]
    fn counted_totals_include_prompts() {
        let ctx = context(true);
        let outcome = IterationOutcome {
            content: "reply".to_owned(),
            reasoning_content: "because".to_owned(),
            usage: None,
        };
        let (completion, total) = token_deltas(&ctx, "question", &outcome);
        let expected_completion = count_tokens("because", "test-model")
            + count_tokens("reply", "test-model");
        assert_eq!(completion, expected_completion);
        let prompts = count_tokens("sys", "test-model")
            + count_tokens("question", "test-model");
        assert_eq!(total, completion + prompts);
    }
}
