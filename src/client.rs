//! The HTTP client used by virtual users.
//!
//! One client per worker process, shared by every virtual user in it. TLS
//! verification is off (load targets routinely run self-signed), client
//! certificates come either as one combined PEM bundle or a cert/key
//! pair, and streaming responses are handed back as raw byte streams so
//! nothing ever buffers a whole body.

use std::{sync::Arc, time::Duration};

use reqwest::{Identity, StatusCode, header};

use crate::{
    config::{CertConfig, RunConfig},
    errors::RequestError,
    prelude::*,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(90);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_MAX_IDLE_PER_HOST: usize = 20;

/// Longest response-body snippet carried inside an error.
const BODY_SNIPPET_LEN: usize = 2_000;

/// Shared HTTP client for one run.
#[derive(Clone, Debug)]
pub struct LlmClient {
    client: reqwest::Client,
    config: Arc<RunConfig>,
    url: String,
    cookie_header: Option<String>,
}

impl LlmClient {
    pub fn new(config: Arc<RunConfig>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST);

        if config.stream_mode {
            // Streams can legitimately stay open for the whole run; only
            // silence between chunks counts against the deadline.
            let read_timeout = STREAM_READ_TIMEOUT.max(config.duration);
            builder = builder.read_timeout(read_timeout);
        } else {
            builder = builder.read_timeout(READ_TIMEOUT).timeout(TOTAL_TIMEOUT);
        }

        if let Some(identity) = load_identity(&config.cert)? {
            builder = builder.identity(identity);
        }

        let client = builder.build().context("failed to build HTTP client")?;
        let url = format!(
            "{}{}",
            config.host.trim_end_matches('/'),
            config.api_path
        );
        let cookie_header = if config.cookies.is_empty() {
            None
        } else {
            Some(
                config
                    .cookies
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        };

        Ok(LlmClient {
            client,
            config,
            url,
            cookie_header,
        })
    }

    /// Issue the prepared request. Returns the raw response on HTTP 200 and
    /// a typed error on anything else; streaming callers consume the body
    /// via [`reqwest::Response::bytes_stream`].
    pub async fn post(&self, body: &Value) -> Result<reqwest::Response, RequestError> {
        let mut request = self.client.post(&self.url).json(body);
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }
        if let Some(cookies) = &self.cookie_header {
            request = request.header(header::COOKIE, cookies);
        }

        let response = request.send().await.map_err(RequestError::from)?;
        let status = response.status();
        if status != StatusCode::OK {
            let body_snippet = match response.text().await {
                Ok(text) => truncate_snippet(&text),
                Err(_) => String::new(),
            };
            return Err(RequestError::HttpStatus {
                status: status.as_u16(),
                body_snippet,
            });
        }
        Ok(response)
    }
}

fn load_identity(cert: &CertConfig) -> Result<Option<Identity>> {
    let pem_bytes = match cert {
        CertConfig::None => return Ok(None),
        CertConfig::Combined(path) => std::fs::read(path)
            .with_context(|| format!("failed to read certificate {path:?}"))?,
        CertConfig::Pair(cert_path, key_path) => {
            let mut bytes = std::fs::read(cert_path)
                .with_context(|| format!("failed to read certificate {cert_path:?}"))?;
            bytes.push(b'\n');
            bytes.extend(
                std::fs::read(key_path)
                    .with_context(|| format!("failed to read key {key_path:?}"))?,
            );
            bytes
        }
    };
    let identity =
        Identity::from_pem(&pem_bytes).context("failed to parse client certificate")?;
    Ok(Some(identity))
}

fn truncate_snippet(text: &str) -> String {
    if text.chars().count() <= BODY_SNIPPET_LEN {
        text.to_owned()
    } else {
        let snippet: String = text.chars().take(BODY_SNIPPET_LEN).collect();
        format!("{snippet}...")
    }
}
