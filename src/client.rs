//! Blocking HTTP client for an Ollama-compatible serving endpoint.
//!
//! Drives `POST /api/generate` in streaming mode, consuming the
//! newline-delimited JSON frames as they arrive so that first-token
//! latency can be measured on the wall clock, and `GET /api/tags` for
//! installed-model discovery.
//!
//! One retry policy lives here: a failure carrying an out-of-memory or
//! server-error signature is retried exactly once with the context
//! window and token budget halved (floors 512 and 64). Everything else
//! propagates to the caller.

use std::io::{BufRead, BufReader};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MedirError, Result};
use crate::record::ApiMetrics;

/// Default serving endpoint.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:11434";

/// Transport timeout for generation calls.
const GENERATE_TIMEOUT_SECS: u64 = 600;

/// Lower bounds applied when the retry halves the request shape.
const MIN_NUM_CTX: u32 = 512;
const MIN_MAX_TOKENS: u32 = 64;

// ============================================================================
// Request / response shapes
// ============================================================================

/// Sampling and shape options sent with a generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Context window size
    pub num_ctx: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub seed: i64,
    /// Token budget (wire name `num_predict`)
    #[serde(rename = "num_predict")]
    pub max_tokens: u32,
}

impl GenerateOptions {
    /// Options with the context window and token budget halved, used
    /// for the single out-of-memory retry.
    #[must_use]
    pub fn halved(&self) -> Self {
        Self {
            num_ctx: (self.num_ctx / 2).max(MIN_NUM_CTX),
            max_tokens: (self.max_tokens / 2).max(MIN_MAX_TOKENS),
            ..self.clone()
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: &'a GenerateOptions,
    keep_alive: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a [i64]>,
}

/// One NDJSON frame of the generation stream. Engines differ in which
/// counters they emit, so everything beyond `done` is optional.
#[derive(Debug, Default, Deserialize)]
struct StreamFrame {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    eval_duration: Option<u64>,
    #[serde(default)]
    total_duration: Option<u64>,
    #[serde(default)]
    load_duration: Option<u64>,
    #[serde(default)]
    prompt_eval_duration: Option<u64>,
    #[serde(default)]
    context: Option<Vec<i64>>,
    #[serde(default)]
    error: Option<String>,
}

/// Outcome of one streamed generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    /// Concatenated response fragments
    pub text: String,
    /// Wall-clock duration of the whole call, seconds
    pub latency_s: f64,
    /// Wall-clock time to the first non-empty fragment, seconds
    pub first_token_s: Option<f64>,
    /// Engine counters from the terminal frame
    pub metrics: ApiMetrics,
    /// Conversation context tokens for follow-up requests
    pub context: Option<Vec<i64>>,
    /// Whether the out-of-memory retry path produced this result
    pub retried: bool,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Clone, Deserialize)]
struct ModelTag {
    name: String,
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    details: Option<TagDetails>,
}

#[derive(Debug, Clone, Deserialize)]
struct TagDetails {
    #[serde(default)]
    family: Option<String>,
    #[serde(default)]
    families: Option<Vec<String>>,
    #[serde(default)]
    parameter_size: Option<String>,
    #[serde(default)]
    quantization_level: Option<String>,
}

/// Installed-model record from the endpoint's tag listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub digest: Option<String>,
    pub family: Option<String>,
    pub families: Option<Vec<String>>,
    pub parameter_size: Option<String>,
    pub quantization_level: Option<String>,
}

// ============================================================================
// Client
// ============================================================================

/// Blocking client bound to one serving endpoint.
pub struct OllamaClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl OllamaClient {
    /// Create a client with the standard generation timeout.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(GENERATE_TIMEOUT_SECS))
    }

    /// Create a client with an explicit transport timeout.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MedirError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Endpoint this client talks to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Stream one generation call to completion.
    pub fn generate_stream(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
        keep_alive: &str,
        context: Option<&[i64]>,
    ) -> Result<GenerationResult> {
        let url = format!("{}/api/generate", self.base_url);
        let request = GenerateRequest {
            model,
            prompt,
            stream: true,
            options,
            keep_alive,
            context,
        };
        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .map_err(|e| MedirError::Connection(format!("HTTP request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(MedirError::Connection(format!(
                "HTTP status {status}: {body}"
            )));
        }

        let mut text = String::new();
        let mut first_token_s = None;
        let mut terminal: Option<StreamFrame> = None;
        let reader = BufReader::new(response);
        for line in reader.lines() {
            let line = line.map_err(|e| MedirError::Connection(format!("stream read failed: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            let frame: StreamFrame = serde_json::from_str(&line).map_err(|e| {
                MedirError::Format {
                    reason: format!("malformed stream frame: {e}"),
                }
            })?;
            if let Some(err) = frame.error {
                return Err(MedirError::Generation(err));
            }
            if !frame.response.is_empty() {
                if first_token_s.is_none() {
                    first_token_s = Some(started.elapsed().as_secs_f64());
                }
                text.push_str(&frame.response);
            }
            if frame.done {
                terminal = Some(frame);
                break;
            }
        }
        let Some(frame) = terminal else {
            return Err(MedirError::Generation(
                "stream ended without a terminal frame".to_string(),
            ));
        };
        Ok(GenerationResult {
            text,
            latency_s: started.elapsed().as_secs_f64(),
            first_token_s,
            metrics: ApiMetrics {
                eval_count: frame.eval_count,
                eval_duration_ns: frame.eval_duration,
                total_duration_ns: frame.total_duration,
                load_duration_ns: frame.load_duration,
                prompt_eval_duration_ns: frame.prompt_eval_duration,
            },
            context: frame.context,
            retried: false,
        })
    }

    /// Generation with the single out-of-memory retry.
    ///
    /// On a failure carrying the OOM signature the request shape is
    /// halved once via [`GenerateOptions::halved`] and the call is
    /// repeated. A second failure, or any non-OOM failure, propagates.
    pub fn generate_with_retry(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
        keep_alive: &str,
    ) -> Result<GenerationResult> {
        match self.generate_stream(model, prompt, options, keep_alive, None) {
            Ok(result) => Ok(result),
            Err(e) if is_oom_signature(&e.to_string()) => {
                let reduced = options.halved();
                warn!(
                    model,
                    num_ctx = reduced.num_ctx,
                    max_tokens = reduced.max_tokens,
                    "generation hit memory pressure, retrying with reduced shape: {e}"
                );
                let mut result =
                    self.generate_stream(model, prompt, &reduced, keep_alive, None)?;
                result.retried = true;
                Ok(result)
            }
            Err(e) => Err(e),
        }
    }

    /// Installed models from `GET /api/tags`.
    pub fn installed_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| MedirError::Connection(format!("HTTP request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(MedirError::Connection(format!("HTTP status {status}")));
        }
        let tags: TagsResponse = response.json().map_err(|e| MedirError::Format {
            reason: format!("malformed tags payload: {e}"),
        })?;
        Ok(tags
            .models
            .into_iter()
            .map(|m| {
                let details = m.details.unwrap_or(TagDetails {
                    family: None,
                    families: None,
                    parameter_size: None,
                    quantization_level: None,
                });
                ModelInfo {
                    name: m.name,
                    digest: m.digest,
                    family: details.family,
                    families: details.families,
                    parameter_size: details.parameter_size,
                    quantization_level: details.quantization_level,
                }
            })
            .collect())
    }

    /// Details for one installed model, if present.
    pub fn model_details(&self, name: &str) -> Result<Option<ModelInfo>> {
        Ok(self
            .installed_models()?
            .into_iter()
            .find(|m| m.name == name))
    }
}

/// Whether an error message carries the out-of-memory signature that
/// warrants a reduced-shape retry.
#[must_use]
pub fn is_oom_signature(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("out of memory") || lower.contains("500")
}
