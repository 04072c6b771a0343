//! Model seams for the external inference models.
//!
//! The models themselves (bi-encoder, the two cross-encoders, extractive
//! QA) live outside this process. This module defines the three seams the
//! pipeline calls through — [`TextEncoder`], [`PairScorer`],
//! [`SpanExtractor`] — and an HTTP client implementation that talks to an
//! inference sidecar exposing `POST /encode`, `POST /score`, and
//! `POST /answer`.
//!
//! # Retry Strategy
//!
//! The HTTP client retries transient failures with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - Other 4xx → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s (capped at 2^4)

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ModelsConfig;

/// Bi-encoder seam: independent vectors for queries and passages, compared
/// by inner product.
#[async_trait]
pub trait TextEncoder: Send + Sync {
    fn dims(&self) -> usize;
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Cross-encoder seam: relevance score per (query, passage) pair.
#[async_trait]
pub trait PairScorer: Send + Sync {
    async fn score(&self, pairs: &[(String, String)]) -> Result<Vec<f32>>;
}

/// An extracted answer span within one context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerSpan {
    pub text: String,
    /// Byte offsets within the context.
    pub start: usize,
    pub end: usize,
}

/// Extractive QA seam: best answer span per context for one question.
#[async_trait]
pub trait SpanExtractor: Send + Sync {
    async fn answer(&self, question: &str, contexts: &[String]) -> Result<Vec<AnswerSpan>>;
}

/// The full model complement the pipeline needs.
#[derive(Clone)]
pub struct ModelSet {
    pub encoder: Arc<dyn TextEncoder>,
    pub scorer_small: Arc<dyn PairScorer>,
    pub scorer_large: Arc<dyn PairScorer>,
    pub extractor: Arc<dyn SpanExtractor>,
}

impl ModelSet {
    /// Build the full set against a remote inference endpoint.
    pub fn remote(config: &ModelsConfig) -> Result<Self> {
        let endpoint = match &config.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => bail!("models.endpoint must be configured"),
        };
        let client = InferenceClient::new(&endpoint, config)?;
        Ok(Self {
            encoder: Arc::new(client.clone()),
            scorer_small: Arc::new(client.clone().with_scorer_model("small")),
            scorer_large: Arc::new(client.clone().with_scorer_model("large")),
            extractor: Arc::new(client),
        })
    }
}

// ============ HTTP inference client ============

/// Client for the inference sidecar.
#[derive(Clone)]
pub struct InferenceClient {
    base_url: String,
    client: reqwest::Client,
    dims: usize,
    max_retries: u32,
    scorer_model: &'static str,
}

impl InferenceClient {
    pub fn new(base_url: &str, config: &ModelsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base_url: base_url.to_string(),
            client,
            dims: config.dims,
            max_retries: config.max_retries,
            scorer_model: "large",
        })
    }

    fn with_scorer_model(mut self, model: &'static str) -> Self {
        self.scorer_model = model;
        self
    }

    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;

        loop {
            let outcome = self.client.post(&url).json(body).send().await;

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if !retryable {
                        bail!("inference endpoint {} returned {}", url, status);
                    }
                    if attempt >= self.max_retries {
                        bail!(
                            "inference endpoint {} still failing after {} retries ({})",
                            url,
                            attempt,
                            status
                        );
                    }
                    tracing::warn!(%url, %status, attempt, "inference call failed, backing off");
                }
                Err(err) => {
                    if attempt >= self.max_retries {
                        return Err(err.into());
                    }
                    tracing::warn!(%url, %err, attempt, "inference call errored, backing off");
                }
            }

            let backoff = Duration::from_secs(1 << attempt.min(4));
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

#[derive(Serialize)]
struct EncodeRequest<'a> {
    texts: &'a [String],
}

#[derive(Deserialize)]
struct EncodeResponse {
    vectors: Vec<Vec<f32>>,
}

#[async_trait]
impl TextEncoder for InferenceClient {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let response: EncodeResponse = self.post_json("/encode", &EncodeRequest { texts }).await?;
        if response.vectors.len() != texts.len() {
            bail!(
                "inference endpoint returned {} vectors for {} texts",
                response.vectors.len(),
                texts.len()
            );
        }
        Ok(response.vectors)
    }
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    model: &'a str,
    pairs: &'a [(String, String)],
}

#[derive(Deserialize)]
struct ScoreResponse {
    scores: Vec<f32>,
}

#[async_trait]
impl PairScorer for InferenceClient {
    async fn score(&self, pairs: &[(String, String)]) -> Result<Vec<f32>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let response: ScoreResponse = self
            .post_json(
                "/score",
                &ScoreRequest {
                    model: self.scorer_model,
                    pairs,
                },
            )
            .await?;
        if response.scores.len() != pairs.len() {
            bail!(
                "inference endpoint returned {} scores for {} pairs",
                response.scores.len(),
                pairs.len()
            );
        }
        Ok(response.scores)
    }
}

#[derive(Serialize)]
struct AnswerRequest<'a> {
    question: &'a str,
    contexts: &'a [String],
}

#[derive(Deserialize)]
struct AnswerResponse {
    answers: Vec<AnswerSpan>,
}

#[async_trait]
impl SpanExtractor for InferenceClient {
    async fn answer(&self, question: &str, contexts: &[String]) -> Result<Vec<AnswerSpan>> {
        if contexts.is_empty() {
            return Ok(Vec::new());
        }
        let response: AnswerResponse = self
            .post_json("/answer", &AnswerRequest { question, contexts })
            .await?;
        if response.answers.len() != contexts.len() {
            bail!(
                "inference endpoint returned {} answers for {} contexts",
                response.answers.len(),
                contexts.len()
            );
        }
        Ok(response.answers)
    }
}
