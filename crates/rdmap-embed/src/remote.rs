//! OpenAI-compatible embeddings over HTTP with bearer auth.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use rdmap_core::config::EmbeddingSettings;
use rdmap_core::error::{Error, Result};
use rdmap_core::traits::Embedder;

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

#[derive(Clone)]
pub struct RemoteEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    dim: usize,
}

impl RemoteEmbedder {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: impl Into<String>,
        dim: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(Error::InvalidConfig("embedding API key is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Provider(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.into(),
            api_key,
            dim,
        })
    }

    pub fn from_settings(settings: &EmbeddingSettings) -> Result<Self> {
        let key = settings.api_key.clone().ok_or_else(|| {
            Error::InvalidConfig(format!(
                "remote embeddings need embedding.api_key or {}",
                rdmap_core::config::API_KEY_ENV
            ))
        })?;
        Self::new(
            &settings.base_url,
            settings.model.clone(),
            key,
            settings.dim,
            Duration::from_millis(settings.timeout_ms),
        )
    }

    async fn request(&self, texts: Vec<&str>) -> Result<Vec<Vec<f32>>> {
        let expected = texts.len();
        let body = EmbeddingRequest { model: &self.model, input: texts };
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::EmbeddingFailed(e.without_url().to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            warn!(%status, model = %self.model, "embedding request rejected");
            return Err(Error::EmbeddingFailed(format!("provider returned HTTP {status}")));
        }

        let parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| Error::EmbeddingFailed(format!("unparsable embedding response: {e}")))?;

        if parsed.data.len() != expected {
            return Err(Error::EmbeddingFailed(format!(
                "expected {expected} embeddings, got {}",
                parsed.data.len()
            )));
        }

        let mut items = parsed.data;
        if items.iter().all(|i| i.index.is_some()) {
            items.sort_by_key(|i| i.index);
        }
        items
            .into_iter()
            .map(|i| {
                if i.embedding.len() == self.dim {
                    Ok(i.embedding)
                } else {
                    Err(Error::EmbeddingFailed(format!(
                        "dimension mismatch: expected {}, got {}",
                        self.dim,
                        i.embedding.len()
                    )))
                }
            })
            .collect()
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    fn embedder_id(&self) -> String {
        format!("remote:{}", self.model)
    }

    fn dim(&self) -> usize {
        self.dim
    }

    /// Blank texts are not sent; they map to zero vectors.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = vec![vec![0.0f32; self.dim]; texts.len()];
        let non_empty: Vec<(usize, &str)> = texts
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.trim().is_empty())
            .map(|(i, t)| (i, t.as_str()))
            .collect();
        if non_empty.is_empty() {
            return Ok(out);
        }

        debug!(count = non_empty.len(), model = %self.model, "requesting embeddings");
        let vectors = self.request(non_empty.iter().map(|(_, t)| *t).collect()).await?;
        for ((idx, _), v) in non_empty.into_iter().zip(vectors) {
            out[idx] = v;
        }
        Ok(out)
    }
}
