use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::{AuxField, Candidate};

/// Turns text into dense vectors of a fixed dimension.
///
/// Implementations must return exactly one vector per input, in input order.
/// Normalization is the caller's job.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Stable identifier recorded in snapshot manifests, e.g. `remote:openai/text-embedding-3-small`.
    fn embedder_id(&self) -> String;

    fn dim(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| Error::EmbeddingFailed("provider returned no vector".into()))
    }
}

#[async_trait]
pub trait QueryRewriter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn rewrite(&self, query: &str) -> Result<String>;
}

/// Read-only view over per-row auxiliary data.
pub trait AuxSource: Send + Sync {
    fn provides(&self, field: AuxField) -> bool;

    /// `None` when the row is unknown or its line cannot be parsed.
    fn field(&self, field: AuxField, row: usize) -> Option<String>;
}

/// An `AuxSource` that provides nothing.
pub struct NoAux;

impl AuxSource for NoAux {
    fn provides(&self, _field: AuxField) -> bool {
        false
    }

    fn field(&self, _field: AuxField, _row: usize) -> Option<String> {
        None
    }
}

#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Auxiliary fields that must be available for `rerank` to run.
    fn required_fields(&self) -> &'static [AuxField] {
        &[]
    }

    /// Reorders `candidates` and returns at most `top_k` of them.
    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<Candidate>,
        top_k: usize,
        aux: &dyn AuxSource,
    ) -> Result<Vec<Candidate>>;
}
