//! Mock embedder implementation for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rdmap_core::error::{Error, Result};
use rdmap_core::traits::Embedder;

/// Mock embedder that returns configurable vectors and failures.
///
/// # Examples
///
/// ```
/// use rdmap_embed::MockEmbedder;
///
/// // Return a fixed vector
/// let embedder = MockEmbedder::returning(vec![0.1; 8]);
///
/// // Map exact texts to vectors, fall back to zeros
/// let embedder = MockEmbedder::with_mapping(4, [("лазер", vec![1.0, 0.0, 0.0, 0.0])]);
/// ```
#[derive(Clone)]
pub struct MockEmbedder {
    responses: Arc<Vec<Vec<f32>>>,
    mapping: Arc<HashMap<String, Vec<f32>>>,
    fail_texts: Arc<Vec<String>>,
    fail_batches: bool,
    always_fail: bool,
    delay: Option<Duration>,
    call_count: Arc<AtomicUsize>,
    batch_calls: Arc<AtomicUsize>,
    dimensions: usize,
}

impl MockEmbedder {
    fn base(responses: Vec<Vec<f32>>, dimensions: usize) -> Self {
        Self {
            responses: Arc::new(responses),
            mapping: Arc::new(HashMap::new()),
            fail_texts: Arc::new(Vec::new()),
            fail_batches: false,
            always_fail: false,
            delay: None,
            call_count: Arc::new(AtomicUsize::new(0)),
            batch_calls: Arc::new(AtomicUsize::new(0)),
            dimensions,
        }
    }

    /// Create a mock that always returns the same vector.
    pub fn returning(vector: Vec<f32>) -> Self {
        let dims = vector.len();
        Self::base(vec![vector], dims)
    }

    /// Create a mock that returns vectors in sequence, wrapping around.
    pub fn with_sequence(vectors: Vec<Vec<f32>>) -> Self {
        let dims = vectors.first().map_or(8, Vec::len);
        Self::base(vectors, dims)
    }

    /// Exact-text lookup; unmapped texts get a zero vector.
    pub fn with_mapping<S, I>(dimensions: usize, pairs: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = (S, Vec<f32>)>,
    {
        let mut mock = Self::base(vec![vec![0.0; dimensions]], dimensions);
        mock.mapping = Arc::new(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect());
        mock
    }

    /// Every call fails with `EmbeddingFailed`.
    pub fn failing(dimensions: usize) -> Self {
        let mut mock = Self::base(vec![vec![0.0; dimensions]], dimensions);
        mock.always_fail = true;
        mock
    }

    /// Calls with more than one text fail; single-text calls succeed.
    pub fn failing_batches(mut self) -> Self {
        self.fail_batches = true;
        self
    }

    /// Any call containing a text that includes `needle` fails.
    pub fn failing_on(mut self, needle: impl Into<String>) -> Self {
        let mut texts = (*self.fail_texts).clone();
        texts.push(needle.into());
        self.fail_texts = Arc::new(texts);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of texts embedded or attempted.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Number of `embed_batch` invocations.
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.call_count.store(0, Ordering::SeqCst);
        self.batch_calls.store(0, Ordering::SeqCst);
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.mapping.get(text) {
            return v.clone();
        }
        let idx = self.call_count.load(Ordering::SeqCst).saturating_sub(1);
        self.responses[idx % self.responses.len()].clone()
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::returning(vec![0.0; 8])
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn embedder_id(&self) -> String {
        "mock".to_string()
    }

    fn dim(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if self.always_fail {
            return Err(Error::EmbeddingFailed("mock failure".into()));
        }
        if self.fail_batches && texts.len() > 1 {
            return Err(Error::EmbeddingFailed("mock batch failure".into()));
        }
        if let Some(t) = texts
            .iter()
            .find(|t| self.fail_texts.iter().any(|n| t.contains(n.as_str())))
        {
            return Err(Error::EmbeddingFailed(format!("mock refused '{t}'")));
        }

        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            results.push(self.vector_for(text));
        }
        Ok(results)
    }
}
