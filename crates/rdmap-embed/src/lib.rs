//! Embedding providers behind the `rdmap_core::traits::Embedder` capability.
//!
//! - `RemoteEmbedder`: OpenAI-compatible `/embeddings` endpoint (OpenRouter by default).
//! - `LocalEmbedder`: XLM-RoBERTa family model run with candle (feature `local-model`).
//! - `HashEmbedder`: deterministic token hashing for dev and tests.
//! - `MockEmbedder`: scripted vectors and failures for tests.

pub mod hash;
pub mod mock;
pub mod remote;

#[cfg(feature = "local-model")]
pub mod local;

use std::sync::Arc;
use tracing::info;

use rdmap_core::config::{EmbeddingProvider, EmbeddingSettings};
use rdmap_core::error::Result;
use rdmap_core::traits::Embedder;

pub use hash::HashEmbedder;
pub use mock::MockEmbedder;
pub use remote::RemoteEmbedder;

#[cfg(feature = "local-model")]
pub use local::{masked_mean_l2, LocalEmbedder};

/// `APP_USE_FAKE_EMBEDDINGS=1` forces the hashing embedder regardless of settings.
pub fn use_fake_embeddings() -> bool {
    std::env::var("APP_USE_FAKE_EMBEDDINGS")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Builds the configured provider.
pub fn build_embedder(settings: &EmbeddingSettings) -> Result<Arc<dyn Embedder>> {
    if use_fake_embeddings() {
        info!(dim = settings.dim, "using hashing embedder (APP_USE_FAKE_EMBEDDINGS)");
        return Ok(Arc::new(HashEmbedder::new(settings.dim)));
    }
    match settings.provider {
        EmbeddingProvider::Hash => Ok(Arc::new(HashEmbedder::new(settings.dim))),
        EmbeddingProvider::Remote => Ok(Arc::new(RemoteEmbedder::from_settings(settings)?)),
        EmbeddingProvider::Local => build_local(settings),
    }
}

#[cfg(feature = "local-model")]
fn build_local(settings: &EmbeddingSettings) -> Result<Arc<dyn Embedder>> {
    Ok(Arc::new(LocalEmbedder::load(&settings.model_dir, settings.max_len)?))
}

#[cfg(not(feature = "local-model"))]
fn build_local(_settings: &EmbeddingSettings) -> Result<Arc<dyn Embedder>> {
    Err(rdmap_core::error::Error::InvalidConfig(
        "embedding.provider = \"local\" requires the `local-model` feature".into(),
    ))
}
