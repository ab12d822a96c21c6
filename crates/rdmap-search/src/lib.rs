//! Semantic search over the R&D project corpus.
//!
//! `SearchService` owns a `SearchPipeline` and the swappable `ServiceState`.
//! Requests take a snapshot of the state pointer up front, so a reload never
//! changes the index or metadata under a running request.

pub mod llm;
pub mod pipeline;
pub mod rerank;
pub mod rewrite;
pub mod state;

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use rdmap_core::config::{RerankMode, Settings};
use rdmap_core::error::Result;
use rdmap_core::traits::{Embedder, QueryRewriter, Reranker};
use rdmap_core::types::{SearchRequest, SearchResponse};
use rdmap_vector::LoadOptions;

pub use llm::ChatClient;
pub use pipeline::{PipelineConfig, SearchPipeline};
pub use rerank::{LlmReranker, TruncateReranker};
pub use rewrite::LlmRewriter;
pub use state::{ServiceState, SharedState, StateInfo};

/// Where and how the service (re)loads snapshots.
#[derive(Debug, Clone)]
pub struct StateSource {
    pub artifacts_dir: PathBuf,
    pub load: LoadOptions,
    pub max_row_mismatch: usize,
    pub allow_embedder_mismatch: bool,
}

impl StateSource {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            artifacts_dir: settings.data.artifacts_dir.clone(),
            load: LoadOptions {
                mmap: settings.data.mmap,
                verify_digests: settings.data.verify_digests,
            },
            max_row_mismatch: settings.search.max_row_mismatch,
            allow_embedder_mismatch: settings.search.allow_embedder_mismatch,
        }
    }

    pub fn load(&self) -> Result<ServiceState> {
        ServiceState::load(&self.artifacts_dir, self.load, self.max_row_mismatch)
    }

    /// Loads the current snapshot and checks it was built by `query_embedder`.
    pub fn load_for(&self, query_embedder: &str) -> Result<ServiceState> {
        let state = self.load()?;
        state.check_embedder(query_embedder, self.allow_embedder_mismatch)?;
        Ok(state)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
    #[serde(flatten)]
    pub state: StateInfo,
    /// Embedder serving queries; `state.embedder_id` is the one the index was built with.
    pub embedder: String,
    pub rewrite: bool,
    pub reranker: &'static str,
}

pub struct SearchService {
    pipeline: SearchPipeline,
    state: SharedState,
    source: Option<StateSource>,
}

impl SearchService {
    pub fn new(pipeline: SearchPipeline, state: ServiceState) -> Self {
        Self { pipeline, state: SharedState::new(state), source: None }
    }

    pub fn with_source(mut self, source: StateSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Wires providers from settings and loads the current snapshot.
    ///
    /// A missing or unreadable snapshot is not fatal here: the service starts
    /// empty, reports itself not ready and answers searches with
    /// `IndexUnavailable` until a reload succeeds.
    pub fn from_settings(settings: &Settings, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let pipeline = build_pipeline(settings, embedder)?;
        let source = StateSource::from_settings(settings);
        let state = match source.load_for(&pipeline.embedder().embedder_id()) {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    artifacts = %source.artifacts_dir.display(),
                    error = %e,
                    "starting without a snapshot"
                );
                ServiceState::empty()
            }
        };
        Ok(Self::new(pipeline, state).with_source(source))
    }

    pub async fn search(&self, req: &SearchRequest) -> Result<SearchResponse> {
        let state = self.state.current();
        self.pipeline.search(&state, req).await
    }

    /// Loads the snapshot named by `CURRENT` and swaps it in. The old state
    /// stays live until in-flight requests drop it.
    pub async fn reload(&self) -> Result<StateInfo> {
        let Some(source) = self.source.clone() else {
            return Err(rdmap_core::Error::InvalidConfig("service has no snapshot source".into()));
        };
        let query_embedder = self.pipeline.embedder().embedder_id();
        let state = tokio::task::spawn_blocking(move || source.load_for(&query_embedder))
            .await
            .map_err(|e| rdmap_core::Error::Artifact(format!("reload task failed: {e}")))??;
        let info = state.info();
        self.state.swap(state);
        info!(snapshot = info.snapshot_id.as_deref().unwrap_or("-"), rows = info.rows, "reloaded");
        Ok(info)
    }

    /// Installs an already built state.
    pub fn replace_state(&self, state: ServiceState) {
        self.state.swap(state);
    }

    pub fn pipeline(&self) -> &SearchPipeline {
        &self.pipeline
    }

    pub fn health(&self) -> Health {
        let info = self.state.current().info();
        Health {
            status: if info.ready { "ok" } else { "not_ready" },
            state: info,
            embedder: self.pipeline.embedder().embedder_id(),
            rewrite: self.pipeline.has_rewriter(),
            reranker: self.pipeline.reranker_name(),
        }
    }
}

/// Builds the pipeline with the rewriter and reranker the settings ask for.
/// LLM stages are left out when no chat client can be configured.
pub fn build_pipeline(settings: &Settings, embedder: Arc<dyn Embedder>) -> Result<SearchPipeline> {
    let chat = ChatClient::from_settings(&settings.llm)?;
    let rewriter: Option<Arc<dyn QueryRewriter>> = chat.clone().map(|c| {
        Arc::new(LlmRewriter::new(c, settings.llm.rewrite_model.clone())) as Arc<dyn QueryRewriter>
    });
    let reranker: Arc<dyn Reranker> = match (settings.llm.rerank, chat) {
        (RerankMode::Llm, Some(c)) => {
            Arc::new(LlmReranker::new(c, settings.llm.rerank_model.clone()))
        }
        (RerankMode::Llm, None) => {
            warn!("llm rerank requested but no chat provider is configured, truncating instead");
            Arc::new(TruncateReranker)
        }
        (RerankMode::Truncate, _) => Arc::new(TruncateReranker),
    };
    info!(
        embedder = %embedder.embedder_id(),
        rewrite = rewriter.is_some(),
        reranker = reranker.name(),
        "search pipeline configured"
    );
    Ok(SearchPipeline::new(embedder)
        .with_rewriter(rewriter)
        .with_reranker(reranker)
        .with_config(PipelineConfig::from_settings(settings)))
}
