//! Query pipeline: validate, rewrite, embed, retrieve, join, rerank, respond.
//!
//! Rewrite and rerank are optional and never fail a request; they fall back
//! to their unmodified input. The reranker sees the rewritten query when
//! rewriting succeeded. Embedding failure, a missing index, invalid
//! input and the request deadline are fatal.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use rdmap_core::config::{Settings, DEFAULT_EVIDENCE_LABEL};
use rdmap_core::error::{Error, Result};
use rdmap_core::traits::{AuxSource, Embedder, QueryRewriter, Reranker};
use rdmap_core::types::{Candidate, Hit, SearchRequest, SearchResponse, SearchResult, Stage};
use rdmap_core::vector::l2_normalize;

use crate::rerank::TruncateReranker;
use crate::state::ServiceState;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_top_k: usize,
    pub request_timeout: Duration,
    pub embed_timeout: Duration,
    /// Applies to rewrite and rerank calls each.
    pub llm_timeout: Duration,
    pub evidence_label: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_top_k: 500,
            request_timeout: Duration::from_secs(60),
            embed_timeout: Duration::from_secs(30),
            llm_timeout: Duration::from_secs(20),
            evidence_label: DEFAULT_EVIDENCE_LABEL.to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_top_k: settings.search.max_top_k,
            request_timeout: Duration::from_millis(settings.search.request_timeout_ms),
            embed_timeout: Duration::from_millis(settings.embedding.timeout_ms),
            llm_timeout: Duration::from_millis(settings.llm.timeout_ms),
            evidence_label: settings.search.evidence_label.clone(),
        }
    }
}

/// Per-stage wall time in milliseconds. Only stages that ran get a key.
#[derive(Default)]
struct Timings(BTreeMap<String, f64>);

impl Timings {
    fn record(&mut self, stage: Stage, started: Instant) {
        self.0.insert(stage.as_str().to_string(), ms(started.elapsed()));
    }

    fn finish(mut self, request_started: Instant) -> BTreeMap<String, f64> {
        self.0.insert("total".to_string(), ms(request_started.elapsed()));
        self.0
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

async fn within<F, T>(stage: Stage, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout { stage, after_ms: millis(limit) }),
    }
}

pub struct SearchPipeline {
    embedder: Arc<dyn Embedder>,
    rewriter: Option<Arc<dyn QueryRewriter>>,
    reranker: Arc<dyn Reranker>,
    config: PipelineConfig,
}

impl SearchPipeline {
    /// Pipeline with no rewriter and the truncating reranker.
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            rewriter: None,
            reranker: Arc::new(TruncateReranker),
            config: PipelineConfig::default(),
        }
    }

    pub fn with_rewriter(mut self, rewriter: Option<Arc<dyn QueryRewriter>>) -> Self {
        self.rewriter = rewriter;
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = reranker;
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn has_rewriter(&self) -> bool {
        self.rewriter.is_some()
    }

    pub fn reranker_name(&self) -> &'static str {
        self.reranker.name()
    }

    pub fn validate(&self, req: &SearchRequest) -> Result<()> {
        if req.query.trim().is_empty() {
            return Err(Error::InvalidRequest("query must not be empty".into()));
        }
        if req.top_k_results == 0
            || req.top_k_results > req.top_k_candidates
            || req.top_k_candidates > self.config.max_top_k
        {
            return Err(Error::InvalidRequest(format!(
                "expected 0 < top_k_results ({}) <= top_k_candidates ({}) <= {}",
                req.top_k_results, req.top_k_candidates, self.config.max_top_k
            )));
        }
        Ok(())
    }

    /// Runs one request against `state` under the request deadline.
    pub async fn search(
        &self,
        state: &ServiceState,
        req: &SearchRequest,
    ) -> Result<SearchResponse> {
        let started = Instant::now();
        self.validate(req)?;
        let limit = self.config.request_timeout;
        let res = within(Stage::Request, limit, self.run(state, req, started)).await;
        match &res {
            Ok(resp) => info!(
                query = %req.query,
                results = resp.results.len(),
                rewritten = resp.rewritten_query.is_some(),
                elapsed_ms = ms(started.elapsed()),
                "search completed"
            ),
            Err(e) => warn!(
                query = %req.query,
                stage = e.stage().map_or("-", Stage::as_str),
                error = %e,
                "search failed"
            ),
        }
        res
    }

    async fn run(
        &self,
        state: &ServiceState,
        req: &SearchRequest,
        started: Instant,
    ) -> Result<SearchResponse> {
        let mut timings = Timings::default();
        let index = state
            .index()
            .map_err(|_| Error::IndexUnavailable("no snapshot is loaded".into()))?;
        let metadata = state
            .metadata()
            .map_err(|_| Error::IndexUnavailable("no metadata is loaded".into()))?;
        let query = req.query.trim();

        let rewritten_query = match (&self.rewriter, req.use_rewrite) {
            (Some(rewriter), true) => {
                let t = Instant::now();
                let res =
                    within(Stage::Rewrite, self.config.llm_timeout, rewriter.rewrite(query)).await;
                timings.record(Stage::Rewrite, t);
                match res {
                    Ok(q) => Some(q),
                    Err(e) => {
                        warn!(
                            stage = "rewrite",
                            query,
                            rewriter = rewriter.name(),
                            error = %e,
                            "using original query"
                        );
                        None
                    }
                }
            }
            _ => None,
        };
        let effective = rewritten_query.as_deref().unwrap_or(query);

        let t = Instant::now();
        let embed = self.embedder.embed(effective);
        let mut vector = within(Stage::Embed, self.config.embed_timeout, embed)
            .await
            .map_err(|e| match e {
                Error::EmbeddingFailed(_) | Error::Timeout { .. } => e,
                other => Error::EmbeddingFailed(other.to_string()),
            })?;
        if vector.len() != index.dim() {
            return Err(Error::EmbeddingFailed(format!(
                "query vector has dimension {}, index expects {}",
                vector.len(),
                index.dim()
            )));
        }
        let norm = l2_normalize(&mut vector);
        timings.record(Stage::Embed, t);

        let t = Instant::now();
        let hits: Vec<Hit> = if norm == 0.0 {
            // A zero vector has no direction; every score would tie at 0.
            warn!(
                stage = "retrieve",
                query = effective,
                "query embedding is all zeros, returning no results"
            );
            Vec::new()
        } else {
            index.search(&vector, req.top_k_candidates)?
        };
        timings.record(Stage::Retrieve, t);

        let t = Instant::now();
        let mut candidates = Vec::with_capacity(hits.len());
        for hit in hits {
            match metadata.row(hit.row) {
                Ok(record) => candidates.push(Candidate {
                    row: hit.row,
                    score: hit.score,
                    record: record.clone(),
                    why_matched: None,
                    evidence: vec![format!("{}: {:.4}", self.config.evidence_label, hit.score)],
                }),
                Err(e) if e.is_recoverable() => {
                    warn!(stage = "join", row = hit.row, error = %e, "skipping candidate");
                }
                Err(e) => return Err(e),
            }
        }
        timings.record(Stage::Join, t);

        if req.use_rerank {
            candidates = self
                .rerank(state, effective, candidates, req.top_k_results, &mut timings)
                .await;
        }
        candidates.truncate(req.top_k_results);

        Ok(SearchResponse {
            query_original: req.query.clone(),
            rewritten_query,
            timings_ms: timings.finish(started),
            results: candidates.into_iter().map(SearchResult::from).collect(),
        })
    }

    async fn rerank(
        &self,
        state: &ServiceState,
        query: &str,
        candidates: Vec<Candidate>,
        top_k: usize,
        timings: &mut Timings,
    ) -> Vec<Candidate> {
        let missing: Vec<_> = self
            .reranker
            .required_fields()
            .iter()
            .filter(|f| !state.provides(**f))
            .collect();
        if !missing.is_empty() {
            debug!(
                reranker = self.reranker.name(),
                ?missing,
                "auxiliary data unavailable, skipping rerank"
            );
            return candidates;
        }

        let t = Instant::now();
        let input_rows: HashSet<usize> = candidates.iter().map(|c| c.row).collect();
        let input_len = candidates.len();
        let fallback = candidates.clone();
        let res = within(
            Stage::Rerank,
            self.config.llm_timeout,
            self.reranker.rerank(query, candidates, top_k, state),
        )
        .await
        .and_then(|out| check_rerank_output(out, &input_rows, input_len, top_k));
        timings.record(Stage::Rerank, t);

        match res {
            Ok(out) => out,
            Err(e) => {
                warn!(
                    stage = "rerank",
                    query,
                    reranker = self.reranker.name(),
                    error = %e,
                    "keeping retrieval order"
                );
                fallback
            }
        }
    }
}

/// A reranker may only reorder and drop candidates.
fn check_rerank_output(
    out: Vec<Candidate>,
    input_rows: &HashSet<usize>,
    input_len: usize,
    top_k: usize,
) -> Result<Vec<Candidate>> {
    if out.len() > top_k || out.len() > input_len {
        return Err(Error::RerankFailed(format!(
            "returned {} candidates for top_k {top_k} and {input_len} inputs",
            out.len()
        )));
    }
    let mut seen = HashSet::with_capacity(out.len());
    for c in &out {
        if !input_rows.contains(&c.row) || !seen.insert(c.row) {
            return Err(Error::RerankFailed(format!("unexpected or repeated row {}", c.row)));
        }
    }
    Ok(out)
}
