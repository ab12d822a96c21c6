//! Rerankers. `TruncateReranker` keeps retrieval order; `LlmReranker` asks a
//! chat model to order candidates using each project's search text.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt::Write as _;
use tracing::debug;

use rdmap_core::error::{Error, Result};
use rdmap_core::traits::{AuxSource, Reranker};
use rdmap_core::types::{AuxField, Candidate};

use crate::llm::ChatClient;

pub struct TruncateReranker;

#[async_trait]
impl Reranker for TruncateReranker {
    fn name(&self) -> &'static str {
        "truncate"
    }

    async fn rerank(
        &self,
        _query: &str,
        mut candidates: Vec<Candidate>,
        top_k: usize,
        _aux: &dyn AuxSource,
    ) -> Result<Vec<Candidate>> {
        candidates.truncate(top_k);
        Ok(candidates)
    }
}

const RERANK_SYSTEM_PROMPT: &str = "You rank R&D project records by relevance to a search query. \
Reply with JSON only: {\"ranking\": [{\"index\": <candidate number>, \"reason\": \"<one short sentence in the query language>\"}]}, \
most relevant first. Use only the given candidate numbers.";

const DEFAULT_SNIPPET_CHARS: usize = 600;

pub struct LlmReranker {
    client: ChatClient,
    model: String,
    snippet_chars: usize,
}

impl LlmReranker {
    pub fn new(client: ChatClient, model: impl Into<String>) -> Self {
        Self { client, model: model.into(), snippet_chars: DEFAULT_SNIPPET_CHARS }
    }

    pub fn with_snippet_chars(mut self, chars: usize) -> Self {
        self.snippet_chars = chars.max(1);
        self
    }

    fn prompt(&self, query: &str, candidates: &[Candidate], aux: &dyn AuxSource, top_k: usize) -> String {
        let mut out = format!("Query: {query}\nReturn the {top_k} most relevant candidates.\n\nCandidates:\n");
        for (i, c) in candidates.iter().enumerate() {
            let text = aux
                .field(AuxField::SearchText, c.row)
                .unwrap_or_else(|| c.record.title.clone());
            let snippet: String = text.chars().take(self.snippet_chars).collect();
            let _ = writeln!(out, "[{}] ({}, {}) {}", i + 1, c.record.center_name, c.record.year, snippet);
        }
        out
    }
}

#[derive(Debug, Deserialize)]
struct Ranking {
    ranking: Vec<RankedItem>,
}

#[derive(Debug, Deserialize)]
struct RankedItem {
    index: usize,
    #[serde(default)]
    reason: Option<String>,
}

/// Extracts `(zero-based position, reason)` pairs from a model reply.
/// Out-of-range and repeated positions are dropped.
fn parse_ranking(reply: &str, len: usize) -> Result<Vec<(usize, Option<String>)>> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &reply[s..=e],
        _ => return Err(Error::RerankFailed("no JSON object in reply".into())),
    };
    let parsed: Ranking =
        serde_json::from_str(json).map_err(|e| Error::RerankFailed(format!("bad ranking JSON: {e}")))?;
    let mut seen = HashSet::new();
    let ranked: Vec<_> = parsed
        .ranking
        .into_iter()
        .filter(|item| item.index >= 1 && item.index <= len)
        .filter(|item| seen.insert(item.index))
        .map(|item| (item.index - 1, item.reason.filter(|r| !r.trim().is_empty())))
        .collect();
    if ranked.is_empty() {
        return Err(Error::RerankFailed("ranking names no known candidate".into()));
    }
    Ok(ranked)
}

#[async_trait]
impl Reranker for LlmReranker {
    fn name(&self) -> &'static str {
        "llm"
    }

    fn required_fields(&self) -> &'static [AuxField] {
        &[AuxField::SearchText]
    }

    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<Candidate>,
        top_k: usize,
        aux: &dyn AuxSource,
    ) -> Result<Vec<Candidate>> {
        if candidates.is_empty() {
            return Ok(candidates);
        }
        let prompt = self.prompt(query, &candidates, aux, top_k);
        let reply = self
            .client
            .complete(&self.model, RERANK_SYSTEM_PROMPT, &prompt, Some(0.0))
            .await
            .map_err(|e| Error::RerankFailed(e.to_string()))?;
        let ranked = parse_ranking(&reply, candidates.len())?;
        debug!(ranked = ranked.len(), candidates = candidates.len(), "llm ranking parsed");

        let mut slots: Vec<Option<Candidate>> = candidates.into_iter().map(Some).collect();
        let mut out = Vec::with_capacity(top_k);
        for (pos, reason) in ranked {
            if let Some(mut c) = slots[pos].take() {
                c.why_matched = reason;
                out.push(c);
            }
        }
        // Unranked candidates keep retrieval order after the ranked ones.
        out.extend(slots.into_iter().flatten());
        out.truncate(top_k);
        Ok(out)
    }
}
