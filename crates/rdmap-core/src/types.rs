//! Domain types shared by the index builder and the search pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type ProjectId = String;

/// Display record for one research project.
///
/// Row `i` of the metadata artifact describes row `i` of the vector index.
/// The correspondence is positional; `project_id` is carried for display and
/// for build-time alignment checks only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub project_id: ProjectId,
    pub center_id: String,
    pub center_name: String,
    pub title: String,
    #[serde(default)]
    pub year: String,
}

/// Build-time text for one project: title, keywords and abstract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchText {
    pub project_id: ProjectId,
    pub search_text: String,
}

/// A record paired with the text that gets embedded for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    pub record: Record,
    pub search_text: String,
}

impl CorpusEntry {
    pub fn search_text_line(&self) -> SearchText {
        SearchText {
            project_id: self.record.project_id.clone(),
            search_text: self.search_text.clone(),
        }
    }
}

/// One row returned by the vector index. Higher `score` is better.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub row: usize,
    pub score: f32,
}

/// A retrieved row joined with its metadata for the lifetime of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub row: usize,
    pub score: f32,
    pub record: Record,
    pub why_matched: Option<String>,
    pub evidence: Vec<String>,
}

/// Auxiliary per-row data a reranker may ask for beyond the display record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxField {
    SearchText,
}

/// Pipeline stages. Used as timing keys and to tag request failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Rewrite,
    Embed,
    Retrieve,
    Join,
    Rerank,
    Respond,
    Request,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Rewrite => "rewrite",
            Stage::Embed => "embed",
            Stage::Retrieve => "retrieve",
            Stage::Join => "join",
            Stage::Rerank => "rerank",
            Stage::Respond => "respond",
            Stage::Request => "request",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEFAULT_TOP_K_CANDIDATES: usize = 50;
pub const DEFAULT_TOP_K_RESULTS: usize = 10;

fn default_top_k_candidates() -> usize {
    DEFAULT_TOP_K_CANDIDATES
}

fn default_top_k_results() -> usize {
    DEFAULT_TOP_K_RESULTS
}

fn default_true() -> bool {
    true
}

/// Query endpoint input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_top_k_candidates")]
    pub top_k_candidates: usize,
    #[serde(default = "default_top_k_results")]
    pub top_k_results: usize,
    #[serde(default = "default_true")]
    pub use_rerank: bool,
    #[serde(default = "default_true")]
    pub use_rewrite: bool,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k_candidates: DEFAULT_TOP_K_CANDIDATES,
            top_k_results: DEFAULT_TOP_K_RESULTS,
            use_rerank: true,
            use_rewrite: true,
        }
    }

    pub fn with_top_k(mut self, candidates: usize, results: usize) -> Self {
        self.top_k_candidates = candidates;
        self.top_k_results = results;
        self
    }

    pub fn with_rewrite(mut self, enabled: bool) -> Self {
        self.use_rewrite = enabled;
        self
    }

    pub fn with_rerank(mut self, enabled: bool) -> Self {
        self.use_rerank = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub project_id: ProjectId,
    pub center_id: String,
    pub center_name: String,
    pub title: String,
    pub year: String,
    pub score: f32,
    pub why_matched: Option<String>,
    pub evidence_snippets: Vec<String>,
}

impl From<Candidate> for SearchResult {
    fn from(c: Candidate) -> Self {
        Self {
            project_id: c.record.project_id,
            center_id: c.record.center_id,
            center_name: c.record.center_name,
            title: c.record.title,
            year: c.record.year,
            score: c.score,
            why_matched: c.why_matched,
            evidence_snippets: c.evidence,
        }
    }
}

/// Query endpoint output. `timings_ms` holds one key per stage that ran plus `total`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query_original: String,
    pub rewritten_query: Option<String>,
    pub timings_ms: BTreeMap<String, f64>,
    pub results: Vec<SearchResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_match_endpoint_contract() {
        let req: SearchRequest = serde_json::from_str(r#"{"query":"лазер"}"#).unwrap();
        assert_eq!(req.top_k_candidates, 50);
        assert_eq!(req.top_k_results, 10);
        assert!(req.use_rerank);
        assert!(req.use_rewrite);
    }

    #[test]
    fn record_year_may_be_missing() {
        let rec: Record = serde_json::from_str(
            r#"{"project_id":"P1","center_id":"C","center_name":"N","title":"T"}"#,
        )
        .unwrap();
        assert_eq!(rec.year, "");
    }

    #[test]
    fn response_serializes_null_rewrite() {
        let resp = SearchResponse {
            query_original: "q".into(),
            rewritten_query: None,
            timings_ms: BTreeMap::new(),
            results: vec![],
        };
        let v = serde_json::to_value(&resp).unwrap();
        assert!(v["rewritten_query"].is_null());
    }
}
