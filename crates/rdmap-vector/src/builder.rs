//! Offline index build: corpus -> embeddings -> normalized index -> snapshot.
//!
//! Batches go to the embedder in corpus order. A batch that keeps failing
//! after its retries falls back to one call per item; an item that still
//! fails gets a zero-vector placeholder so rows are never dropped and the
//! index stays aligned with the metadata.

use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use rdmap_core::config::BuildSettings;
use rdmap_core::corpus::read_corpus;
use rdmap_core::error::{Error, Result};
use rdmap_core::traits::Embedder;
use rdmap_core::types::CorpusEntry;
use rdmap_core::vector::l2_normalize;

use crate::index::VectorIndex;
use crate::snapshot::{new_snapshot_id, prune_snapshots, publish_snapshot, Manifest};

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub batch_size: usize,
    pub batch_retries: u32,
    pub retry_backoff: Duration,
    pub item_delay: Duration,
    pub concurrency: usize,
    pub keep_snapshots: usize,
    pub show_progress: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self::from(&BuildSettings::default())
    }
}

impl From<&BuildSettings> for BuildOptions {
    fn from(s: &BuildSettings) -> Self {
        Self {
            batch_size: s.batch_size.max(1),
            batch_retries: s.batch_retries,
            retry_backoff: Duration::from_millis(s.retry_backoff_ms),
            item_delay: Duration::from_millis(s.item_delay_ms),
            concurrency: s.concurrency.max(1),
            keep_snapshots: s.keep_snapshots,
            show_progress: false,
        }
    }
}

/// Normalized vectors in corpus order plus what went wrong producing them.
#[derive(Debug, Clone)]
pub struct EmbeddedCorpus {
    pub vectors: Vec<Vec<f32>>,
    pub placeholder_ids: Vec<String>,
    pub batches_failed: usize,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub snapshot_id: String,
    pub rows: usize,
    pub dim: usize,
    pub batches_failed: usize,
    pub placeholder_ids: Vec<String>,
    pub elapsed: Duration,
    pub manifest: Manifest,
    /// Older snapshots deleted after the flip.
    pub pruned: Vec<String>,
}

struct BatchOutcome {
    vectors: Vec<Vec<f32>>,
    placeholders: Vec<String>,
    failed: bool,
}

pub struct IndexBuilder {
    embedder: Arc<dyn Embedder>,
    options: BuildOptions,
}

impl IndexBuilder {
    pub fn new(embedder: Arc<dyn Embedder>, options: BuildOptions) -> Self {
        Self { embedder, options }
    }

    /// Reads the prepared metadata/search-text pair and builds from it.
    pub async fn build_from_files(
        &self,
        metadata_path: &Path,
        search_text_path: &Path,
        artifacts_dir: &Path,
    ) -> Result<BuildReport> {
        let entries = read_corpus(metadata_path, search_text_path)?;
        self.build(&entries, artifacts_dir).await
    }

    /// Embeds `entries`, writes a new snapshot and flips `CURRENT` to it.
    pub async fn build(&self, entries: &[CorpusEntry], artifacts_dir: &Path) -> Result<BuildReport> {
        let started = Instant::now();
        if entries.is_empty() {
            return Err(Error::Artifact("corpus is empty; nothing to index".into()));
        }
        let embedded = self.embed_corpus(entries).await?;
        let dim = self.embedder.dim();
        let index = VectorIndex::build(dim, self.embedder.embedder_id(), &embedded.vectors)?;

        let snapshot_id = new_snapshot_id();
        let dir = artifacts_dir.to_path_buf();
        let id = snapshot_id.clone();
        let placeholders = embedded.placeholder_ids.len();
        let owned_entries = entries.to_vec();
        let keep = self.options.keep_snapshots;
        let (manifest, pruned) = tokio::task::spawn_blocking(move || {
            let manifest = publish_snapshot(&dir, &id, &index, &owned_entries, placeholders)?;
            Ok::<_, Error>((manifest, prune_snapshots(&dir, keep)?))
        })
        .await
        .map_err(|e| Error::Artifact(format!("snapshot writer panicked: {e}")))??;

        let report = BuildReport {
            snapshot_id,
            rows: entries.len(),
            dim,
            batches_failed: embedded.batches_failed,
            placeholder_ids: embedded.placeholder_ids,
            elapsed: started.elapsed(),
            manifest,
            pruned,
        };
        info!(
            snapshot = %report.snapshot_id,
            rows = report.rows,
            dim = report.dim,
            batches_failed = report.batches_failed,
            placeholders = report.placeholder_ids.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "index build finished"
        );
        Ok(report)
    }

    /// Embeds every entry's search text, in order, and L2-normalizes the result.
    pub async fn embed_corpus(&self, entries: &[CorpusEntry]) -> Result<EmbeddedCorpus> {
        let batches: Vec<&[CorpusEntry]> = entries.chunks(self.options.batch_size).collect();
        let pb = self.progress(batches.len());
        info!(
            rows = entries.len(),
            batches = batches.len(),
            batch_size = self.options.batch_size,
            embedder = %self.embedder.embedder_id(),
            "embedding corpus"
        );

        let outcomes: Vec<BatchOutcome> = stream::iter(batches)
            .map(|batch| {
                let pb = pb.clone();
                async move {
                    let out = self.embed_with_fallback(batch).await;
                    pb.inc(1);
                    out
                }
            })
            .buffered(self.options.concurrency)
            .collect()
            .await;
        pb.finish_and_clear();

        let mut embedded = EmbeddedCorpus {
            vectors: Vec::with_capacity(entries.len()),
            placeholder_ids: Vec::new(),
            batches_failed: 0,
        };
        for outcome in outcomes {
            embedded.batches_failed += usize::from(outcome.failed);
            embedded.placeholder_ids.extend(outcome.placeholders);
            embedded.vectors.extend(outcome.vectors);
        }
        for v in &mut embedded.vectors {
            l2_normalize(v);
        }
        Ok(embedded)
    }

    async fn embed_with_fallback(&self, batch: &[CorpusEntry]) -> BatchOutcome {
        let texts: Vec<String> = batch.iter().map(|e| e.search_text.clone()).collect();
        let attempts = self.options.batch_retries + 1;
        for attempt in 1..=attempts {
            match self.embedder.embed_batch(&texts).await {
                Ok(vectors) if self.shape_ok(&vectors, texts.len()) => {
                    return BatchOutcome { vectors, placeholders: Vec::new(), failed: false };
                }
                Ok(vectors) => warn!(
                    attempt,
                    expected = texts.len(),
                    got = vectors.len(),
                    first_project = %batch[0].record.project_id,
                    "embedding batch returned wrong shape"
                ),
                Err(e) => warn!(
                    attempt,
                    first_project = %batch[0].record.project_id,
                    error = %e,
                    "embedding batch failed"
                ),
            }
            if attempt < attempts {
                tokio::time::sleep(self.options.retry_backoff * attempt).await;
            }
        }

        warn!(size = batch.len(), first_project = %batch[0].record.project_id, "falling back to per-item embedding");
        let dim = self.embedder.dim();
        let mut vectors = Vec::with_capacity(batch.len());
        let mut placeholders = Vec::new();
        for entry in batch {
            match self.embedder.embed(&entry.search_text).await {
                Ok(v) if v.len() == dim => vectors.push(v),
                Ok(v) => {
                    warn!(project_id = %entry.record.project_id, got = v.len(), dim, "wrong dimension; using zero placeholder");
                    vectors.push(vec![0.0; dim]);
                    placeholders.push(entry.record.project_id.clone());
                }
                Err(e) => {
                    warn!(project_id = %entry.record.project_id, error = %e, "item embedding failed; using zero placeholder");
                    vectors.push(vec![0.0; dim]);
                    placeholders.push(entry.record.project_id.clone());
                }
            }
            if !self.options.item_delay.is_zero() {
                tokio::time::sleep(self.options.item_delay).await;
            }
        }
        BatchOutcome { vectors, placeholders, failed: true }
    }

    fn shape_ok(&self, vectors: &[Vec<f32>], expected: usize) -> bool {
        let dim = self.embedder.dim();
        vectors.len() == expected && vectors.iter().all(|v| v.len() == dim)
    }

    fn progress(&self, batches: usize) -> ProgressBar {
        if !self.options.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(batches as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches ({percent}%) {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}
