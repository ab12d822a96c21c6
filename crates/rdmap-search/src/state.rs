//! Immutable per-snapshot serving state and the pointer that swaps it.

use parking_lot::RwLock;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use rdmap_core::error::{Error, Result};
use rdmap_core::traits::AuxSource;
use rdmap_core::types::AuxField;
use rdmap_vector::snapshot::{self, LoadOptions, LoadedSnapshot};
use rdmap_vector::{MetadataStore, SearchTextStore, VectorIndex};

/// Everything one request reads. Built once per snapshot and never mutated.
pub struct ServiceState {
    index: Option<VectorIndex>,
    metadata: Option<MetadataStore>,
    search_text: Option<SearchTextStore>,
    snapshot_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StateInfo {
    pub ready: bool,
    pub snapshot_id: Option<String>,
    pub rows: usize,
    pub dim: usize,
    pub metadata_rows: usize,
    pub embedder_id: Option<String>,
    pub search_text: bool,
}

impl ServiceState {
    /// State with no index. Every search fails with `IndexUnavailable`.
    pub fn empty() -> Self {
        Self { index: None, metadata: None, search_text: None, snapshot_id: None }
    }

    /// Assembles a state from parts, checking row alignment.
    pub fn new(
        index: VectorIndex,
        metadata: MetadataStore,
        search_text: Option<SearchTextStore>,
        snapshot_id: impl Into<String>,
        max_row_mismatch: usize,
    ) -> Result<Self> {
        let snapshot_id = snapshot_id.into();
        check_alignment(&snapshot_id, "metadata", index.size(), metadata.size(), max_row_mismatch)?;
        let search_text = match search_text {
            Some(st) if st.size() != index.size() => {
                // Aux text only feeds the reranker; misaligned text is dropped, not fatal.
                warn!(
                    snapshot = %snapshot_id,
                    index_rows = index.size(),
                    search_text_rows = st.size(),
                    "search text is not row-aligned with the index, ignoring it"
                );
                None
            }
            other => other,
        };
        Ok(Self {
            index: Some(index),
            metadata: Some(metadata),
            search_text,
            snapshot_id: Some(snapshot_id),
        })
    }

    pub fn from_snapshot(snapshot: LoadedSnapshot, max_row_mismatch: usize) -> Result<Self> {
        let LoadedSnapshot { paths, index, metadata, search_text } = snapshot;
        Self::new(index, metadata, search_text, paths.id, max_row_mismatch)
    }

    pub fn load(artifacts_dir: &Path, opts: LoadOptions, max_row_mismatch: usize) -> Result<Self> {
        let snapshot = snapshot::load(artifacts_dir, opts)?;
        Self::from_snapshot(snapshot, max_row_mismatch)
    }

    pub fn index(&self) -> Result<&VectorIndex> {
        self.index.as_ref().ok_or(Error::IndexNotLoaded)
    }

    pub fn metadata(&self) -> Result<&MetadataStore> {
        self.metadata.as_ref().ok_or(Error::IndexNotLoaded)
    }

    pub fn snapshot_id(&self) -> Option<&str> {
        self.snapshot_id.as_deref()
    }

    pub fn info(&self) -> StateInfo {
        StateInfo {
            ready: self.index.is_some() && self.metadata.is_some(),
            snapshot_id: self.snapshot_id.clone(),
            rows: self.index.as_ref().map_or(0, VectorIndex::size),
            dim: self.index.as_ref().map_or(0, VectorIndex::dim),
            metadata_rows: self.metadata.as_ref().map_or(0, MetadataStore::size),
            embedder_id: self.index.as_ref().map(|i| i.embedder_id().to_string()),
            search_text: self.search_text.is_some(),
        }
    }

    /// Checks that queries will be embedded by the model that built the index.
    /// Equal dimensions alone do not make two embedding spaces comparable.
    pub fn check_embedder(&self, query_embedder: &str, allow_mismatch: bool) -> Result<()> {
        let Some(index) = &self.index else {
            return Ok(());
        };
        if index.embedder_id() == query_embedder {
            return Ok(());
        }
        let snapshot = self.snapshot_id.as_deref().unwrap_or("-");
        if allow_mismatch {
            warn!(
                snapshot,
                index_embedder = index.embedder_id(),
                query_embedder,
                "serving a snapshot built with a different embedder"
            );
            return Ok(());
        }
        Err(Error::IndexUnavailable(format!(
            "snapshot {snapshot} was built with embedder {}, queries use {query_embedder}",
            index.embedder_id()
        )))
    }
}

fn check_alignment(
    snapshot: &str,
    what: &str,
    rows: usize,
    other: usize,
    tolerance: usize,
) -> Result<()> {
    if rows == other {
        return Ok(());
    }
    let diff = rows.abs_diff(other);
    warn!(snapshot, index_rows = rows, store_rows = other, store = what, "row count mismatch");
    if diff > tolerance {
        return Err(Error::IndexUnavailable(format!(
            "snapshot {snapshot}: index has {rows} rows, {what} has {other} (tolerance {tolerance})"
        )));
    }
    Ok(())
}

impl AuxSource for ServiceState {
    fn provides(&self, field: AuxField) -> bool {
        match field {
            AuxField::SearchText => self.search_text.is_some(),
        }
    }

    fn field(&self, field: AuxField, row: usize) -> Option<String> {
        match field {
            AuxField::SearchText => self
                .search_text
                .as_ref()
                .and_then(|st| st.row(row).ok())
                .map(|t| t.search_text.clone()),
        }
    }
}

/// Current `ServiceState`. Readers clone the `Arc` and drop the lock at once,
/// so a reload never waits on in-flight requests.
pub struct SharedState {
    inner: RwLock<Arc<ServiceState>>,
}

impl SharedState {
    pub fn new(state: ServiceState) -> Self {
        Self { inner: RwLock::new(Arc::new(state)) }
    }

    pub fn current(&self) -> Arc<ServiceState> {
        self.inner.read().clone()
    }

    /// Installs `state` and returns the previous one.
    pub fn swap(&self, state: ServiceState) -> Arc<ServiceState> {
        let next = Arc::new(state);
        let prev = std::mem::replace(&mut *self.inner.write(), next);
        info!(
            from = prev.snapshot_id().unwrap_or("-"),
            to = self.current().snapshot_id().unwrap_or("-"),
            "service state swapped"
        );
        prev
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new(ServiceState::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(rows: usize) -> VectorIndex {
        let vectors: Vec<Vec<f32>> = (0..rows).map(|_| vec![1.0, 0.0]).collect();
        VectorIndex::build(2, "test", &vectors).unwrap()
    }

    fn metadata(rows: usize) -> MetadataStore {
        let mut bytes = Vec::new();
        for i in 0..rows {
            bytes.extend_from_slice(
                format!(r#"{{"project_id":"P{i}","center_id":"C","center_name":"N","title":"T"}}"#)
                    .as_bytes(),
            );
            bytes.push(b'\n');
        }
        MetadataStore::from_bytes(bytes)
    }

    #[test]
    fn mismatch_within_tolerance_is_served() {
        let state = ServiceState::new(index(3), metadata(2), None, "s1", 1).unwrap();
        assert!(state.info().ready);
        assert_eq!(state.info().metadata_rows, 2);
    }

    #[test]
    fn mismatch_beyond_tolerance_is_refused() {
        let err = ServiceState::new(index(3), metadata(2), None, "s1", 0).err().unwrap();
        assert!(err.is_service_unavailable());
    }

    #[test]
    fn foreign_embedder_is_refused_unless_allowed() {
        let state = ServiceState::new(index(1), metadata(1), None, "s1", 0).unwrap();
        assert!(state.check_embedder("test", false).is_ok());

        let err = state.check_embedder("hash:xxh64:2", false).unwrap_err();
        assert!(err.is_service_unavailable(), "got {err:?}");
        assert!(state.check_embedder("hash:xxh64:2", true).is_ok());
        assert!(ServiceState::empty().check_embedder("anything", false).is_ok());
    }

    #[test]
    fn empty_state_reports_not_loaded() {
        let state = ServiceState::empty();
        assert!(matches!(state.index(), Err(Error::IndexNotLoaded)));
        assert!(!state.info().ready);
        assert!(!state.provides(AuxField::SearchText));
    }

    #[test]
    fn swap_keeps_old_state_alive_for_holders() {
        let shared = SharedState::default();
        let held = shared.current();
        shared.swap(ServiceState::new(index(1), metadata(1), None, "s2", 0).unwrap());
        assert!(held.snapshot_id().is_none());
        assert_eq!(shared.current().snapshot_id(), Some("s2"));
    }
}
