//! Snapshot directories and the `CURRENT` pointer.
//!
//! ```text
//! <artifacts>/CURRENT                      -> "<snapshot_id>\n"
//! <artifacts>/snapshots/<snapshot_id>/     vectors.rdvi, metadata.jsonl,
//!                                          search_text.jsonl, manifest.json
//! ```
//!
//! A snapshot is staged under `snapshots/.<id>.staging`, renamed into place
//! once every artifact and the manifest are durable, and only then published
//! by flipping `CURRENT`. Readers never observe a partial pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use rdmap_core::corpus::write_line;
use rdmap_core::error::{Error, Result};
use rdmap_core::types::CorpusEntry;

use crate::index::{sync_dir, VectorIndex};
use crate::line_store::{MetadataStore, SearchTextStore};

pub const CURRENT_FILE: &str = "CURRENT";
pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const VECTORS_FILE: &str = "vectors.rdvi";
pub const METADATA_FILE: &str = "metadata.jsonl";
pub const SEARCH_TEXT_FILE: &str = "search_text.jsonl";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub embedder_id: String,
    pub dim: usize,
    pub rows: usize,
    pub placeholders: usize,
    /// File name to blake3 hex digest.
    pub digests: BTreeMap<String, String>,
}

/// Where a loadable snapshot lives. `manifest` is `None` for the legacy
/// loose-pair layout.
#[derive(Debug, Clone)]
pub struct SnapshotPaths {
    pub id: String,
    pub dir: PathBuf,
    pub manifest: Option<Manifest>,
}

impl SnapshotPaths {
    pub fn vectors(&self) -> PathBuf {
        self.dir.join(VECTORS_FILE)
    }

    pub fn metadata(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn search_text(&self) -> PathBuf {
        self.dir.join(SEARCH_TEXT_FILE)
    }
}

/// Everything the serving side needs from one snapshot.
pub struct LoadedSnapshot {
    pub paths: SnapshotPaths,
    pub index: VectorIndex,
    pub metadata: MetadataStore,
    pub search_text: Option<SearchTextStore>,
}

#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    pub mmap: bool,
    pub verify_digests: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self { mmap: true, verify_digests: true }
    }
}

pub fn new_snapshot_id() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%3fZ").to_string()
}

pub fn snapshot_dir(artifacts_dir: &Path, id: &str) -> PathBuf {
    artifacts_dir.join(SNAPSHOTS_DIR).join(id)
}

/// Writes all artifacts of a snapshot, then publishes it via `CURRENT`.
pub fn publish_snapshot(
    artifacts_dir: &Path,
    snapshot_id: &str,
    index: &VectorIndex,
    entries: &[CorpusEntry],
    placeholders: usize,
) -> Result<Manifest> {
    if index.size() != entries.len() {
        return Err(Error::Artifact(format!(
            "index has {} rows but corpus has {}",
            index.size(),
            entries.len()
        )));
    }
    let snapshots = artifacts_dir.join(SNAPSHOTS_DIR);
    fs::create_dir_all(&snapshots)?;
    let final_dir = snapshots.join(snapshot_id);
    if final_dir.exists() {
        return Err(Error::Artifact(format!("snapshot {snapshot_id} already exists")));
    }
    let staging = snapshots.join(format!(".{snapshot_id}.staging"));
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    index.save(&staging.join(VECTORS_FILE))?;
    write_jsonl_synced(&staging.join(METADATA_FILE), entries.iter().map(|e| &e.record))?;
    let texts: Vec<_> = entries.iter().map(CorpusEntry::search_text_line).collect();
    write_jsonl_synced(&staging.join(SEARCH_TEXT_FILE), texts.iter())?;

    let mut digests = BTreeMap::new();
    for name in [VECTORS_FILE, METADATA_FILE, SEARCH_TEXT_FILE] {
        digests.insert(name.to_string(), file_digest(&staging.join(name))?);
    }
    let manifest = Manifest {
        snapshot_id: snapshot_id.to_string(),
        created_at: Utc::now(),
        embedder_id: index.embedder_id().to_string(),
        dim: index.dim(),
        rows: index.size(),
        placeholders,
        digests,
    };
    let manifest_file = File::create(staging.join(MANIFEST_FILE))?;
    let mut w = BufWriter::new(manifest_file);
    serde_json::to_writer_pretty(&mut w, &manifest)?;
    w.flush()?;
    w.into_inner().map_err(|e| Error::Io(e.into_error()))?.sync_all()?;
    sync_dir(&staging)?;

    fs::rename(&staging, &final_dir)?;
    sync_dir(&snapshots)?;
    flip_current(artifacts_dir, snapshot_id)?;
    info!(snapshot = snapshot_id, rows = manifest.rows, dim = manifest.dim, "snapshot published");
    Ok(manifest)
}

fn write_jsonl_synced<'a, T, I>(path: &Path, rows: I) -> Result<()>
where
    T: Serialize + 'a,
    I: Iterator<Item = &'a T>,
{
    let mut w = BufWriter::new(File::create(path)?);
    for row in rows {
        write_line(&mut w, row)?;
    }
    w.flush()?;
    w.into_inner().map_err(|e| Error::Io(e.into_error()))?.sync_all()?;
    Ok(())
}

/// Atomically points `CURRENT` at `snapshot_id`.
pub fn flip_current(artifacts_dir: &Path, snapshot_id: &str) -> Result<()> {
    let tmp = artifacts_dir.join(format!("{CURRENT_FILE}.tmp"));
    {
        let mut f = File::create(&tmp)?;
        writeln!(f, "{snapshot_id}")?;
        f.sync_all()?;
    }
    fs::rename(&tmp, artifacts_dir.join(CURRENT_FILE))?;
    sync_dir(artifacts_dir)?;
    debug!(snapshot = snapshot_id, "CURRENT flipped");
    Ok(())
}

pub fn read_current(artifacts_dir: &Path) -> Result<Option<String>> {
    match fs::read_to_string(artifacts_dir.join(CURRENT_FILE)) {
        Ok(s) => {
            let id = s.trim();
            Ok((!id.is_empty()).then(|| id.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Published snapshot ids, oldest first.
pub fn list_snapshots(artifacts_dir: &Path) -> Result<Vec<String>> {
    let dir = artifacts_dir.join(SNAPSHOTS_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut ids: Vec<String> = fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| !name.starts_with('.'))
        .collect();
    ids.sort();
    Ok(ids)
}

/// Deletes all but the newest `keep` snapshots. The one named by `CURRENT`
/// always survives; `keep == 0` disables pruning. Returns the removed ids.
pub fn prune_snapshots(artifacts_dir: &Path, keep: usize) -> Result<Vec<String>> {
    if keep == 0 {
        return Ok(Vec::new());
    }
    let ids = list_snapshots(artifacts_dir)?;
    let current = read_current(artifacts_dir)?;
    let excess = ids.len().saturating_sub(keep);
    let mut removed = Vec::new();
    for id in ids.into_iter().take(excess) {
        if current.as_deref() == Some(id.as_str()) {
            continue;
        }
        match fs::remove_dir_all(snapshot_dir(artifacts_dir, &id)) {
            Ok(()) => removed.push(id),
            Err(e) => warn!(snapshot = %id, error = %e, "failed to remove old snapshot"),
        }
    }
    if !removed.is_empty() {
        info!(removed = removed.len(), keep, "pruned old snapshots");
    }
    Ok(removed)
}

/// Finds the active snapshot: `CURRENT` first, then a loose
/// `vectors.rdvi` + `metadata.jsonl` pair directly under `artifacts_dir`.
pub fn resolve(artifacts_dir: &Path) -> Result<SnapshotPaths> {
    if let Some(id) = read_current(artifacts_dir)? {
        let dir = snapshot_dir(artifacts_dir, &id);
        let manifest_path = dir.join(MANIFEST_FILE);
        let raw = fs::read(&manifest_path).map_err(|e| {
            Error::IndexUnavailable(format!("snapshot {id}: cannot read manifest: {e}"))
        })?;
        let manifest: Manifest = serde_json::from_slice(&raw)
            .map_err(|e| Error::Artifact(format!("snapshot {id}: bad manifest: {e}")))?;
        return Ok(SnapshotPaths { id, dir, manifest: Some(manifest) });
    }
    if artifacts_dir.join(VECTORS_FILE).is_file() && artifacts_dir.join(METADATA_FILE).is_file() {
        warn!(dir = %artifacts_dir.display(), "no CURRENT pointer; loading loose artifact pair");
        return Ok(SnapshotPaths {
            id: "legacy".to_string(),
            dir: artifacts_dir.to_path_buf(),
            manifest: None,
        });
    }
    Err(Error::IndexUnavailable(format!(
        "no snapshot found under {}",
        artifacts_dir.display()
    )))
}

pub fn verify_digests(paths: &SnapshotPaths) -> Result<()> {
    let Some(manifest) = &paths.manifest else {
        return Ok(());
    };
    for (name, expected) in &manifest.digests {
        let actual = file_digest(&paths.dir.join(name))?;
        if &actual != expected {
            return Err(Error::Artifact(format!(
                "snapshot {}: digest mismatch for {name}",
                paths.id
            )));
        }
    }
    Ok(())
}

pub fn load(artifacts_dir: &Path, opts: LoadOptions) -> Result<LoadedSnapshot> {
    let paths = resolve(artifacts_dir)?;
    if opts.verify_digests {
        verify_digests(&paths)?;
    }
    let index = VectorIndex::load(&paths.vectors(), opts.mmap)?;
    let metadata = MetadataStore::load(&paths.metadata())?;
    let search_text = if paths.search_text().is_file() {
        Some(SearchTextStore::load(&paths.search_text())?)
    } else {
        None
    };
    if let Some(m) = &paths.manifest {
        if m.rows != index.size() || m.dim != index.dim() {
            return Err(Error::Artifact(format!(
                "snapshot {}: manifest says {}x{}, index is {}x{}",
                paths.id,
                m.rows,
                m.dim,
                index.size(),
                index.dim()
            )));
        }
    }
    info!(
        snapshot = %paths.id,
        rows = index.size(),
        dim = index.dim(),
        metadata_rows = metadata.size(),
        mmap = index.is_mmapped(),
        "snapshot loaded"
    );
    Ok(LoadedSnapshot { paths, index, metadata, search_text })
}

fn file_digest(path: &Path) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut file = File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}
