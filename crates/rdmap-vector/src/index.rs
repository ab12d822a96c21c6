//! Flat exact inner-product index over L2-normalized vectors.
//!
//! On-disk layout (`.rdvi`, little-endian):
//!
//! ```text
//! magic "RDVI" | version u16 | dim u32 | count u32 | id_len u16 | embedder_id bytes
//! zero padding up to a 32-byte boundary
//! count * dim f32 values, row-major
//! ```
//!
//! Row `i` of the slab is row `i` of the metadata store. The slab can be
//! memory-mapped read-only; nothing ever writes through it.

use memmap2::Mmap;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use rdmap_core::error::{Error, Result};
use rdmap_core::types::Hit;
use rdmap_core::vector::dot;

pub const RDVI_MAGIC: [u8; 4] = *b"RDVI";
pub const RDVI_VERSION: u16 = 1;
const FIXED_HEADER_BYTES: usize = 16;
const VECTOR_ALIGN_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdviHeader {
    pub version: u16,
    pub dim: u32,
    pub count: u32,
    pub embedder_id: String,
}

impl RdviHeader {
    fn len_bytes(&self) -> usize {
        FIXED_HEADER_BYTES + self.embedder_id.len()
    }

    fn slab_offset(&self) -> usize {
        align_up(self.len_bytes(), VECTOR_ALIGN_BYTES)
    }

    fn slab_bytes(&self) -> Result<usize> {
        (self.count as usize)
            .checked_mul(self.dim as usize)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| corrupt("vector slab size overflow"))
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let id_len = u16::try_from(self.embedder_id.len())
            .map_err(|_| Error::Artifact("embedder id longer than 65535 bytes".into()))?;
        w.write_all(&RDVI_MAGIC)?;
        w.write_all(&self.version.to_le_bytes())?;
        w.write_all(&self.dim.to_le_bytes())?;
        w.write_all(&self.count.to_le_bytes())?;
        w.write_all(&id_len.to_le_bytes())?;
        w.write_all(self.embedder_id.as_bytes())?;
        let pad = self.slab_offset() - self.len_bytes();
        w.write_all(&vec![0u8; pad])?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut fixed = [0u8; FIXED_HEADER_BYTES];
        r.read_exact(&mut fixed)
            .map_err(|_| corrupt("file shorter than header"))?;
        if fixed[0..4] != RDVI_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = u16::from_le_bytes([fixed[4], fixed[5]]);
        if version != RDVI_VERSION {
            return Err(corrupt(&format!("unsupported version {version}")));
        }
        let dim = u32::from_le_bytes([fixed[6], fixed[7], fixed[8], fixed[9]]);
        let count = u32::from_le_bytes([fixed[10], fixed[11], fixed[12], fixed[13]]);
        let id_len = u16::from_le_bytes([fixed[14], fixed[15]]) as usize;
        let mut id = vec![0u8; id_len];
        r.read_exact(&mut id)
            .map_err(|_| corrupt("truncated embedder id"))?;
        let embedder_id =
            String::from_utf8(id).map_err(|_| corrupt("embedder id is not UTF-8"))?;
        if dim == 0 {
            return Err(corrupt("dimension is zero"));
        }
        Ok(Self { version, dim, count, embedder_id })
    }
}

enum VectorStorage {
    Owned(Vec<f32>),
    Mmap { mmap: Mmap, offset: usize, len: usize },
}

pub struct VectorIndex {
    header: RdviHeader,
    storage: VectorStorage,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("header", &self.header)
            .field("mmapped", &self.is_mmapped())
            .finish()
    }
}

impl VectorIndex {
    /// Builds an in-memory index. Vectors must already be normalized; row
    /// order is kept and duplicates are not collapsed.
    pub fn build(dim: usize, embedder_id: impl Into<String>, vectors: &[Vec<f32>]) -> Result<Self> {
        if dim == 0 {
            return Err(Error::InvalidConfig("index dimension must be > 0".into()));
        }
        let mut slab = Vec::with_capacity(vectors.len() * dim);
        for (row, v) in vectors.iter().enumerate() {
            if v.len() != dim {
                return Err(Error::Artifact(format!(
                    "row {row} has dimension {}, expected {dim}",
                    v.len()
                )));
            }
            slab.extend_from_slice(v);
        }
        Self::from_flat(dim, embedder_id, slab)
    }

    pub fn from_flat(dim: usize, embedder_id: impl Into<String>, slab: Vec<f32>) -> Result<Self> {
        if dim == 0 || slab.len() % dim != 0 {
            return Err(Error::Artifact(format!(
                "slab of {} values is not a multiple of dimension {dim}",
                slab.len()
            )));
        }
        let count = u32::try_from(slab.len() / dim)
            .map_err(|_| Error::Artifact("too many rows for index format".into()))?;
        let dim = u32::try_from(dim)
            .map_err(|_| Error::Artifact("dimension too large for index format".into()))?;
        Ok(Self {
            header: RdviHeader { version: RDVI_VERSION, dim, count, embedder_id: embedder_id.into() },
            storage: VectorStorage::Owned(slab),
        })
    }

    /// Loads an `.rdvi` file, memory-mapping the slab when `mmap` is set.
    pub fn load(path: &Path, mmap: bool) -> Result<Self> {
        if cfg!(target_endian = "big") {
            return Err(Error::Artifact("index load is only supported on little-endian targets".into()));
        }
        let mut file = File::open(path)
            .map_err(|e| Error::IndexUnavailable(format!("cannot open {}: {e}", path.display())))?;
        let file_len = file.metadata()?.len() as usize;
        let header = RdviHeader::read_from(&mut file)?;
        let offset = header.slab_offset();
        let len = header.slab_bytes()?;
        let expected = offset.checked_add(len).ok_or_else(|| corrupt("file size overflow"))?;
        if file_len != expected {
            return Err(corrupt(&format!(
                "file size mismatch (expected {expected}, got {file_len})"
            )));
        }

        let storage = if mmap {
            // SAFETY: the mapping is read-only and snapshot files are never
            // modified in place once published.
            let map = unsafe { Mmap::map(&file)? };
            bytes_as_f32(&map[offset..offset + len])?;
            VectorStorage::Mmap { mmap: map, offset, len }
        } else {
            let bytes = std::fs::read(path)?;
            let slab = bytes[offset..offset + len]
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            VectorStorage::Owned(slab)
        };
        Ok(Self { header, storage })
    }

    /// Writes to `path` through a temp file, fsync and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let temp_path = path.with_extension("rdvi.tmp");
        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            self.write_to(&mut writer)?;
            writer.flush()?;
            writer
                .into_inner()
                .map_err(|e| Error::Io(e.into_error()))?
                .sync_all()?;
        }
        std::fs::rename(&temp_path, path)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            sync_dir(parent)?;
        }
        Ok(())
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        self.header.write_to(w)?;
        for x in self.slab() {
            w.write_all(&x.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.header.count as usize
    }

    pub fn dim(&self) -> usize {
        self.header.dim as usize
    }

    pub fn embedder_id(&self) -> &str {
        &self.header.embedder_id
    }

    pub fn header(&self) -> &RdviHeader {
        &self.header
    }

    pub fn is_mmapped(&self) -> bool {
        matches!(self.storage, VectorStorage::Mmap { .. })
    }

    pub fn vector(&self, row: usize) -> Option<&[f32]> {
        let dim = self.dim();
        let start = row.checked_mul(dim)?;
        self.slab().get(start..start + dim)
    }

    fn slab(&self) -> &[f32] {
        match &self.storage {
            VectorStorage::Owned(v) => v,
            // Alignment and length were checked at load.
            VectorStorage::Mmap { mmap, offset, len } => {
                bytes_as_f32(&mmap[*offset..*offset + *len]).unwrap_or(&[])
            }
        }
    }

    /// Exact top-`k` by descending inner product. Equal scores are ordered by
    /// ascending row. Returns `min(k, size())` hits.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>> {
        if query.len() != self.dim() {
            return Err(Error::InvalidRequest(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dim()
            )));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut heap = BinaryHeap::with_capacity(k + 1);
        for (row, v) in self.slab().chunks_exact(self.dim()).enumerate() {
            heap.push(Reverse(Scored { score: dot(v, query), row }));
            if heap.len() > k {
                heap.pop();
            }
        }

        let mut hits: Vec<Hit> = heap
            .into_iter()
            .map(|Reverse(s)| Hit { row: s.row, score: s.score })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.row.cmp(&b.row)));
        Ok(hits)
    }
}

/// Heap entry where "greater" means a better hit.
#[derive(Debug, Clone, Copy)]
struct Scored {
    score: f32,
    row: usize,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.row.cmp(&self.row))
    }
}

fn corrupt(msg: &str) -> Error {
    Error::Artifact(format!("corrupt vector index: {msg}"))
}

fn align_up(value: usize, align: usize) -> usize {
    let rem = value % align;
    if rem == 0 { value } else { value + (align - rem) }
}

fn bytes_as_f32(bytes: &[u8]) -> Result<&[f32]> {
    if bytes.len() % 4 != 0 {
        return Err(corrupt("slab length is not a multiple of 4"));
    }
    // SAFETY: any bit pattern is a valid f32; length and alignment are checked.
    let (prefix, aligned, suffix) = unsafe { bytes.align_to::<f32>() };
    if !prefix.is_empty() || !suffix.is_empty() {
        return Err(corrupt("slab is not aligned"));
    }
    Ok(aligned)
}

pub(crate) fn sync_dir(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_pads_slab_to_alignment() {
        let h = RdviHeader { version: 1, dim: 3, count: 2, embedder_id: "abc".into() };
        assert_eq!(h.len_bytes(), 19);
        assert_eq!(h.slab_offset(), 32);
        let mut buf = Vec::new();
        h.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), 32);
        let back = RdviHeader::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn ties_prefer_lower_row() {
        let idx = VectorIndex::build(2, "t", &[vec![1.0, 0.0], vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let hits = idx.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits.iter().map(|h| h.row).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn rejects_wrong_query_dimension() {
        let idx = VectorIndex::build(2, "t", &[vec![1.0, 0.0]]).unwrap();
        assert!(matches!(idx.search(&[1.0], 1), Err(Error::InvalidRequest(_))));
    }
}
