//! Row-aligned JSON Lines stores with lazy per-row parsing.

use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::OnceLock;

use rdmap_core::error::{Error, Result};
use rdmap_core::types::{Record, SearchText};

/// Line `i` of the file is row `i`. Lines are split once at load and each
/// row is parsed on first access, then cached.
pub struct LineStore<T> {
    bytes: Vec<u8>,
    lines: Vec<(usize, usize)>,
    parsed: Vec<OnceLock<std::result::Result<T, String>>>,
    _marker: PhantomData<fn() -> T>,
}

pub type MetadataStore = LineStore<Record>;
pub type SearchTextStore = LineStore<SearchText>;

impl<T: DeserializeOwned> LineStore<T> {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::IndexUnavailable(format!("cannot read {}: {e}", path.display())))?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let mut lines = Vec::new();
        let mut start = 0;
        for (i, b) in bytes.iter().enumerate() {
            if *b == b'\n' {
                lines.push((start, i));
                start = i + 1;
            }
        }
        if start < bytes.len() {
            lines.push((start, bytes.len()));
        }
        let parsed = (0..lines.len()).map(|_| OnceLock::new()).collect();
        Self { bytes, lines, parsed, _marker: PhantomData }
    }

    pub fn size(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Fails with `RowOutOfRange` for `row < 0` or `row >= size()`, and with
    /// `MalformedRecord` when the line does not parse.
    pub fn get(&self, row: i64) -> Result<&T> {
        let idx = usize::try_from(row)
            .ok()
            .filter(|i| *i < self.lines.len())
            .ok_or(Error::RowOutOfRange { row, size: self.lines.len() })?;
        let slot = self.parsed[idx].get_or_init(|| self.parse(idx));
        slot.as_ref()
            .map_err(|reason| Error::MalformedRecord { row: idx, reason: reason.clone() })
    }

    /// Same as `get` for a row already known to be non-negative.
    pub fn row(&self, row: usize) -> Result<&T> {
        let signed = i64::try_from(row).unwrap_or(i64::MAX);
        self.get(signed)
    }

    fn parse(&self, idx: usize) -> std::result::Result<T, String> {
        let (start, mut end) = self.lines[idx];
        if end > start && self.bytes[end - 1] == b'\r' {
            end -= 1;
        }
        serde_json::from_slice(&self.bytes[start..end]).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_newline_does_not_add_a_row() {
        let store: LineStore<serde_json::Value> = LineStore::from_bytes(b"{}\n{}\n".to_vec());
        assert_eq!(store.size(), 2);
        let store: LineStore<serde_json::Value> = LineStore::from_bytes(b"{}\n{}".to_vec());
        assert_eq!(store.size(), 2);
    }

    #[test]
    fn blank_line_is_a_malformed_row_not_skipped() {
        let store: LineStore<serde_json::Value> = LineStore::from_bytes(b"{}\n\n{\"a\":1}\r\n".to_vec());
        assert_eq!(store.size(), 3);
        assert!(matches!(store.get(1), Err(Error::MalformedRecord { row: 1, .. })));
        assert_eq!(store.get(2).unwrap()["a"], 1);
    }
}
