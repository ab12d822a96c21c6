//! Corpus preparation: per-organization JSON files to the row-aligned
//! metadata and search-text JSONL pair consumed by the index builder.

use serde::{Deserialize, Deserializer, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::{CorpusEntry, Record, SearchText};

pub const DEFAULT_STATUS_CUTOFF: &str = "2025-01-01";

#[derive(Debug, Deserialize)]
struct CenterFile {
    #[serde(default, deserialize_with = "string_or_number")]
    ogrn: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    projects: Vec<ProjectCard>,
}

#[derive(Debug, Deserialize)]
struct ProjectCard {
    #[serde(default, deserialize_with = "string_or_number")]
    registration_number: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "abstract")]
    summary: Option<String>,
    #[serde(default)]
    keywords: Option<Vec<String>>,
    #[serde(default)]
    stage_end_date: Option<String>,
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Ok(match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

/// Collapses runs of whitespace to single spaces and trims.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Scans `centers_dir` for `*.json` files in path order and flattens their
/// projects into corpus entries. Unreadable files are logged and skipped;
/// projects without a registration number are dropped.
pub fn prepare_corpus(centers_dir: &Path) -> Result<Vec<CorpusEntry>> {
    if !centers_dir.is_dir() {
        return Err(Error::Artifact(format!(
            "centers directory not found: {}",
            centers_dir.display()
        )));
    }
    let files = list_json_files(centers_dir);
    info!(dir = %centers_dir.display(), files = files.len(), "scanning center files");

    let mut entries = Vec::new();
    for path in &files {
        match read_center(path) {
            Ok(center) => {
                let before = entries.len();
                entries.extend(center_entries(center));
                debug!(file = %path.display(), projects = entries.len() - before, "center processed");
            }
            Err(e) => warn!(file = %path.display(), error = %e, "skipping unreadable center file"),
        }
    }
    info!(projects = entries.len(), "corpus prepared");
    Ok(entries)
}

fn read_center(path: &Path) -> Result<CenterFile> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn center_entries(center: CenterFile) -> impl Iterator<Item = CorpusEntry> {
    let center_id = center.ogrn;
    let center_name = normalize_text(center.name.as_deref().unwrap_or_default());
    center.projects.into_iter().filter_map(move |p| {
        if p.registration_number.is_empty() {
            return None;
        }
        let title = normalize_text(p.name.as_deref().unwrap_or_default());
        let summary = normalize_text(p.summary.as_deref().unwrap_or_default());
        let keywords = p.keywords.unwrap_or_default().join(", ");
        let year = p
            .stage_end_date
            .as_deref()
            .map(|d| d.chars().take(4).collect::<String>())
            .unwrap_or_default();
        let search_text = format!("{title}. {keywords}. {summary}");
        Some(CorpusEntry {
            record: Record {
                project_id: p.registration_number,
                center_id: center_id.clone(),
                center_name: center_name.clone(),
                title,
                year,
            },
            search_text,
        })
    })
}

fn list_json_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
        .collect();
    files.sort();
    files
}

/// Writes the metadata and search-text files in one pass, same line order.
pub fn write_corpus(entries: &[CorpusEntry], metadata_path: &Path, search_text_path: &Path) -> Result<()> {
    let mut meta = BufWriter::new(File::create(metadata_path)?);
    let mut text = BufWriter::new(File::create(search_text_path)?);
    for entry in entries {
        write_line(&mut meta, &entry.record)?;
        write_line(&mut text, &entry.search_text_line())?;
    }
    meta.flush()?;
    text.flush()?;
    Ok(())
}

pub fn write_line<W: Write, T: Serialize>(w: &mut W, value: &T) -> Result<()> {
    serde_json::to_writer(&mut *w, value)?;
    w.write_all(b"\n")?;
    Ok(())
}

/// Reads the prepared pair back. Fails if the files disagree on length or on
/// the `project_id` of any line.
pub fn read_corpus(metadata_path: &Path, search_text_path: &Path) -> Result<Vec<CorpusEntry>> {
    let records: Vec<Record> = read_jsonl(metadata_path)?;
    let texts: Vec<SearchText> = read_jsonl(search_text_path)?;
    if records.len() != texts.len() {
        return Err(Error::Artifact(format!(
            "metadata has {} rows but search text has {}",
            records.len(),
            texts.len()
        )));
    }
    records
        .into_iter()
        .zip(texts)
        .enumerate()
        .map(|(row, (record, text))| {
            if record.project_id != text.project_id {
                return Err(Error::Artifact(format!(
                    "row {row}: metadata project '{}' != search text project '{}'",
                    record.project_id, text.project_id
                )));
            }
            Ok(CorpusEntry { record, search_text: text.search_text })
        })
        .collect()
}

fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .map_err(|e| Error::Artifact(format!("cannot open {}: {e}", path.display())))?;
    let mut out = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value = serde_json::from_str(&line).map_err(|e| {
            Error::Artifact(format!("{}:{}: {e}", path.display(), idx + 1))
        })?;
        out.push(value);
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Completed,
    InProgress,
}

/// Status from a `YYYY-MM-DD` stage end date: lexicographic comparison
/// against `cutoff`. An empty date sorts first and counts as completed.
pub fn project_status(stage_end_date: &str, cutoff: &str) -> ProjectStatus {
    if stage_end_date < cutoff {
        ProjectStatus::Completed
    } else {
        ProjectStatus::InProgress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_text("  a \n\t b  c "), "a b c");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn status_heuristic() {
        assert_eq!(project_status("2024-12-31", DEFAULT_STATUS_CUTOFF), ProjectStatus::Completed);
        assert_eq!(project_status("2025-01-01", DEFAULT_STATUS_CUTOFF), ProjectStatus::InProgress);
        assert_eq!(project_status("", DEFAULT_STATUS_CUTOFF), ProjectStatus::Completed);
    }
}
