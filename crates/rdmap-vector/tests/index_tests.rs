use std::fs;
use tempfile::TempDir;

use rdmap_core::error::Error;
use rdmap_core::types::Record;
use rdmap_core::vector::{dot, normalized};
use rdmap_vector::{MetadataStore, VectorIndex};

fn sample_vectors() -> Vec<Vec<f32>> {
    vec![
        normalized(vec![1.0, 0.0, 0.0]),
        normalized(vec![0.8, 0.6, 0.0]),
        normalized(vec![0.0, 1.0, 0.0]),
        normalized(vec![0.0, 0.0, 1.0]),
        normalized(vec![0.6, 0.8, 0.0]),
    ]
}

#[test]
fn search_scores_are_non_increasing_and_prefix_monotone() {
    let idx = VectorIndex::build(3, "test", &sample_vectors()).unwrap();
    let q = normalized(vec![0.9, 0.4, 0.1]);

    let full = idx.search(&q, 5).unwrap();
    assert_eq!(full.len(), 5);
    for pair in full.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    for k in 1..=5 {
        let top = idx.search(&q, k).unwrap();
        assert_eq!(top, full[..k].to_vec(), "top-{k} is a prefix of top-5");
    }
    assert_eq!(idx.search(&q, 50).unwrap().len(), 5, "k larger than size returns everything");
    assert!(idx.search(&q, 0).unwrap().is_empty());
}

#[test]
fn self_inner_product_is_one() {
    let vectors = sample_vectors();
    let idx = VectorIndex::build(3, "test", &vectors).unwrap();
    for (row, v) in vectors.iter().enumerate() {
        let hit = idx.search(v, 1).unwrap()[0];
        assert!((hit.score - 1.0).abs() < 1e-5);
        assert!((dot(idx.vector(row).unwrap(), v) - 1.0).abs() < 1e-5);
    }
}

#[test]
fn save_and_load_with_and_without_mmap() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("vectors.rdvi");
    let idx = VectorIndex::build(3, "remote:model", &sample_vectors()).unwrap();
    idx.save(&path).unwrap();
    assert!(!tmp.path().join("vectors.rdvi.tmp").exists());

    let q = normalized(vec![0.2, 0.9, 0.1]);
    let expected = idx.search(&q, 3).unwrap();
    for mmap in [true, false] {
        let loaded = VectorIndex::load(&path, mmap).unwrap();
        assert_eq!(loaded.is_mmapped(), mmap);
        assert_eq!(loaded.size(), 5);
        assert_eq!(loaded.dim(), 3);
        assert_eq!(loaded.embedder_id(), "remote:model");
        assert_eq!(loaded.search(&q, 3).unwrap(), expected);
    }
}

#[test]
fn load_rejects_truncated_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("vectors.rdvi");
    VectorIndex::build(3, "x", &sample_vectors()).unwrap().save(&path).unwrap();
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();
    assert!(matches!(VectorIndex::load(&path, true), Err(Error::Artifact(_))));

    fs::write(&path, b"NOPE").unwrap();
    assert!(matches!(VectorIndex::load(&path, false), Err(Error::Artifact(_))));
}

#[test]
fn build_rejects_ragged_vectors() {
    let err = VectorIndex::build(3, "x", &[vec![1.0, 0.0, 0.0], vec![1.0]]).unwrap_err();
    assert!(matches!(err, Error::Artifact(_)));
}

fn record_line(id: &str) -> String {
    format!(r#"{{"project_id":"{id}","center_id":"c","center_name":"Центр","title":"Проект {id}","year":"2024"}}"#)
}

#[test]
fn metadata_store_bounds_and_malformed_rows() {
    let body = format!("{}\n{{broken\n{}\n", record_line("P1"), record_line("P3"));
    let store = MetadataStore::from_bytes(body.into_bytes());
    assert_eq!(store.size(), 3);

    let r: &Record = store.get(0).unwrap();
    assert_eq!(r.project_id, "P1");
    assert_eq!(r.center_name, "Центр");
    assert_eq!(r.year, "2024");

    assert!(matches!(store.get(1), Err(Error::MalformedRecord { row: 1, .. })));
    assert_eq!(store.get(2).unwrap().project_id, "P3");
    assert!(matches!(store.get(3), Err(Error::RowOutOfRange { row: 3, size: 3 })));
    assert!(matches!(store.get(-1), Err(Error::RowOutOfRange { row: -1, size: 3 })));
}

#[test]
fn metadata_store_load_missing_file_is_unavailable() {
    let tmp = TempDir::new().unwrap();
    let err = MetadataStore::load(&tmp.path().join("missing.jsonl")).err().unwrap();
    assert!(err.is_service_unavailable());
}
