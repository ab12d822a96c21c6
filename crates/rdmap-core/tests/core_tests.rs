use std::fs;
use tempfile::TempDir;

use async_trait::async_trait;
use figment::{providers::Serialized, Figment};
use rdmap_core::config::{Config, EmbeddingProvider, Settings};
use rdmap_core::corpus::{prepare_corpus, read_corpus, write_corpus};
use rdmap_core::error::{Error, Result};
use rdmap_core::traits::Embedder;

const CENTER_A: &str = r#"{
  "ogrn": "1027700000001",
  "name": "  Институт   лазерной физики ",
  "projects": [
    {"registration_number": "P1", "name": "Лазерная  сварка", "abstract": "Сварка\nметаллов", "keywords": ["лазер", "сварка"], "stage_end_date": "2023-06-30"},
    {"registration_number": "", "name": "без номера"},
    {"registration_number": "P2", "name": "Оптика", "abstract": null, "keywords": null}
  ]
}"#;

const CENTER_B: &str = r#"{"ogrn": 1027700000002, "name": "Центр Б", "projects": [
  {"registration_number": "P3", "name": "Катализ", "abstract": "Химия", "keywords": [], "stage_end_date": "2026-01-01"}
]}"#;

#[test]
fn prepare_corpus_flattens_centers_in_file_order() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("b.json"), CENTER_B).unwrap();
    fs::write(tmp.path().join("a.json"), CENTER_A).unwrap();
    fs::write(tmp.path().join("broken.json"), "{not json").unwrap();
    fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

    let entries = prepare_corpus(tmp.path()).expect("prepare");
    let ids: Vec<_> = entries.iter().map(|e| e.record.project_id.as_str()).collect();
    assert_eq!(ids, ["P1", "P2", "P3"]);

    let p1 = &entries[0];
    assert_eq!(p1.record.center_id, "1027700000001");
    assert_eq!(p1.record.center_name, "Институт лазерной физики");
    assert_eq!(p1.record.title, "Лазерная сварка");
    assert_eq!(p1.record.year, "2023");
    assert_eq!(p1.search_text, "Лазерная сварка. лазер, сварка. Сварка металлов");

    assert_eq!(entries[1].record.year, "");
    assert_eq!(entries[1].search_text, "Оптика. . ");
    assert_eq!(entries[2].record.center_id, "1027700000002");
}

#[test]
fn written_corpus_reads_back_row_aligned() {
    let tmp = TempDir::new().unwrap();
    let centers = tmp.path().join("centers");
    fs::create_dir(&centers).unwrap();
    fs::write(centers.join("a.json"), CENTER_A).unwrap();

    let entries = prepare_corpus(&centers).unwrap();
    let meta = tmp.path().join("meta.jsonl");
    let text = tmp.path().join("text.jsonl");
    write_corpus(&entries, &meta, &text).unwrap();

    let back = read_corpus(&meta, &text).unwrap();
    assert_eq!(back, entries);
    let raw = fs::read_to_string(&meta).unwrap();
    assert!(raw.contains("Лазерная сварка"), "UTF-8 kept unescaped");
}

#[test]
fn read_corpus_rejects_misaligned_pair() {
    let tmp = TempDir::new().unwrap();
    let meta = tmp.path().join("meta.jsonl");
    let text = tmp.path().join("text.jsonl");
    fs::write(
        &meta,
        "{\"project_id\":\"P1\",\"center_id\":\"c\",\"center_name\":\"n\",\"title\":\"t\",\"year\":\"\"}\n",
    )
    .unwrap();
    fs::write(&text, "{\"project_id\":\"P9\",\"search_text\":\"x\"}\n").unwrap();

    let err = read_corpus(&meta, &text).unwrap_err();
    assert!(matches!(err, Error::Artifact(_)), "got {err:?}");
}

#[test]
fn prepare_corpus_missing_dir_is_artifact_error() {
    let tmp = TempDir::new().unwrap();
    let err = prepare_corpus(&tmp.path().join("nope")).unwrap_err();
    assert!(matches!(err, Error::Artifact(_)));
}

#[test]
fn settings_defaults_validate_and_resolve_paths() {
    let tmp = TempDir::new().unwrap();
    let figment = Figment::from(Serialized::defaults(Settings::default()));
    let settings = Config::from_figment(figment, tmp.path()).settings().unwrap();

    assert_eq!(settings.search.max_top_k, 500);
    assert_eq!(settings.search.default_top_k_candidates, 50);
    assert_eq!(settings.build.batch_size, 100);
    assert_eq!(settings.embedding.provider, EmbeddingProvider::Remote);
    assert_eq!(settings.data.artifacts_dir, tmp.path().join("artifacts"));
}

#[test]
fn settings_reject_inverted_top_k_defaults() {
    let tmp = TempDir::new().unwrap();
    let figment = Figment::from(Serialized::defaults(Settings::default()))
        .merge(Serialized::default("search.default_top_k_results", 80));
    let err = Config::from_figment(figment, tmp.path()).settings().unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[test]
fn config_file_overrides_defaults() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("config.toml"),
        "[embedding]\nprovider = \"hash\"\ndim = 64\n\n[server]\nport = 9100\n",
    )
    .unwrap();
    let config = Config::load_from(tmp.path()).unwrap();
    let settings = config.settings().unwrap();
    assert_eq!(settings.embedding.provider, EmbeddingProvider::Hash);
    assert_eq!(settings.embedding.dim, 64);
    assert_eq!(settings.server.port, 9100);
    let port: u16 = config.get("server.port").unwrap();
    assert_eq!(port, 9100);
}

struct Doubler;

#[async_trait]
impl Embedder for Doubler {
    fn embedder_id(&self) -> String {
        "test:doubler".into()
    }
    fn dim(&self) -> usize {
        1
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| vec![t.len() as f32 * 2.0]).collect())
    }
}

#[tokio::test]
async fn default_single_embed_delegates_to_batch() {
    let v = Doubler.embed("abc").await.unwrap();
    assert_eq!(v, vec![6.0]);
}
