//! Configuration loader, typed settings and path helpers.
//!
//! Uses Figment to merge built-in defaults + `config.toml` + `config.<env>.toml`
//! + `APP_*` env vars (`__` separates nested keys, e.g. `APP_SEARCH__MAX_TOP_K`).
//! Provides helpers to expand `~` and `${VAR}` and to resolve relative paths
//! against a known base directory.
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "openai/text-embedding-3-small";
pub const DEFAULT_CHAT_MODEL: &str = "google/gemini-2.0-flash-lite-preview-02-05:free";
pub const DEFAULT_EVIDENCE_LABEL: &str = "Семантическое сходство";

pub struct Config {
    figment: Figment,
    base_dir: PathBuf,
}

impl Config {
    /// Loads from the current working directory.
    pub fn load() -> anyhow::Result<Self> {
        let cwd = env::current_dir()?;
        Self::load_from(&cwd)
    }

    pub fn load_from(dir: &Path) -> anyhow::Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());

        let mut figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(dir.join("config.toml")));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file(dir.join("config.dev.toml"))),
            "prod" | "production" => figment = figment.merge(Toml::file(dir.join("config.prod.toml"))),
            "test" | "testing" => figment = figment.merge(Toml::file(dir.join("config.test.toml"))),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("APP_").split("__"));

        Ok(Self { figment, base_dir: dir.to_path_buf() })
    }

    /// Wraps an already assembled figment. Relative paths resolve against `base_dir`.
    pub fn from_figment(figment: Figment, base_dir: impl Into<PathBuf>) -> Self {
        Self { figment, base_dir: base_dir.into() }
    }

    pub fn get<T>(&self, key: &str) -> anyhow::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| anyhow::anyhow!("Failed to get '{}': {}", key, e))
    }

    /// Extracts, resolves and validates the full settings tree.
    pub fn settings(&self) -> Result<Settings> {
        let mut settings: Settings = self
            .figment
            .extract()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        settings.resolve(&self.base_dir);
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data: DataSettings,
    pub embedding: EmbeddingSettings,
    pub llm: LlmSettings,
    pub search: SearchSettings,
    pub build: BuildSettings,
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    /// Holds `snapshots/<id>/` and the `CURRENT` pointer.
    pub artifacts_dir: PathBuf,
    /// Per-organization `*.json` files consumed by `prepare`.
    pub centers_dir: PathBuf,
    pub metadata_path: PathBuf,
    pub search_text_path: PathBuf,
    pub verify_digests: bool,
    pub mmap: bool,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            artifacts_dir: PathBuf::from("artifacts"),
            centers_dir: PathBuf::from("data/centers"),
            metadata_path: PathBuf::from("projects_metadata.jsonl"),
            search_text_path: PathBuf::from("projects_search_text.jsonl"),
            verify_digests: true,
            mmap: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    Remote,
    Local,
    Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub provider: EmbeddingProvider,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub dim: usize,
    pub timeout_ms: u64,
    /// Directory with `config.json`, `tokenizer.json` and `model.safetensors` for the local provider.
    pub model_dir: PathBuf,
    pub max_len: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Remote,
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            dim: 1536,
            timeout_ms: 30_000,
            model_dir: PathBuf::from("models/bge-m3"),
            max_len: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerankMode {
    Truncate,
    Llm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    pub rewrite_model: String,
    pub rerank_model: String,
    pub timeout_ms: u64,
    pub rerank: RerankMode,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            rewrite_model: DEFAULT_CHAT_MODEL.to_string(),
            rerank_model: DEFAULT_CHAT_MODEL.to_string(),
            timeout_ms: 20_000,
            rerank: RerankMode::Truncate,
        }
    }
}

impl LlmSettings {
    /// The chat client is only built when enabled and a key is present.
    pub fn is_available(&self) -> bool {
        self.enabled && self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub default_top_k_candidates: usize,
    pub default_top_k_results: usize,
    pub max_top_k: usize,
    pub request_timeout_ms: u64,
    /// Largest tolerated difference between index rows and metadata rows.
    pub max_row_mismatch: usize,
    /// Serve a snapshot whose index was built by a different embedder (warns only).
    pub allow_embedder_mismatch: bool,
    pub evidence_label: String,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_top_k_candidates: crate::types::DEFAULT_TOP_K_CANDIDATES,
            default_top_k_results: crate::types::DEFAULT_TOP_K_RESULTS,
            max_top_k: 500,
            request_timeout_ms: 60_000,
            max_row_mismatch: 0,
            allow_embedder_mismatch: false,
            evidence_label: DEFAULT_EVIDENCE_LABEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    pub batch_size: usize,
    pub batch_retries: u32,
    pub retry_backoff_ms: u64,
    pub item_delay_ms: u64,
    pub concurrency: usize,
    /// Snapshots kept after a build, the active one included. 0 keeps all.
    pub keep_snapshots: usize,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_retries: 2,
            retry_backoff_ms: 500,
            item_delay_ms: 100,
            concurrency: 1,
            keep_snapshots: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8000 }
    }
}

impl Settings {
    fn resolve(&mut self, base: &Path) {
        let data = &mut self.data;
        for p in [
            &mut data.artifacts_dir,
            &mut data.centers_dir,
            &mut data.metadata_path,
            &mut data.search_text_path,
            &mut self.embedding.model_dir,
        ] {
            let resolved = resolve_with_base(base, p.to_string_lossy());
            *p = resolved;
        }

        let shared_key = env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty());
        if self.embedding.api_key.is_none() {
            self.embedding.api_key = shared_key.clone();
        }
        if self.llm.api_key.is_none() {
            self.llm.api_key = shared_key;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.search;
        if s.max_top_k == 0 {
            return Err(Error::InvalidConfig("search.max_top_k must be > 0".into()));
        }
        if s.default_top_k_results == 0
            || s.default_top_k_results > s.default_top_k_candidates
            || s.default_top_k_candidates > s.max_top_k
        {
            return Err(Error::InvalidConfig(format!(
                "search defaults must satisfy 0 < results ({}) <= candidates ({}) <= max_top_k ({})",
                s.default_top_k_results, s.default_top_k_candidates, s.max_top_k
            )));
        }
        if self.embedding.dim == 0 {
            return Err(Error::InvalidConfig("embedding.dim must be > 0".into()));
        }
        if self.build.batch_size == 0 {
            return Err(Error::InvalidConfig("build.batch_size must be > 0".into()));
        }
        if self.build.concurrency == 0 {
            return Err(Error::InvalidConfig("build.concurrency must be >= 1".into()));
        }
        Ok(())
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}
