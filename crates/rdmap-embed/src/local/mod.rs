//! Local XLM-RoBERTa (BGE-M3 style) embedding model run with candle.

mod device;
mod pool;
mod tokenize;

pub use pool::masked_mean_l2;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::xlm_roberta::{Config as XLMRobertaConfig, XLMRobertaModel};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{info, warn};

use rdmap_core::error::{Error, Result};
use rdmap_core::traits::Embedder;

struct Inner {
    model: XLMRobertaModel,
    tokenizer: Tokenizer,
    device: Device,
    max_len: usize,
}

#[derive(Clone)]
pub struct LocalEmbedder {
    inner: Arc<Inner>,
    dim: usize,
    model_dir: PathBuf,
}

impl LocalEmbedder {
    /// Loads `tokenizer.json`, `config.json` and weights (`model.safetensors`
    /// or `pytorch_model.bin`) from `model_dir`.
    pub fn load(model_dir: &Path, max_len: usize) -> Result<Self> {
        Self::try_load(model_dir, max_len).map_err(|e| Error::Provider(format!("{e:#}")))
    }

    fn try_load(model_dir: &Path, max_len: usize) -> anyhow::Result<Self> {
        let device = device::select_device();
        info!(dir = %model_dir.display(), "loading local embedding model");

        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("failed to load tokenizer from {}: {e}", tokenizer_path.display()))?;

        let config_path = model_dir.join("config.json");
        let raw = std::fs::read_to_string(&config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        let config: XLMRobertaConfig = serde_json::from_str(&raw)?;
        let dim = config.hidden_size;

        let safetensors = model_dir.join("model.safetensors");
        let weights: HashMap<String, Tensor> = if safetensors.exists() {
            candle_core::safetensors::load(&safetensors, &device)?
        } else {
            candle_core::pickle::read_all(model_dir.join("pytorch_model.bin"))?
                .into_iter()
                .collect()
        };
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let model = XLMRobertaModel::new(&config, vb)?;
        info!(dim, max_len, "local embedding model loaded");

        Ok(Self {
            inner: Arc::new(Inner { model, tokenizer, device, max_len }),
            dim,
            model_dir: model_dir.to_path_buf(),
        })
    }
}

impl Inner {
    fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let start = Instant::now();
        let (input_ids, attention_mask) =
            tokenize::tokenize_batch(&self.tokenizer, texts, self.max_len, &self.device)?;
        let token_type_ids = Tensor::zeros((texts.len(), self.max_len), DType::I64, &self.device)?;
        let hidden = self
            .model
            .forward(&input_ids, &attention_mask, &token_type_ids, None, None, None)?;
        let pooled = masked_mean_l2(&hidden, &attention_mask)?;
        let out = pooled.to_device(&Device::Cpu)?.to_vec2::<f32>()?;
        let elapsed = start.elapsed();
        if elapsed.as_millis() > 100 * texts.len() as u128 {
            warn!(batch = texts.len(), elapsed_ms = elapsed.as_millis() as u64, "slow embedding batch");
        }
        Ok(out)
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    fn embedder_id(&self) -> String {
        let name = self
            .model_dir
            .file_name()
            .map_or_else(|| "model".to_string(), |n| n.to_string_lossy().into_owned());
        format!("local:{name}")
    }

    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let inner = Arc::clone(&self.inner);
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || inner.embed(&texts))
            .await
            .map_err(|e| Error::EmbeddingFailed(e.to_string()))?
            .map_err(|e| Error::EmbeddingFailed(format!("{e:#}")))
    }
}
