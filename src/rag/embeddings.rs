use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fastembed::{InitOptionsUserDefined, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel};

use super::provider::EmbeddingProvider;
use crate::error::ProviderError;

const MODEL_FILES: [&str; 5] = [
    "model.onnx",
    "tokenizer.json",
    "config.json",
    "special_tokens_map.json",
    "tokenizer_config.json",
];

/// Fallback provider: an ONNX sentence-embedding model loaded from a local
/// directory and run in-process. The model is loaded lazily on first use so
/// that a build which never falls back pays nothing for it.
pub struct LocalProvider {
    model_dir: PathBuf,
    model_name: String,
    model: tokio::sync::OnceCell<Arc<Mutex<TextEmbedding>>>,
}

fn read_model_file(dir: &Path, name: &str) -> Result<Vec<u8>, ProviderError> {
    std::fs::read(dir.join(name))
        .map_err(|e| ProviderError::Model(format!("Failed to read {}: {}", name, e)))
}

fn load_model(model_dir: &Path) -> Result<TextEmbedding, ProviderError> {
    tracing::info!("Initializing embedding model from {}", model_dir.display());

    let user_model = UserDefinedEmbeddingModel {
        onnx_file: read_model_file(model_dir, "model.onnx")?,
        tokenizer_files: TokenizerFiles {
            tokenizer_file: read_model_file(model_dir, "tokenizer.json")?,
            config_file: read_model_file(model_dir, "config.json")?,
            special_tokens_map_file: read_model_file(model_dir, "special_tokens_map.json")?,
            tokenizer_config_file: read_model_file(model_dir, "tokenizer_config.json")?,
        },
    };

    let model = TextEmbedding::try_new_from_user_defined(user_model, InitOptionsUserDefined::default())
        .map_err(|e| ProviderError::Model(format!("Failed to initialize embedding model: {}", e)))?;

    tracing::info!("Embedding model initialized successfully");
    Ok(model)
}

impl LocalProvider {
    pub fn new(model_dir: impl Into<PathBuf>, model_name: impl Into<String>) -> Self {
        Self {
            model_dir: model_dir.into(),
            model_name: model_name.into(),
            model: tokio::sync::OnceCell::new(),
        }
    }

    async fn model(&self) -> Result<Arc<Mutex<TextEmbedding>>, ProviderError> {
        let model = self
            .model
            .get_or_try_init(|| async {
                let dir = self.model_dir.clone();
                let loaded = tokio::task::spawn_blocking(move || load_model(&dir))
                    .await
                    .map_err(|e| ProviderError::Model(format!("model loader panicked: {}", e)))??;
                Ok::<_, ProviderError>(Arc::new(Mutex::new(loaded)))
            })
            .await?;
        Ok(model.clone())
    }
}

#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn model(&self) -> &str {
        &self.model_name
    }

    fn dimension(&self) -> Option<usize> {
        None
    }

    fn is_available(&self) -> bool {
        MODEL_FILES.iter().all(|f| self.model_dir.join(f).is_file())
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if !self.is_available() {
            return Err(ProviderError::NotConfigured(format!(
                "model directory not found or incomplete: {}",
                self.model_dir.display()
            )));
        }

        let model = self.model().await?;
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || {
            let model = model
                .lock()
                .map_err(|_| ProviderError::Model("embedding model lock poisoned".into()))?;
            model
                .embed(texts, None)
                .map_err(|e| ProviderError::Model(e.to_string()))
        })
        .await
        .map_err(|e| ProviderError::Model(format!("embedding task panicked: {}", e)))?
    }
}
