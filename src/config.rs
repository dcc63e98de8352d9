use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rag::retry::RetryPolicy;

pub const ENV_PREFIX: &str = "RAG";
pub const DEFAULT_CONFIG_FILE: &str = "rag";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub paths: PathSettings,
    pub embedding: EmbeddingSettings,
    pub fallback: FallbackSettings,
    pub index: IndexSettings,
    pub retrieval: RetrievalSettings,
    pub recommendation: RecommendationSettings,
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    pub kb_dir: PathBuf,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    #[serde(default)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub dimension: Option<usize>,
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub timeout_secs: u64,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackSettings {
    pub enabled: bool,
    pub model_dir: PathBuf,
    pub model_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    File,
    Qdrant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSettings {
    pub backend: IndexBackend,
    pub qdrant_url: String,
    pub collection: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSettings {
    pub distance_threshold: f32,
    pub top_k: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationSettings {
    pub top_k: usize,
    pub alpha: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub bind: String,
}

impl Settings {
    /// Defaults, then `rag.toml` (or `path`), then `RAG__SECTION__KEY` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Self::defaults()?;

        builder = match path {
            Some(p) => builder.add_source(config::File::from(p.to_path_buf()).required(true)),
            None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        let mut settings: Settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        if settings.embedding.api_key.is_none() {
            settings.embedding.api_key = std::env::var("OPENAI_API_KEY").ok();
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Built-in defaults rooted at the given directories. No file or
    /// environment overrides are read.
    pub fn with_paths(kb_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut settings: Settings = Self::defaults()?.build()?.try_deserialize()?;
        settings.paths = PathSettings {
            kb_dir: kb_dir.into(),
            data_dir: data_dir.into(),
        };
        Ok(settings)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(config::Config::builder()
            .set_default("paths.kb_dir", "data/kb")?
            .set_default("paths.data_dir", "data")?
            .set_default("embedding.base_url", "https://api.openai.com/v1")?
            .set_default("embedding.model", "text-embedding-3-small")?
            .set_default("embedding.batch_size", 50)?
            .set_default("embedding.max_concurrent_batches", 4)?
            .set_default("embedding.timeout_secs", 30)?
            .set_default("embedding.retry.max_attempts", 3)?
            .set_default("embedding.retry.base_delay_ms", 2000)?
            .set_default("embedding.retry.max_delay_ms", 10000)?
            .set_default("fallback.enabled", true)?
            .set_default("fallback.model_dir", "models/paraphrase-multilingual-MiniLM-L12-v2")?
            .set_default("fallback.model_name", "paraphrase-multilingual-MiniLM-L12-v2")?
            .set_default("index.backend", "file")?
            .set_default("index.qdrant_url", "http://localhost:6334")?
            .set_default("index.collection", "kb_chunks")?
            .set_default("index.chunk_size", 800)?
            .set_default("index.chunk_overlap", 100)?
            .set_default("retrieval.distance_threshold", 1.25)?
            .set_default("retrieval.top_k", 3)?
            .set_default("recommendation.top_k", 3)?
            .set_default("recommendation.alpha", 0.6)?
            .set_default("server.bind", "0.0.0.0:8080")?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding.model.trim().is_empty() {
            return Err(Error::Config("embedding.model must not be empty".into()));
        }
        if self.embedding.batch_size == 0 {
            return Err(Error::Config("embedding.batch_size must be at least 1".into()));
        }
        if self.embedding.max_concurrent_batches == 0 {
            return Err(Error::Config(
                "embedding.max_concurrent_batches must be at least 1".into(),
            ));
        }
        if self.embedding.retry.max_attempts == 0 {
            return Err(Error::Config("embedding.retry.max_attempts must be at least 1".into()));
        }
        if self.index.chunk_size == 0 || self.index.chunk_overlap >= self.index.chunk_size {
            return Err(Error::Config(format!(
                "index.chunk_overlap ({}) must be smaller than index.chunk_size ({})",
                self.index.chunk_overlap, self.index.chunk_size
            )));
        }
        if !(0.0..=1.0).contains(&self.recommendation.alpha) {
            return Err(Error::Config(format!(
                "recommendation.alpha must be within [0, 1], got {}",
                self.recommendation.alpha
            )));
        }
        if self.retrieval.top_k == 0 || self.recommendation.top_k == 0 {
            return Err(Error::Config("top_k values must be at least 1".into()));
        }
        if self.embedding.api_key.is_none() && !self.fallback.enabled {
            return Err(Error::Config(
                "no embedding API key (OPENAI_API_KEY) and the local fallback is disabled".into(),
            ));
        }
        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.paths.data_dir.join("embed_cache")
    }

    pub fn index_path(&self) -> PathBuf {
        self.paths.data_dir.join("vector_index.json")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.paths.data_dir.join("vector_index.manifest.json")
    }

    pub fn doc_embeddings_path(&self) -> PathBuf {
        self.paths.data_dir.join("doc_embeddings.json")
    }

    /// Where `rag-eval` writes its summary and the server reads it from.
    pub fn metrics_summary_path(&self) -> PathBuf {
        self.paths.data_dir.join("metrics_summary.json")
    }
}
