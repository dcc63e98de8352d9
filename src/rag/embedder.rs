use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};

use super::cache::EmbeddingCache;
use super::provider::EmbeddingProvider;
use super::retry::RetryPolicy;
use crate::error::{Error, ProviderError, Result};

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_concurrent_batches: 4,
        }
    }
}

/// Cache-first embedding front end for one provider.
///
/// Uncached texts are split into batches, batches run concurrently (bounded)
/// with retry, and every fresh vector lands in the cache before it is
/// returned. Output order always matches input order.
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
    retry: RetryPolicy,
    batch: BatchOptions,
}

impl Embedder {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<EmbeddingCache>,
        retry: RetryPolicy,
        batch: BatchOptions,
    ) -> Self {
        Self {
            provider,
            cache,
            retry,
            batch: BatchOptions {
                batch_size: batch.batch_size.max(1),
                max_concurrent_batches: batch.max_concurrent_batches.max(1),
            },
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_available()
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| self.invalid_response("provider returned no embedding".into()))
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        tracing::info!("Embedding {} texts with {}", texts.len(), self.model());

        let mut results: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        // text -> positions still waiting for a vector
        let mut pending: HashMap<&str, Vec<usize>> = HashMap::new();
        let mut uncached: Vec<String> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            match self.cache.get(text).await? {
                Some(v) => results.push(Some(v)),
                None => {
                    results.push(None);
                    let slots = pending.entry(text.as_str()).or_default();
                    if slots.is_empty() {
                        uncached.push(text.clone());
                    }
                    slots.push(i);
                }
            }
        }
        tracing::info!("Found {} uncached texts", uncached.len());

        let batches: Vec<Vec<String>> = uncached
            .chunks(self.batch.batch_size)
            .map(<[String]>::to_vec)
            .collect();

        // `buffered` keeps batch order, so zipping back to `uncached` is safe.
        let fresh: Vec<Vec<Vec<f32>>> = stream::iter(batches)
            .map(|batch| async move { self.embed_uncached(batch).await })
            .buffered(self.batch.max_concurrent_batches)
            .try_collect()
            .await?;

        for (text, vector) in uncached.iter().zip(fresh.into_iter().flatten()) {
            if let Some(slots) = pending.get(text.as_str()) {
                for &i in slots {
                    results[i] = Some(vector.clone());
                }
            }
        }

        let vectors: Vec<Vec<f32>> = results
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| self.invalid_response("embedding missing for some inputs".into()))?;
        check_uniform(&vectors, self.provider.dimension())?;
        Ok(vectors)
    }

    async fn embed_uncached(&self, batch: Vec<String>) -> Result<Vec<Vec<f32>>> {
        tracing::debug!("Embedding batch of size {}", batch.len());
        let provider = &self.provider;
        let batch = &batch;
        let vectors = self
            .retry
            .run_with(
                |_| async move {
                    let vectors = provider.embed_batch(batch).await?;
                    if vectors.len() != batch.len() {
                        return Err(ProviderError::InvalidResponse(format!(
                            "provider returned {} vectors for {} texts",
                            vectors.len(),
                            batch.len()
                        )));
                    }
                    Ok::<_, ProviderError>(vectors)
                },
                |e| e.is_retryable(),
                ProviderError::retry_after,
            )
            .await
            .map_err(|(source, attempts)| Error::Provider {
                provider: self.provider.name().to_string(),
                attempts,
                source,
            })?;

        check_uniform(&vectors, self.provider.dimension())?;

        for (text, vector) in batch.iter().zip(&vectors) {
            self.cache.put(text, vector).await?;
        }
        Ok(vectors)
    }

    fn invalid_response(&self, detail: String) -> Error {
        Error::Provider {
            provider: self.provider.name().to_string(),
            attempts: 1,
            source: ProviderError::InvalidResponse(detail),
        }
    }
}

/// The primary embedder plus the optional local fallback.
#[derive(Clone)]
pub struct EmbedderSet {
    primary: Arc<Embedder>,
    fallback: Option<Arc<Embedder>>,
}

impl EmbedderSet {
    pub fn new(primary: Arc<Embedder>, fallback: Option<Arc<Embedder>>) -> Self {
        Self { primary, fallback }
    }

    pub fn primary(&self) -> &Arc<Embedder> {
        &self.primary
    }

    pub fn fallback(&self) -> Option<&Arc<Embedder>> {
        self.fallback.as_ref()
    }

    /// The embedder whose model produced an index or table.
    pub fn for_model(&self, model: &str) -> Result<Arc<Embedder>> {
        std::iter::once(&self.primary)
            .chain(self.fallback.iter())
            .find(|e| e.model() == model)
            .cloned()
            .ok_or_else(|| {
                Error::Config(format!(
                    "index was built with model '{}' which is not configured",
                    model
                ))
            })
    }
}

fn check_uniform(vectors: &[Vec<f32>], expected: Option<usize>) -> Result<()> {
    let Some(expected) = expected.or_else(|| vectors.first().map(Vec::len)) else {
        return Ok(());
    };
    match vectors.iter().find(|v| v.len() != expected) {
        Some(v) => Err(Error::DimensionMismatch {
            expected,
            actual: v.len(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ProviderError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Deterministic provider that counts calls and can fail a set number of
    /// times before succeeding.
    pub(crate) struct CountingProvider {
        pub calls: AtomicUsize,
        pub texts_seen: AtomicUsize,
        pub fail_first: AtomicUsize,
        pub fatal: bool,
        pub available: bool,
        pub short_response: bool,
        pub dim: usize,
        pub model: String,
        pub fixed: HashMap<String, Vec<f32>>,
    }

    impl CountingProvider {
        pub fn new(dim: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                texts_seen: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
                fatal: false,
                available: true,
                short_response: false,
                dim,
                model: "counting-model".to_string(),
                fixed: HashMap::new(),
            }
        }

        pub fn with_model(mut self, model: &str) -> Self {
            self.model = model.to_string();
            self
        }

        /// Pins the vector returned for `text`.
        pub fn with_vector(mut self, text: &str, vector: Vec<f32>) -> Self {
            self.fixed.insert(text.to_string(), vector);
            self
        }

        pub fn vector_for(&self, text: &str) -> Vec<f32> {
            if let Some(v) = self.fixed.get(text) {
                return v.clone();
            }
            let mut v = vec![0.0; self.dim];
            for (i, b) in text.bytes().enumerate() {
                v[i % self.dim] += b as f32 / 255.0;
            }
            v
        }
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }
        fn model(&self) -> &str {
            &self.model
        }
        fn dimension(&self) -> Option<usize> {
            Some(self.dim)
        }
        fn is_available(&self) -> bool {
            self.available
        }
        async fn embed_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                return Err(ProviderError::NotConfigured("no key".into()));
            }
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(ProviderError::Api {
                    status: 500,
                    body: "transient".into(),
                });
            }
            self.texts_seen.fetch_add(texts.len(), Ordering::SeqCst);
            let mut vectors: Vec<Vec<f32>> = texts.iter().map(|t| self.vector_for(t)).collect();
            if self.short_response {
                vectors.pop();
            }
            Ok(vectors)
        }
    }

    pub(crate) fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2))
    }

    async fn embedder(provider: Arc<CountingProvider>, dir: &std::path::Path, batch_size: usize) -> Embedder {
        let cache = EmbeddingCache::open(dir, provider.model(), provider.dimension())
            .await
            .unwrap();
        Embedder::new(
            provider,
            Arc::new(cache),
            fast_retry(),
            BatchOptions {
                batch_size,
                max_concurrent_batches: 3,
            },
        )
    }

    /// Embedder over `provider` with a cache rooted at `dir` and fast retries.
    pub(crate) async fn test_embedder(provider: Arc<CountingProvider>, dir: &std::path::Path) -> Arc<Embedder> {
        Arc::new(embedder(provider, dir, 16).await)
    }

    #[tokio::test]
    async fn test_second_embed_hits_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = Arc::new(CountingProvider::new(4));
        let embedder = embedder(provider.clone(), tmp.path(), 8).await;

        let first = embedder.embed("what is shakers?").await.unwrap();
        let second = embedder.embed("what is shakers?").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batches_preserve_order() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = Arc::new(CountingProvider::new(3));
        let embedder = embedder(provider.clone(), tmp.path(), 2).await;

        let texts: Vec<String> = (0..7).map(|i| format!("text number {}", i)).collect();
        embedder.embed("text number 3").await.unwrap();

        let vectors = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), texts.len());
        for (t, v) in texts.iter().zip(&vectors) {
            assert_eq!(v, &provider.vector_for(t));
        }
        // 1 single call, then 6 uncached texts in batches of 2
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
        assert_eq!(provider.texts_seen.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn test_duplicate_inputs_embedded_once() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = Arc::new(CountingProvider::new(2));
        let embedder = embedder(provider.clone(), tmp.path(), 10).await;

        let texts = vec!["dup".to_string(), "other".to_string(), "dup".to_string()];
        let vectors = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors[0], vectors[2]);
        assert_eq!(provider.texts_seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = Arc::new(CountingProvider::new(2));
        provider.fail_first.store(2, Ordering::SeqCst);
        let embedder = embedder(provider.clone(), tmp.path(), 10).await;

        embedder.embed("hello").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert!(embedder.cache().get("hello").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_exhausted_retries_propagate() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = Arc::new(CountingProvider::new(2));
        provider.fail_first.store(10, Ordering::SeqCst);
        let embedder = embedder(provider.clone(), tmp.path(), 10).await;

        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, Error::Provider { attempts: 3, .. }));
        assert!(embedder.cache().get("hello").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_config_errors_are_not_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let mut provider = CountingProvider::new(2);
        provider.fatal = true;
        let provider = Arc::new(provider);
        let embedder = embedder(provider.clone(), tmp.path(), 10).await;

        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, Error::Provider { attempts: 1, .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_embedder_set_resolves_by_model() {
        let tmp = tempfile::tempdir().unwrap();
        let primary = test_embedder(Arc::new(CountingProvider::new(2).with_model("remote")), tmp.path()).await;
        let local = test_embedder(Arc::new(CountingProvider::new(3).with_model("local")), tmp.path()).await;
        let set = EmbedderSet::new(primary, Some(local));

        assert_eq!(set.for_model("local").unwrap().model(), "local");
        assert_eq!(set.for_model("remote").unwrap().model(), "remote");
        assert!(matches!(set.for_model("other"), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_short_response_is_provider_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut provider = CountingProvider::new(2);
        provider.short_response = true;
        let provider = Arc::new(provider);
        let embedder = embedder(provider.clone(), tmp.path(), 10).await;

        let texts = vec!["first".to_string(), "second".to_string()];
        let err = embedder.embed_batch(&texts).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Provider {
                attempts: 3,
                source: ProviderError::InvalidResponse(_),
                ..
            }
        ));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert!(embedder.cache().get("first").await.unwrap().is_none());
    }
}
