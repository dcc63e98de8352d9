use std::collections::BTreeSet;
use std::sync::Arc;

use super::doc_embeddings::DocumentEmbeddingStore;
use super::embedder::EmbedderSet;
use super::similarity::{cosine_similarity, mean_vector};
use crate::error::{Error, Result};
use crate::models::{RecommendationCandidate, UserHistoryEntry};

pub const DEFAULT_ALPHA: f32 = 0.6;

/// Suggests unseen documents by blending similarity to the user's reading
/// profile with similarity to the current query.
pub struct RecommendationEngine {
    embedders: EmbedderSet,
    doc_store: Arc<DocumentEmbeddingStore>,
}

impl RecommendationEngine {
    pub fn new(embedders: EmbedderSet, doc_store: Arc<DocumentEmbeddingStore>) -> Self {
        Self {
            embedders,
            doc_store,
        }
    }

    /// Top `k` unseen documents, best first. Fails with `IndexNotFound` when
    /// no document-embedding table has been published.
    pub async fn recommend(
        &self,
        history: &[UserHistoryEntry],
        current_query: &str,
        k: usize,
        alpha: f32,
    ) -> Result<Vec<RecommendationCandidate>> {
        if k == 0 {
            return Err(Error::InvalidArgument("k must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&alpha) {
            return Err(Error::InvalidArgument(format!(
                "alpha must be within [0, 1], got {}",
                alpha
            )));
        }

        let table = self.doc_store.load().await?.ok_or(Error::IndexNotFound)?;

        let seen: BTreeSet<&str> = history
            .iter()
            .flat_map(|h| h.references.iter().map(String::as_str))
            .collect();
        // unknown seen docs are skipped
        let profile = mean_vector(seen.iter().filter_map(|doc| table.get(doc)))?;
        if profile.is_none() && !seen.is_empty() {
            tracing::debug!("None of {} seen documents has an embedding", seen.len());
        }

        let embedder = self.embedders.for_model(&table.model)?;
        let query = embedder.embed(current_query).await?;
        if query.len() != table.dimension {
            return Err(Error::DimensionMismatch {
                expected: table.dimension,
                actual: query.len(),
            });
        }

        let mut candidates = Vec::new();
        for (doc, vector) in &table.documents {
            if seen.contains(doc.as_str()) {
                continue;
            }
            let profile_sim = match &profile {
                Some(p) => cosine_similarity(p, vector)?,
                None => 0.0,
            };
            let query_sim = cosine_similarity(&query, vector)?;
            let score = alpha * profile_sim + (1.0 - alpha) * query_sim;
            candidates.push(RecommendationCandidate {
                doc: doc.clone(),
                score,
                reason: format!(
                    "{} scores {:.2}: similarity to your reading history {:.2}, to your current question {:.2}",
                    doc, score, profile_sim, query_sim
                ),
            });
        }

        candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.doc.cmp(&b.doc)));
        candidates.truncate(k);
        tracing::debug!(
            "Recommended {:?} ({} seen documents excluded)",
            candidates.iter().map(|c| c.doc.as_str()).collect::<Vec<_>>(),
            seen.len()
        );
        Ok(candidates)
    }
}
