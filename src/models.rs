use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reply used by callers when a query falls outside the knowledge base.
pub const OUT_OF_SCOPE_MESSAGE: &str = "Sorry, I have no information on that.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub seq: u64,
    pub text: String,
    pub source: String,
}

impl Chunk {
    pub fn new(seq: u64, text: String, source: String) -> Self {
        Self {
            id: format!("chunk_{}", seq),
            seq,
            text,
            source,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    SquaredEuclidean,
}

/// Describes how a published index was built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub documents: usize,
    pub chunks: usize,
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    pub text: String,
    pub distance: f32,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalOutcome {
    pub snippets: Vec<Snippet>,
    pub in_scope: bool,
}

impl RetrievalOutcome {
    pub fn out_of_scope() -> Self {
        Self {
            snippets: Vec::new(),
            in_scope: false,
        }
    }

    /// Snippet texts in relevance order, as handed to a text generator.
    pub fn snippet_texts(&self) -> Vec<&str> {
        self.snippets.iter().map(|s| s.text.as_str()).collect()
    }

    /// Distinct sources, first occurrence wins.
    pub fn references(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.snippets
            .iter()
            .filter(|s| seen.insert(s.source.as_str()))
            .map(|s| s.source.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserHistoryEntry {
    #[serde(default, alias = "q")]
    pub question: String,
    #[serde(default, alias = "a")]
    pub answer: String,
    #[serde(default, alias = "refs")]
    pub references: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationCandidate {
    pub doc: String,
    pub score: f32,
    pub reason: String,
}

// HTTP API types

#[derive(Debug, Clone, Deserialize)]
pub struct RetrieveRequest {
    pub query: String,
    #[serde(default)]
    pub k: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrieveResponse {
    pub in_scope: bool,
    pub snippets: Vec<Snippet>,
    pub references: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<RetrievalOutcome> for RetrieveResponse {
    fn from(outcome: RetrievalOutcome) -> Self {
        let references = outcome.references();
        let message = (!outcome.in_scope).then(|| OUT_OF_SCOPE_MESSAGE.to_string());
        Self {
            in_scope: outcome.in_scope,
            snippets: outcome.snippets,
            references,
            message,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecommendRequest {
    #[serde(default)]
    pub history: Vec<UserHistoryEntry>,
    pub current_query: String,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub alpha: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecommendResponse {
    pub recommendations: Vec<RecommendationCandidate>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildIndexRequest {
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub chunk_overlap: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snippet(text: &str, distance: f32, source: &str) -> Snippet {
        Snippet {
            text: text.to_string(),
            distance,
            source: source.to_string(),
        }
    }

    #[test]
    fn test_references_are_deduplicated_in_order() {
        let outcome = RetrievalOutcome {
            snippets: vec![
                snippet("a", 0.1, "payments.md"),
                snippet("b", 0.2, "freelancer.md"),
                snippet("c", 0.3, "payments.md"),
            ],
            in_scope: true,
        };
        assert_eq!(outcome.references(), vec!["payments.md", "freelancer.md"]);
        assert_eq!(outcome.snippet_texts(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_out_of_scope_response_carries_fallback_message() {
        let response = RetrieveResponse::from(RetrievalOutcome::out_of_scope());
        assert!(!response.in_scope);
        assert!(response.references.is_empty());
        assert_eq!(response.message.as_deref(), Some(OUT_OF_SCOPE_MESSAGE));
    }

    #[test]
    fn test_history_accepts_short_field_names() {
        let entry: UserHistoryEntry =
            serde_json::from_str(r#"{"q": "How?", "a": "Like so", "refs": ["doc1.md"]}"#).unwrap();
        assert_eq!(entry.question, "How?");
        assert!(entry.references.contains("doc1.md"));
    }
}
