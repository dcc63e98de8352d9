//! Batch evaluation of retrieval and recommendations against simulated data.

use std::collections::BTreeSet;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::UserHistoryEntry;
use crate::rag::vector_store::write_atomic;
use crate::rag::RagEngine;

pub const DEFAULT_EVAL_QUERY: &str = "How do payments work on Shakers?";

#[derive(Debug, Clone, Deserialize)]
pub struct EvalQuestion {
    pub id: serde_json::Value,
    pub question: String,
    #[serde(default)]
    pub references: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default)]
    pub history: Vec<UserHistoryEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionScore {
    pub id: serde_json::Value,
    pub in_scope: bool,
    pub references: Vec<String>,
    pub recall: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalSummary {
    pub total_queries: usize,
    pub failed: usize,
    pub avg_recall: f32,
    pub questions: Vec<QuestionScore>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileScore {
    pub user_id: String,
    pub query: String,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecommendationSummary {
    pub total_users: usize,
    pub failed: usize,
    pub avg_recs: f32,
    pub avg_unique: f32,
    pub users: Vec<ProfileScore>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalSummary {
    pub rag: RetrievalSummary,
    pub recs: RecommendationSummary,
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

pub async fn write_summary(path: &Path, summary: &EvalSummary) -> Result<()> {
    write_atomic(path, serde_json::to_vec_pretty(summary)?).await
}

/// The last summary written by `rag-eval`, `None` if it has never run.
pub async fn read_summary(path: &Path) -> Result<Option<serde_json::Value>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&data)?))
}

/// Share of `expected` references found in `retrieved`; 0 when nothing is
/// expected.
pub fn reference_recall(expected: &[String], retrieved: &[String]) -> f32 {
    let expected: BTreeSet<&str> = expected.iter().map(String::as_str).collect();
    if expected.is_empty() {
        return 0.0;
    }
    let hits = retrieved
        .iter()
        .map(String::as_str)
        .collect::<BTreeSet<_>>()
        .intersection(&expected)
        .count();
    hits as f32 / expected.len() as f32
}

fn mean(total: f32, count: usize) -> f32 {
    if count == 0 {
        0.0
    } else {
        total / count as f32
    }
}

/// Failed queries count towards the total with zero recall.
pub async fn evaluate_retrieval(engine: &RagEngine, questions: &[EvalQuestion], k: usize) -> RetrievalSummary {
    let mut scores = Vec::with_capacity(questions.len());
    let mut failed = 0;

    for q in questions {
        match engine.retrieve(&q.question, k).await {
            Ok(outcome) => {
                let references = outcome.references();
                let recall = reference_recall(&q.references, &references);
                tracing::info!("[RAG] QID {}: recall={:.2}", q.id, recall);
                scores.push(QuestionScore {
                    id: q.id.clone(),
                    in_scope: outcome.in_scope,
                    references,
                    recall,
                });
            }
            Err(e) => {
                tracing::warn!("[RAG] QID {} failed: {}", q.id, e);
                failed += 1;
            }
        }
    }

    let total_recall: f32 = scores.iter().map(|s| s.recall).sum();
    RetrievalSummary {
        total_queries: questions.len(),
        failed,
        avg_recall: mean(total_recall, questions.len()),
        questions: scores,
    }
}

/// Uses each profile's last question as the query, or `default_query` for an
/// empty history.
pub async fn evaluate_recommendations(
    engine: &RagEngine,
    profiles: &[UserProfile],
    default_query: &str,
    k: usize,
    alpha: f32,
) -> RecommendationSummary {
    let mut users = Vec::with_capacity(profiles.len());
    let mut failed = 0;

    for profile in profiles {
        let query = profile
            .history
            .last()
            .map(|h| h.question.as_str())
            .filter(|q| !q.is_empty())
            .unwrap_or(default_query)
            .to_string();

        match engine.recommend(&profile.history, &query, k, alpha).await {
            Ok(recs) => {
                let docs: Vec<String> = recs.into_iter().map(|r| r.doc).collect();
                tracing::info!("[Recs] {}: recs={}", profile.user_id, docs.len());
                users.push(ProfileScore {
                    user_id: profile.user_id.clone(),
                    query,
                    recommendations: docs,
                });
            }
            Err(e) => {
                tracing::warn!("[Recs] {} failed: {}", profile.user_id, e);
                failed += 1;
            }
        }
    }

    let recs_total: usize = users.iter().map(|u| u.recommendations.len()).sum();
    let unique_total: usize = users
        .iter()
        .map(|u| u.recommendations.iter().collect::<BTreeSet<_>>().len())
        .sum();
    RecommendationSummary {
        total_users: profiles.len(),
        failed,
        avg_recs: mean(recs_total as f32, profiles.len()),
        avg_unique: mean(unique_total as f32, profiles.len()),
        users,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_reference_recall() {
        assert_eq!(reference_recall(&refs(&["a.md", "b.md"]), &refs(&["b.md", "c.md"])), 0.5);
        assert_eq!(reference_recall(&refs(&["a.md"]), &refs(&["a.md", "a.md"])), 1.0);
        assert_eq!(reference_recall(&refs(&["a.md"]), &[]), 0.0);
        assert_eq!(reference_recall(&[], &refs(&["a.md"])), 0.0);
    }

    #[tokio::test]
    async fn test_summary_written_then_served() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data").join("metrics_summary.json");
        assert!(read_summary(&path).await.unwrap().is_none());

        let summary = EvalSummary {
            rag: RetrievalSummary {
                total_queries: 2,
                failed: 0,
                avg_recall: 0.5,
                questions: Vec::new(),
            },
            recs: RecommendationSummary {
                total_users: 1,
                failed: 0,
                avg_recs: 3.0,
                avg_unique: 3.0,
                users: Vec::new(),
            },
        };
        write_summary(&path, &summary).await.unwrap();

        let served = read_summary(&path).await.unwrap().unwrap();
        assert_eq!(served["rag"]["total_queries"], 2);
        assert_eq!(served["recs"]["avg_recs"], 3.0);
    }

    #[tokio::test]
    async fn test_corrupt_summary_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("metrics_summary.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(read_summary(&path).await, Err(crate::error::Error::Json(_))));
    }

    #[test]
    fn test_input_files_parse() {
        let questions: Vec<EvalQuestion> = serde_json::from_str(
            r#"[{"id": 1, "question": "How do I get paid?", "references": ["payments.md"], "ideal_answer": "x"}]"#,
        )
        .unwrap();
        assert_eq!(questions[0].references, refs(&["payments.md"]));

        let profiles: Vec<UserProfile> = serde_json::from_str(
            r#"[{"user_id": "u1", "history": [{"q": "fees?", "a": "5%", "refs": ["fees.md"]}]}, {"user_id": "u2"}]"#,
        )
        .unwrap();
        assert_eq!(profiles[0].history[0].question, "fees?");
        assert!(profiles[0].history[0].references.contains("fees.md"));
        assert!(profiles[1].history.is_empty());
    }

    #[test]
    fn test_mean_of_nothing_is_zero() {
        assert_eq!(mean(3.0, 0), 0.0);
        assert_eq!(mean(3.0, 2), 1.5);
    }
}
