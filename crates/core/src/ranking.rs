//! Composite similarity-plus-recency scoring shared by every chunk store.
//!
//! `score = cosine(query, chunk) + weight * exp(-age / horizon)`. The sum is
//! not normalized and may exceed 1.0.

use crate::config::RetrievalConfig;
use crate::models::RetrievalResult;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct RankCandidate {
    pub document_id: String,
    pub filename: String,
    pub ordinal: u32,
    pub content: String,
    pub embedding: Vec<f32>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct Ranker {
    recency_weight: f64,
    recency_horizon_secs: f64,
}

impl Default for Ranker {
    fn default() -> Self {
        Self::from(&RetrievalConfig::default())
    }
}

impl From<&RetrievalConfig> for Ranker {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            recency_weight: config.recency_weight,
            recency_horizon_secs: config.recency_horizon.as_secs_f64().max(1.0),
        }
    }
}

impl Ranker {
    pub fn recency_bonus(&self, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let age_secs = (now - updated_at).num_milliseconds().max(0) as f64 / 1000.0;
        self.recency_weight * (-age_secs / self.recency_horizon_secs).exp()
    }

    pub fn score(&self, query: &[f32], candidate: &RankCandidate, now: DateTime<Utc>) -> f64 {
        cosine_similarity(query, &candidate.embedding) + self.recency_bonus(candidate.updated_at, now)
    }

    /// Candidates must arrive in insertion order; the stable sort keeps that
    /// order among equal scores.
    pub fn rank(
        &self,
        query: &[f32],
        candidates: impl IntoIterator<Item = RankCandidate>,
        now: DateTime<Utc>,
        top_k: usize,
    ) -> Vec<RetrievalResult> {
        let mut scored = candidates
            .into_iter()
            .map(|candidate| {
                let score = self.score(query, &candidate, now);
                (score, candidate)
            })
            .collect::<Vec<_>>();

        scored.sort_by(|left, right| right.0.total_cmp(&left.0));

        scored
            .into_iter()
            .take(top_k)
            .map(|(score, candidate)| RetrievalResult {
                document_id: candidate.document_id,
                filename: candidate.filename,
                ordinal: candidate.ordinal,
                content: candidate.content,
                score,
            })
            .collect()
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let mut dot = 0f64;
    let mut left_norm = 0f64;
    let mut right_norm = 0f64;
    for (a, b) in left.iter().zip(right) {
        let (a, b) = (f64::from(*a), f64::from(*b));
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }

    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }

    dot / (left_norm.sqrt() * right_norm.sqrt())
}
