//! Candidate re-ranking.
//!
//! The vector index orders candidates by embedding similarity alone. Many
//! passages land within a hair of each other, so the retriever over-fetches
//! and re-ranks the set here with cheap secondary signals. Everything in
//! this module is a pure function of its inputs: no I/O, no clocks.
//!
//! # Scoring
//!
//! 1. `lexical` = share of query terms that occur in the passage.
//! 2. `recency` = min-max normalized `updated_at` over the candidate set.
//! 3. `secondary = 0.7 × lexical + 0.3 × recency`.
//! 4. `score = similarity + lexical_weight × secondary`, plus
//!    `continuity_boost` if the session cited the document recently.
//! 5. Sort by score (desc), document id (asc); truncate to `top_n`;
//!    assign ranks `1..=n`.
//!
//! With a small `lexical_weight` the secondary signal only reorders
//! candidates whose similarities are nearly tied.

use std::collections::HashSet;

use crate::embedding::terms;
use crate::models::Candidate;

const LEXICAL_SHARE: f64 = 0.7;
const RECENCY_SHARE: f64 = 0.3;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "how",
    "i", "in", "is", "it", "me", "my", "of", "on", "or", "the", "to", "was", "what", "when",
    "where", "which", "who", "why", "will", "with", "you",
];

/// Tuning knobs for [`rerank`].
#[derive(Debug, Clone, Copy)]
pub struct RerankParams {
    pub lexical_weight: f64,
    pub continuity_boost: f64,
}

impl Default for RerankParams {
    fn default() -> Self {
        Self {
            lexical_weight: 0.05,
            continuity_boost: 0.01,
        }
    }
}

/// Distinct, lower-cased, non-stopword terms of a query, in first-seen order.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    terms(query)
        .into_iter()
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Re-rank `candidates` and keep the best `top_n`.
///
/// Fills each candidate's `matched_terms`, replaces `relevance_score` with
/// the blended score, and assigns contiguous ranks starting at 1.
pub fn rerank(
    query_terms: &[String],
    candidates: Vec<Candidate>,
    recently_cited: &HashSet<String>,
    params: &RerankParams,
    top_n: usize,
) -> Vec<Candidate> {
    if candidates.is_empty() || top_n == 0 {
        return Vec::new();
    }

    let recency: Vec<f64> =
        normalize(&candidates.iter().map(|c| c.updated_at as f64).collect::<Vec<_>>());

    let mut ranked: Vec<Candidate> = candidates
        .into_iter()
        .zip(recency)
        .map(|(mut c, recency)| {
            let lower = c.text.to_lowercase();
            c.matched_terms = query_terms
                .iter()
                .filter(|t| lower.contains(t.as_str()))
                .cloned()
                .collect();
            let lexical = if query_terms.is_empty() {
                0.0
            } else {
                c.matched_terms.len() as f64 / query_terms.len() as f64
            };
            let secondary = LEXICAL_SHARE * lexical + RECENCY_SHARE * recency;
            let mut score = c.relevance_score + params.lexical_weight * secondary;
            if recently_cited.contains(&c.document_id) {
                score += params.continuity_boost;
            }
            c.relevance_score = score;
            c
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.document_id.cmp(&b.document_id))
    });
    ranked.truncate(top_n);
    for (i, c) in ranked.iter_mut().enumerate() {
        c.rank = i + 1;
    }
    ranked
}

/// Min-max normalize values to `[0.0, 1.0]`.
///
/// If all values are equal, they are normalized to `1.0`.
pub fn normalize(values: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    values
        .iter()
        .map(|v| {
            if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (v - min) / (max - min)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: &str, score: f64, text: &str, updated_at: i64) -> Candidate {
        Candidate {
            document_id: id.to_string(),
            source_uri: format!("{}.md", id),
            relevance_score: score,
            rank: 0,
            text: text.to_string(),
            matched_terms: Vec::new(),
            updated_at,
        }
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize(&[]).is_empty());
    }

    #[test]
    fn test_normalize_range() {
        let result = normalize(&[10.0, 5.0, 0.0]);
        assert!((result[0] - 1.0).abs() < 1e-9);
        assert!((result[1] - 0.5).abs() < 1e-9);
        assert!((result[2] - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        for v in normalize(&[3.0, 3.0]) {
            assert!((v - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_query_terms_drop_stopwords_and_duplicates() {
        let t = query_terms("What are the prerequisites for CS101? prerequisites!");
        assert_eq!(t, vec!["prerequisites", "cs101"]);
    }

    #[test]
    fn test_lexical_overlap_breaks_near_tie() {
        let terms = query_terms("dining hours");
        let ranked = rerank(
            &terms,
            vec![
                cand("a", 0.800, "Parking permits and garages", 0),
                cand("b", 0.799, "Dining hall hours are 7 to 9", 0),
            ],
            &HashSet::new(),
            &RerankParams::default(),
            2,
        );
        assert_eq!(ranked[0].document_id, "b");
        assert_eq!(ranked[0].matched_terms, vec!["dining", "hours"]);
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[1].rank, 2);
    }

    #[test]
    fn test_secondary_signal_does_not_override_clear_gap() {
        let terms = query_terms("dining hours");
        let ranked = rerank(
            &terms,
            vec![
                cand("a", 0.95, "Meal plans overview", 0),
                cand("b", 0.40, "Dining hall hours", 0),
            ],
            &HashSet::new(),
            &RerankParams::default(),
            2,
        );
        assert_eq!(ranked[0].document_id, "a");
    }

    #[test]
    fn test_exact_tie_broken_by_id() {
        let ranked = rerank(
            &[],
            vec![cand("b", 0.5, "x", 0), cand("a", 0.5, "x", 0)],
            &HashSet::new(),
            &RerankParams::default(),
            2,
        );
        let ids: Vec<&str> = ranked.iter().map(|c| c.document_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_continuity_boost_and_truncation() {
        let cited: HashSet<String> = ["b".to_string()].into_iter().collect();
        let ranked = rerank(
            &[],
            vec![cand("a", 0.5, "x", 0), cand("b", 0.5, "x", 0), cand("c", 0.1, "x", 0)],
            &cited,
            &RerankParams::default(),
            1,
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].document_id, "b");
    }

    #[test]
    fn test_deterministic() {
        let terms = query_terms("library hours");
        let input = vec![
            cand("x", 0.61, "Library hours on weekends", 20),
            cand("y", 0.62, "Gym hours", 10),
            cand("z", 0.60, "Library printing", 30),
        ];
        let a = rerank(&terms, input.clone(), &HashSet::new(), &RerankParams::default(), 3);
        let b = rerank(&terms, input, &HashSet::new(), &RerankParams::default(), 3);
        assert_eq!(a, b);
    }
}
