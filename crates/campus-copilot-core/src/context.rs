//! Context assembly: turn ranked candidates into a budgeted, cited
//! evidence block for the prompt.
//!
//! # Algorithm
//!
//! 1. Walk candidates in rank order.
//! 2. Cut an excerpt: the minimal span covering the candidate's matched
//!    terms, widened by `excerpt_margin_chars` on both sides and snapped to
//!    whitespace, capped at `max_excerpt_chars`. Without matched terms the
//!    leading window is used.
//! 3. Skip the candidate if an already included excerpt from the same
//!    `source_uri` overlaps it (word-set Jaccard ≥ `dedup_threshold`).
//! 4. Stop at the first excerpt that would push the total over the token
//!    budget. Excerpts are never cut to fit.
//! 5. Number the included excerpts `1, 2, 3, …` in inclusion order.

use std::collections::HashSet;

use crate::models::{Candidate, ContextBlock, ContextEntry};
use crate::tokens::estimate_tokens;

/// Excerpting and deduplication settings.
#[derive(Debug, Clone, Copy)]
pub struct AssemblerParams {
    pub excerpt_margin_chars: usize,
    pub max_excerpt_chars: usize,
    pub dedup_threshold: f64,
}

impl Default for AssemblerParams {
    fn default() -> Self {
        Self {
            excerpt_margin_chars: 200,
            max_excerpt_chars: 1200,
            dedup_threshold: 0.8,
        }
    }
}

/// Builds [`ContextBlock`]s from ranked candidates.
#[derive(Debug, Clone, Default)]
pub struct ContextAssembler {
    params: AssemblerParams,
}

impl ContextAssembler {
    pub fn new(params: AssemblerParams) -> Self {
        Self { params }
    }

    pub fn assemble(&self, candidates: &[Candidate], token_budget: usize) -> ContextBlock {
        let mut ordered: Vec<&Candidate> = candidates.iter().collect();
        ordered.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.document_id.cmp(&b.document_id)));

        let mut block = ContextBlock::empty(token_budget);
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (pos, cand) in ordered.iter().enumerate() {
            if !seen_ids.insert(cand.document_id.as_str()) {
                block.deduplicated += 1;
                continue;
            }

            let excerpt = excerpt(
                &cand.text,
                &cand.matched_terms,
                self.params.excerpt_margin_chars,
                self.params.max_excerpt_chars,
            );
            if excerpt.is_empty() {
                continue;
            }

            let overlaps = block.entries.iter().any(|e| {
                e.source_uri == cand.source_uri
                    && jaccard(&e.excerpt, &excerpt) >= self.params.dedup_threshold
            });
            if overlaps {
                block.deduplicated += 1;
                continue;
            }

            let tokens = estimate_tokens(&excerpt);
            if block.total_tokens + tokens > token_budget {
                block.omitted = ordered.len() - pos;
                break;
            }

            block.total_tokens += tokens;
            block.entries.push(ContextEntry {
                marker: block.entries.len() + 1,
                document_id: cand.document_id.clone(),
                source_uri: cand.source_uri.clone(),
                excerpt,
                tokens,
            });
        }

        block
    }
}

/// Cut the excerpt for one candidate text.
pub fn excerpt(text: &str, matched_terms: &[String], margin: usize, max_chars: usize) -> String {
    let text = text.trim();
    if text.is_empty() || max_chars == 0 {
        return String::new();
    }

    let spans = match_spans(text, matched_terms);
    let (lo, hi) = match (spans.first(), spans.last()) {
        (Some(&(first, _)), Some(&(_, last))) => {
            let lo = widen_back(text, first, margin);
            let hi = widen_forward(text, last, margin);
            if text[lo..hi].chars().count() <= max_chars {
                (lo, hi)
            } else {
                // Terms are spread too far apart: window on the first match.
                let lo = widen_back(text, first, margin.min(max_chars / 2));
                (lo, widen_forward(text, lo, max_chars))
            }
        }
        _ => (0, widen_forward(text, 0, max_chars)),
    };

    text[lo..hi].trim().to_string()
}

/// Byte ranges of words containing any of `terms`, in text order.
fn match_spans(text: &str, terms: &[String]) -> Vec<(usize, usize)> {
    if terms.is_empty() {
        return Vec::new();
    }
    let mut spans = Vec::new();
    let mut word_start: Option<usize> = None;
    let check = |start: usize, end: usize, spans: &mut Vec<(usize, usize)>| {
        let word = text[start..end].to_lowercase();
        if terms.iter().any(|t| word.contains(t.as_str())) {
            spans.push((start, end));
        }
    };

    for (i, c) in text.char_indices() {
        if c.is_alphanumeric() {
            word_start.get_or_insert(i);
        } else if let Some(start) = word_start.take() {
            check(start, i, &mut spans);
        }
    }
    if let Some(start) = word_start {
        check(start, text.len(), &mut spans);
    }
    spans
}

/// Move `n` chars back from byte `from`, then forward to the start of the
/// next word so the excerpt does not open mid-word.
fn widen_back(text: &str, from: usize, n: usize) -> usize {
    if n == 0 {
        return from;
    }
    let lo = text[..from]
        .char_indices()
        .rev()
        .nth(n - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    if lo == 0 {
        return 0;
    }
    match text[lo..from].find(char::is_whitespace) {
        Some(ws) => {
            let after = lo + ws;
            after + text[after..].chars().next().map(char::len_utf8).unwrap_or(0)
        }
        None => from,
    }
}

/// Move `n` chars forward from byte `from`, then back to the end of the
/// previous word so the excerpt does not close mid-word.
fn widen_forward(text: &str, from: usize, n: usize) -> usize {
    let hi = text[from..]
        .char_indices()
        .nth(n)
        .map(|(i, _)| from + i)
        .unwrap_or(text.len());
    if hi >= text.len() {
        return text.len();
    }
    match text[from..hi].rfind(char::is_whitespace) {
        Some(ws) => from + ws,
        None => hi,
    }
}

/// Word-set Jaccard similarity in `[0.0, 1.0]`.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let wa: HashSet<String> = a.split_whitespace().map(str::to_lowercase).collect();
    let wb: HashSet<String> = b.split_whitespace().map(str::to_lowercase).collect();
    if wa.is_empty() && wb.is_empty() {
        return 1.0;
    }
    let inter = wa.intersection(&wb).count() as f64;
    let union = wa.union(&wb).count() as f64;
    inter / union
}
