//! Query-time retrieval: embed, over-fetch from the vector index, re-rank.
//!
//! The index is asked for `top_n × overfetch_factor` candidates so the
//! re-ranker has near-ties to separate. Re-ranking is the pure
//! [`rerank`] function; the only external calls are the embedding and the
//! search itself, both behind the shared retry policy.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use campus_copilot_core::models::Candidate;
use campus_copilot_core::rerank::{query_terms, rerank, RerankParams};
use campus_copilot_core::store::{MetadataFilter, VectorIndex};
use tracing::debug;

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingGateway;
use crate::error::CopilotError;
use crate::retry::RetryPolicy;

/// Per-query inputs derived from the session and the resolved intent.
#[derive(Debug, Clone, Default)]
pub struct RetrievalContext {
    pub filter: MetadataFilter,
    /// Documents cited by the session's recent turns.
    pub recently_cited: HashSet<String>,
}

pub struct Retriever {
    gateway: EmbeddingGateway,
    index: Arc<dyn VectorIndex>,
    policy: RetryPolicy,
    timeout: Duration,
    overfetch_factor: usize,
    min_similarity: f64,
    params: RerankParams,
}

impl Retriever {
    pub fn new(
        gateway: EmbeddingGateway,
        index: Arc<dyn VectorIndex>,
        policy: RetryPolicy,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            gateway,
            index,
            policy,
            timeout: config.timeout(),
            overfetch_factor: config.overfetch_factor.max(1),
            min_similarity: config.min_similarity,
            params: config.rerank_params(),
        }
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Up to `top_n` candidates, ranked `1..=n`. A blank query or an index
    /// with nothing matching yields an empty vector.
    pub async fn retrieve(
        &self,
        query_text: &str,
        ctx: &RetrievalContext,
        top_n: usize,
    ) -> Result<Vec<Candidate>, CopilotError> {
        if query_text.trim().is_empty() || top_n == 0 {
            return Ok(Vec::new());
        }

        let vector = self.gateway.embed(query_text).await?;
        let k = top_n.saturating_mul(self.overfetch_factor);

        let index = &self.index;
        let vector = &vector;
        let filter = &ctx.filter;
        let fetched = self
            .policy
            .run("vector_index", self.timeout, || async move {
                index.search(vector, k, filter).await
            })
            .await
            .map_err(|e| CopilotError::Retrieval {
                attempts: e.attempts,
                source: e.error,
            })?;

        let fetched_len = fetched.len();
        let evidence: Vec<Candidate> = fetched
            .into_iter()
            .filter(|c| c.relevance_score > self.min_similarity)
            .collect();

        let terms = query_terms(query_text);
        let ranked = rerank(&terms, evidence, &ctx.recently_cited, &self.params, top_n);
        debug!(
            fetched = fetched_len,
            kept = ranked.len(),
            filtered = !ctx.filter.is_empty(),
            "retrieved candidates"
        );
        Ok(ranked)
    }
}
