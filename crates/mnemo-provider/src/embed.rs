use async_trait::async_trait;

use crate::provider::ProviderError;

/// Text-embedding capability. Dimensions are fixed per model; determinism
/// is not required.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Batched variant — default loops over [`Embedder::embed`]; providers
    /// with a batch endpoint override this.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }

    fn dimensions(&self) -> usize;
}

/// A single reranker verdict: index into the input document slice plus the
/// cross-encoder relevance score.
#[derive(Debug, Clone, Copy)]
pub struct RerankResult {
    pub index: usize,
    pub score: f64,
}

/// Cross-encoder reranking capability.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Rerank `docs` against `query`; result sorted by score descending,
    /// at most `top_n` entries.
    async fn rerank(
        &self,
        query: &str,
        docs: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankResult>, ProviderError>;

    /// Whether the reranking service is configured and reachable.
    fn is_enabled(&self) -> bool;
}
