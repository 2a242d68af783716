//! The adaptive retrieval engine.
//!
//! One entry point, [`Retriever::retrieve`], executes whichever of the nine
//! strategies the caller selected. The two hybrid sub-searches run as
//! parallel tasks with cooperative cancellation; losing one backend degrades
//! to the other, losing both is an error.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mnemo_provider::{Embedder, Reranker};

use crate::error::{RetrievalError, Result};
use crate::quality::{self, Quality};
use crate::rrf;
use crate::store::{Bm25Query, RetrievalBackend, VectorQuery};
use crate::types::{ItemKind, RetrievalItem, RetrievalRequest, Strategy, TimeRange};

const DEFAULT_LIMIT: usize = 20;
const SEMANTIC_TOP_K: usize = 5;
const SEMANTIC_EXPANDED_TOP_K: usize = 20;

/// Tunables lifted from the retriever/reranker config sections.
#[derive(Debug, Clone)]
pub struct RetrieverSettings {
    pub vector_limit: usize,
    pub bm25_limit: usize,
    pub rrf_k: u32,
    pub recency_days: i64,
    pub doc_truncate_chars: usize,
}

impl Default for RetrieverSettings {
    fn default() -> Self {
        Self {
            vector_limit: 20,
            bm25_limit: 20,
            rrf_k: 60,
            recency_days: 90,
            doc_truncate_chars: 5000,
        }
    }
}

/// Result of one retrieval call.
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub items: Vec<RetrievalItem>,
    /// Set when one hybrid path failed and results degraded to the other.
    pub degraded: Option<String>,
    pub reranked: bool,
}

impl RetrievalOutcome {
    fn plain(items: Vec<RetrievalItem>) -> Self {
        Self {
            items,
            degraded: None,
            reranked: false,
        }
    }
}

pub struct Retriever {
    backend: Arc<dyn RetrievalBackend + Send + Sync>,
    embedder: Option<Arc<dyn Embedder>>,
    reranker: Option<Arc<dyn Reranker>>,
    settings: RetrieverSettings,
}

impl Retriever {
    pub fn new(
        backend: Arc<dyn RetrievalBackend + Send + Sync>,
        embedder: Option<Arc<dyn Embedder>>,
        reranker: Option<Arc<dyn Reranker>>,
        settings: RetrieverSettings,
    ) -> Self {
        Self {
            backend,
            embedder,
            reranker,
            settings,
        }
    }

    /// Execute the request's strategy. Cancellation short-circuits every
    /// in-flight sub-search.
    pub async fn retrieve(
        &self,
        cancel: &CancellationToken,
        req: &RetrievalRequest,
    ) -> Result<RetrievalOutcome> {
        if cancel.is_cancelled() {
            return Err(RetrievalError::Cancelled);
        }
        let limit = req.limit.unwrap_or(DEFAULT_LIMIT);

        match req.strategy {
            Strategy::ScheduleBm25Only => {
                let range = req.time_range.ok_or_else(|| RetrievalError::InvalidTimeRange {
                    start: "missing".to_string(),
                    end: "missing".to_string(),
                })?;
                let items = self.backend.scan_schedules(req.user_id, range, limit).await?;
                Ok(RetrievalOutcome::plain(items))
            }

            Strategy::MemoListOnly => {
                let items = self.backend.list_memos(req.user_id, limit, None).await?;
                Ok(RetrievalOutcome::plain(items))
            }

            Strategy::MemoFilterOnly => {
                let items = self
                    .backend
                    .list_memos(req.user_id, limit, req.time_range)
                    .await?;
                Ok(RetrievalOutcome::plain(items))
            }

            Strategy::MemoBm25Only => {
                let items = self
                    .backend
                    .bm25_search(&Bm25Query {
                        user_id: req.user_id,
                        query: req.query.clone(),
                        limit,
                        min_score: req.min_score,
                    })
                    .await?;
                Ok(RetrievalOutcome::plain(items))
            }

            Strategy::MemoSemanticOnly => self.semantic_only(cancel, req).await,

            Strategy::HybridStandard | Strategy::HybridBm25Weighted => {
                let mut outcome = self.hybrid(cancel, req).await?;
                outcome.items.truncate(limit);
                Ok(outcome)
            }

            Strategy::HybridWithTimeFilter => {
                let mut outcome = self.hybrid(cancel, req).await?;
                if let Some(range) = req.time_range {
                    outcome.items.retain(|item| match item.kind {
                        ItemKind::Memo => true,
                        ItemKind::Schedule => schedule_in_range(item, range),
                    });
                }
                outcome.items.truncate(limit);
                Ok(outcome)
            }

            Strategy::FullPipelineWithReranker => self.full_pipeline(cancel, req, limit).await,
        }
    }

    /// Semantic top-K with a recency prefilter. Medium-quality result sets
    /// get one expansion to a larger K before returning.
    async fn semantic_only(
        &self,
        cancel: &CancellationToken,
        req: &RetrievalRequest,
    ) -> Result<RetrievalOutcome> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| RetrievalError::Embedding("no embedder configured".to_string()))?;

        let vector = tokio::select! {
            _ = cancel.cancelled() => return Err(RetrievalError::Cancelled),
            v = embedder.embed(&req.query) => {
                v.map_err(|e| RetrievalError::Embedding(e.to_string()))?
            }
        };

        let created_after = Utc::now() - Duration::days(self.settings.recency_days);
        let top_k = req.limit.unwrap_or(SEMANTIC_TOP_K);
        let mut items = self
            .backend
            .vector_search(&VectorQuery {
                user_id: req.user_id,
                vector: vector.clone(),
                limit: top_k,
                created_after: Some(created_after),
            })
            .await?;

        if quality::assess(&items) == Quality::Medium && top_k < SEMANTIC_EXPANDED_TOP_K {
            debug!(top_k = SEMANTIC_EXPANDED_TOP_K, "semantic result mid-quality, expanding");
            items = self
                .backend
                .vector_search(&VectorQuery {
                    user_id: req.user_id,
                    vector,
                    limit: SEMANTIC_EXPANDED_TOP_K,
                    created_after: Some(created_after),
                })
                .await?;
        }

        if let Some(min) = req.min_score {
            items.retain(|i| i.score >= min);
        }
        Ok(RetrievalOutcome::plain(items))
    }

    /// Concurrent hybrid fan-out: embedding+vector on one task, BM25 on the
    /// other. Exactly one failure degrades with a warning; two failures are
    /// a combined error; cancellation stops both without leaking.
    async fn hybrid(
        &self,
        cancel: &CancellationToken,
        req: &RetrievalRequest,
    ) -> Result<RetrievalOutcome> {
        let vector_task = {
            let backend = Arc::clone(&self.backend);
            let embedder = self.embedder.clone();
            let cancel = cancel.clone();
            let query = req.query.clone();
            let user_id = req.user_id;
            let limit = self.settings.vector_limit;
            tokio::spawn(async move {
                let embedder = embedder
                    .ok_or_else(|| RetrievalError::Embedding("no embedder configured".to_string()))?;
                tokio::select! {
                    _ = cancel.cancelled() => Err(RetrievalError::Cancelled),
                    result = async {
                        let vector = embedder
                            .embed(&query)
                            .await
                            .map_err(|e| RetrievalError::Embedding(e.to_string()))?;
                        backend
                            .vector_search(&VectorQuery {
                                user_id,
                                vector,
                                limit,
                                created_after: None,
                            })
                            .await
                    } => result,
                }
            })
        };

        let bm25_task = {
            let backend = Arc::clone(&self.backend);
            let cancel = cancel.clone();
            let query = req.query.clone();
            let user_id = req.user_id;
            let limit = self.settings.bm25_limit;
            tokio::spawn(async move {
                let bm25_query = Bm25Query {
                    user_id,
                    query,
                    limit,
                    min_score: None,
                };
                tokio::select! {
                    _ = cancel.cancelled() => Err(RetrievalError::Cancelled),
                    result = backend.bm25_search(&bm25_query) => result,
                }
            })
        };

        let (vector_res, bm25_res) = tokio::join!(vector_task, bm25_task);
        let vector_res = vector_res
            .unwrap_or_else(|e| Err(RetrievalError::Embedding(format!("vector task panicked: {e}"))));
        let bm25_res = bm25_res
            .unwrap_or_else(|e| Err(RetrievalError::Embedding(format!("bm25 task panicked: {e}"))));

        if cancel.is_cancelled() {
            return Err(RetrievalError::Cancelled);
        }

        let weight = req.strategy.semantic_weight();
        match (vector_res, bm25_res) {
            (Ok(vector), Ok(bm25)) => Ok(RetrievalOutcome {
                items: rrf::fuse(&vector, &bm25, weight, self.settings.rrf_k),
                degraded: None,
                reranked: false,
            }),
            (Ok(vector), Err(e)) => {
                warn!(err = %e, "bm25 path failed, degrading to vector results");
                Ok(RetrievalOutcome {
                    items: vector,
                    degraded: Some(format!("bm25 search failed: {e}")),
                    reranked: false,
                })
            }
            (Err(e), Ok(bm25)) => {
                warn!(err = %e, "vector path failed, degrading to bm25 results");
                Ok(RetrievalOutcome {
                    items: bm25,
                    degraded: Some(format!("vector search failed: {e}")),
                    reranked: false,
                })
            }
            (Err(v), Err(b)) => Err(RetrievalError::BothBackendsFailed {
                vector: v.to_string(),
                bm25: b.to_string(),
            }),
        }
    }

    /// hybrid_standard → rerank gate → cross-encoder, falling back to the
    /// hybrid ordering when the reranker errors.
    async fn full_pipeline(
        &self,
        cancel: &CancellationToken,
        req: &RetrievalRequest,
        limit: usize,
    ) -> Result<RetrievalOutcome> {
        let mut outcome = self.hybrid(cancel, req).await?;

        let enabled = self.reranker.as_ref().map(|r| r.is_enabled()).unwrap_or(false);
        let Some(reranker) = self.reranker.as_ref().filter(|_| enabled) else {
            outcome.items.truncate(limit);
            return Ok(outcome);
        };
        if !quality::should_rerank(&req.query, &outcome.items, enabled) {
            outcome.items.truncate(limit);
            return Ok(outcome);
        }

        let docs: Vec<String> = outcome
            .items
            .iter()
            .map(|item| truncate_chars(&item.content, self.settings.doc_truncate_chars))
            .collect();

        let rerank_result = tokio::select! {
            _ = cancel.cancelled() => return Err(RetrievalError::Cancelled),
            r = reranker.rerank(&req.query, &docs, limit) => r,
        };

        match rerank_result {
            Ok(ranked) => {
                let mut items = Vec::with_capacity(ranked.len());
                for entry in ranked {
                    if let Some(item) = outcome.items.get(entry.index) {
                        let mut item = item.clone();
                        item.score = entry.score;
                        items.push(item);
                    }
                }
                Ok(RetrievalOutcome {
                    items,
                    degraded: outcome.degraded,
                    reranked: true,
                })
            }
            Err(e) => {
                warn!(err = %e, "reranker failed, falling back to hybrid ordering");
                outcome.items.truncate(limit);
                Ok(outcome)
            }
        }
    }
}

fn schedule_in_range(item: &RetrievalItem, range: TimeRange) -> bool {
    let Some(evidence) = &item.evidence else {
        return false;
    };
    let Some(starts_at) = evidence.get("starts_at").and_then(|v| v.as_str()) else {
        return false;
    };
    match chrono::DateTime::parse_from_rfc3339(starts_at) {
        Ok(t) => range.contains(t.with_timezone(&Utc)),
        Err(_) => false,
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mnemo_provider::{ProviderError, RerankResult};
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::store::{Bm25Search, MemoListing, ScheduleScan, VectorSearch};

    struct FakeBackend {
        vector_fails: bool,
        bm25_fails: bool,
    }

    fn memo(id: i64, content: &str, score: f64) -> RetrievalItem {
        RetrievalItem {
            id,
            kind: ItemKind::Memo,
            content: content.to_string(),
            score,
            evidence: None,
        }
    }

    #[async_trait]
    impl VectorSearch for FakeBackend {
        async fn vector_search(&self, _q: &VectorQuery) -> Result<Vec<RetrievalItem>> {
            if self.vector_fails {
                return Err(RetrievalError::Embedding("vector down".to_string()));
            }
            Ok(vec![memo(1, "semantic hit", 0.9), memo(2, "shared", 0.8)])
        }
    }

    #[async_trait]
    impl Bm25Search for FakeBackend {
        async fn bm25_search(&self, _q: &Bm25Query) -> Result<Vec<RetrievalItem>> {
            if self.bm25_fails {
                return Err(RetrievalError::Embedding("fts down".to_string()));
            }
            Ok(vec![memo(2, "shared", 4.0), memo(3, "lexical hit", 3.0)])
        }
    }

    #[async_trait]
    impl MemoListing for FakeBackend {
        async fn list_memos(
            &self,
            _user: i64,
            limit: usize,
            _range: Option<TimeRange>,
        ) -> Result<Vec<RetrievalItem>> {
            Ok((0..limit.min(3)).map(|i| memo(i as i64, "listed", 1.0)).collect())
        }
    }

    #[async_trait]
    impl ScheduleScan for FakeBackend {
        async fn scan_schedules(
            &self,
            _user: i64,
            _range: TimeRange,
            _limit: usize,
        ) -> Result<Vec<RetrievalItem>> {
            Ok(vec![RetrievalItem {
                id: 10,
                kind: ItemKind::Schedule,
                content: "standup".to_string(),
                score: 1.0,
                evidence: None,
            }])
        }
    }

    /// Backend wide enough (6 fused docs, close scores) to open the
    /// rerank gate.
    struct WideBackend;

    #[async_trait]
    impl VectorSearch for WideBackend {
        async fn vector_search(&self, _q: &VectorQuery) -> Result<Vec<RetrievalItem>> {
            Ok((1..=4).map(|i| memo(i, &format!("doc {i}"), 0.9 - i as f64 * 0.01)).collect())
        }
    }

    #[async_trait]
    impl Bm25Search for WideBackend {
        async fn bm25_search(&self, _q: &Bm25Query) -> Result<Vec<RetrievalItem>> {
            Ok((3..=6).map(|i| memo(i, &format!("doc {i}"), 5.0 - i as f64 * 0.1)).collect())
        }
    }

    #[async_trait]
    impl MemoListing for WideBackend {
        async fn list_memos(
            &self,
            _user: i64,
            _limit: usize,
            _range: Option<TimeRange>,
        ) -> Result<Vec<RetrievalItem>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl ScheduleScan for WideBackend {
        async fn scan_schedules(
            &self,
            _user: i64,
            _range: TimeRange,
            _limit: usize,
        ) -> Result<Vec<RetrievalItem>> {
            Ok(Vec::new())
        }
    }

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, ProviderError> {
            Ok(vec![1.0, 0.0])
        }
        fn dimensions(&self) -> usize {
            2
        }
    }

    struct FlakyReranker {
        fail: AtomicBool,
    }

    #[async_trait]
    impl Reranker for FlakyReranker {
        async fn rerank(
            &self,
            _query: &str,
            docs: &[String],
            top_n: usize,
        ) -> std::result::Result<Vec<RerankResult>, ProviderError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ProviderError::Unavailable("reranker down".to_string()));
            }
            // Reverse the incoming order with descending synthetic scores.
            Ok((0..docs.len().min(top_n))
                .map(|i| RerankResult {
                    index: docs.len() - 1 - i,
                    score: 1.0 - i as f64 * 0.1,
                })
                .collect())
        }
        fn is_enabled(&self) -> bool {
            true
        }
    }

    fn retriever(vector_fails: bool, bm25_fails: bool) -> Retriever {
        Retriever::new(
            Arc::new(FakeBackend {
                vector_fails,
                bm25_fails,
            }),
            Some(Arc::new(FixedEmbedder)),
            None,
            RetrieverSettings::default(),
        )
    }

    #[tokio::test]
    async fn hybrid_fuses_both_lists() {
        let r = retriever(false, false);
        let cancel = CancellationToken::new();
        let out = r
            .retrieve(
                &cancel,
                &RetrievalRequest::new(1, "query", Strategy::HybridStandard),
            )
            .await
            .unwrap();
        assert_eq!(out.items.len(), 3);
        // The shared doc appears in both lists and wins.
        assert_eq!(out.items[0].id, 2);
        assert!(out.degraded.is_none());
    }

    #[tokio::test]
    async fn hybrid_degrades_when_one_path_fails() {
        let r = retriever(true, false);
        let cancel = CancellationToken::new();
        let out = r
            .retrieve(
                &cancel,
                &RetrievalRequest::new(1, "query", Strategy::HybridStandard),
            )
            .await
            .unwrap();
        assert_eq!(out.items.len(), 2);
        assert!(out.degraded.is_some());
    }

    #[tokio::test]
    async fn hybrid_errors_when_both_paths_fail() {
        let r = retriever(true, true);
        let cancel = CancellationToken::new();
        let err = r
            .retrieve(
                &cancel,
                &RetrievalRequest::new(1, "query", Strategy::HybridStandard),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::BothBackendsFailed { .. }));
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let r = retriever(false, false);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = r
            .retrieve(
                &cancel,
                &RetrievalRequest::new(1, "query", Strategy::HybridStandard),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::Cancelled));
    }

    #[tokio::test]
    async fn schedule_strategy_requires_time_range() {
        let r = retriever(false, false);
        let cancel = CancellationToken::new();
        let err = r
            .retrieve(
                &cancel,
                &RetrievalRequest::new(1, "today", Strategy::ScheduleBm25Only),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidTimeRange { .. }));
    }

    fn wide_retriever(fail: bool) -> Retriever {
        Retriever::new(
            Arc::new(WideBackend),
            Some(Arc::new(FixedEmbedder)),
            Some(Arc::new(FlakyReranker {
                fail: AtomicBool::new(fail),
            })),
            RetrieverSettings::default(),
        )
    }

    const COMPLEX_QUERY: &str = "what were the notes about redis and caching";

    #[tokio::test]
    async fn reranker_reorders_and_rescores() {
        let r = wide_retriever(false);
        let cancel = CancellationToken::new();
        let out = r
            .retrieve(
                &cancel,
                &RetrievalRequest::new(1, COMPLEX_QUERY, Strategy::FullPipelineWithReranker),
            )
            .await
            .unwrap();
        assert!(out.reranked);
        // The flaky reranker reverses the fused order (3,4,1,2,5,6 → 6 first)
        // and assigns its own descending scores.
        assert_eq!(out.items[0].id, 6);
        assert!(out.items[0].score > out.items[1].score);
    }

    #[tokio::test]
    async fn reranker_failure_falls_back_to_hybrid_order() {
        let r = wide_retriever(true);
        let cancel = CancellationToken::new();
        let out = r
            .retrieve(
                &cancel,
                &RetrievalRequest::new(1, COMPLEX_QUERY, Strategy::FullPipelineWithReranker),
            )
            .await
            .unwrap();
        assert!(!out.reranked);
        // Docs 3 and 4 appear in both lists, so the hybrid order leads
        // with them.
        assert_eq!(out.items[0].id, 3);
        assert_eq!(out.items[1].id, 4);
    }

    #[tokio::test]
    async fn small_result_sets_skip_reranker() {
        let reranker = Arc::new(FlakyReranker {
            fail: AtomicBool::new(false),
        });
        let r = Retriever::new(
            Arc::new(FakeBackend {
                vector_fails: false,
                bm25_fails: false,
            }),
            Some(Arc::new(FixedEmbedder)),
            Some(reranker),
            RetrieverSettings::default(),
        );
        let cancel = CancellationToken::new();
        let out = r
            .retrieve(
                &cancel,
                &RetrievalRequest::new(1, COMPLEX_QUERY, Strategy::FullPipelineWithReranker),
            )
            .await
            .unwrap();
        // Only 3 fused docs — below the rerank threshold of 5.
        assert!(!out.reranked);
    }
}
