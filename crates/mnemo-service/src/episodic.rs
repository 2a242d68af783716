//! Episodic memory backed by semantic memo retrieval.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use mnemo_context::{Episode, EpisodicMemory};
use mnemo_retrieval::{RetrievalRequest, Retriever, Strategy};

/// Recalls semantically similar past memos as episodes. Failures degrade
/// to an empty recall — episodic memory is never load-bearing.
pub struct RetrievalEpisodic {
    retriever: Arc<Retriever>,
}

impl RetrievalEpisodic {
    pub fn new(retriever: Arc<Retriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl EpisodicMemory for RetrievalEpisodic {
    async fn recall(&self, user_id: i64, query: &str, k: usize) -> Vec<Episode> {
        let mut request = RetrievalRequest::new(user_id, query, Strategy::MemoSemanticOnly);
        request.limit = Some(k);
        let cancel = CancellationToken::new();
        match self.retriever.retrieve(&cancel, &request).await {
            Ok(outcome) => outcome
                .items
                .into_iter()
                .map(|item| Episode {
                    content: item.content,
                    score: item.score,
                })
                .collect(),
            Err(e) => {
                warn!(err = %e, "episodic recall failed, continuing without");
                Vec::new()
            }
        }
    }
}
