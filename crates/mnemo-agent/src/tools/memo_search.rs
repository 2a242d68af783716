//! Hybrid memo search tool.

use std::sync::Arc;

use async_trait::async_trait;

use mnemo_blocks::{BlockEvent, EventType};
use mnemo_retrieval::{RetrievalRequest, Retriever, Strategy};

use super::{Tool, ToolContext, ToolResult};

/// Searches the user's memos with hybrid (vector + BM25) retrieval.
pub struct MemoSearchTool {
    retriever: Arc<Retriever>,
}

impl MemoSearchTool {
    pub fn new(retriever: Arc<Retriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl Tool for MemoSearchTool {
    fn name(&self) -> &str {
        "memo_search"
    }

    fn description(&self) -> &str {
        "Search the user's memos and notes. Combines semantic and keyword \
         search; use a focused query with the key terms."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query, e.g. 'Redis caching'."
                },
                "rerank": {
                    "type": "boolean",
                    "description": "Run the full pipeline with reranking for hard queries."
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, input: serde_json::Value) -> ToolResult {
        let query = match input.get("query").and_then(|v| v.as_str()) {
            Some(q) if !q.trim().is_empty() => q.to_string(),
            _ => return ToolResult::error("missing required parameter: query"),
        };
        let strategy = if input.get("rerank").and_then(|v| v.as_bool()).unwrap_or(false) {
            Strategy::FullPipelineWithReranker
        } else {
            Strategy::HybridStandard
        };

        let request = RetrievalRequest::new(ctx.user_id, query.clone(), strategy);
        match self.retriever.retrieve(&ctx.cancel, &request).await {
            Ok(outcome) if outcome.items.is_empty() => {
                ToolResult::success(format!("No memos found for: {query}"))
            }
            Ok(outcome) => {
                let mut out = String::new();
                if let Some(note) = &outcome.degraded {
                    out.push_str(&format!("(partial results: {note})\n"));
                }
                out.push_str(&format!("Found {} memo(s):\n", outcome.items.len()));
                for item in &outcome.items {
                    out.push_str(&format!("- {}\n", item.content));
                }
                let event = BlockEvent::new(
                    EventType::MemoQueryResult,
                    serde_json::to_string(&outcome.items).unwrap_or_default(),
                );
                ToolResult::success(out.trim_end().to_string()).with_domain_event(event)
            }
            Err(e) => ToolResult::error(format!("memo_search failed: {e}")),
        }
    }
}
