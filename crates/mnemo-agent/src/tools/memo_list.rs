//! Chronological memo listing tool.

use std::sync::Arc;

use async_trait::async_trait;

use mnemo_blocks::{BlockEvent, EventType};
use mnemo_retrieval::{RetrievalRequest, Retriever, Strategy};

use super::schedule_query::parse_range;
use super::{Tool, ToolContext, ToolResult};

/// Lists recent memos, optionally bounded to a creation-time window.
pub struct MemoListTool {
    retriever: Arc<Retriever>,
}

impl MemoListTool {
    pub fn new(retriever: Arc<Retriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl Tool for MemoListTool {
    fn name(&self) -> &str {
        "memo_list"
    }

    fn description(&self) -> &str {
        "List the user's most recent memos chronologically. Optional \
         start/end RFC3339 timestamps bound the listing to a window."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "start": { "type": "string", "description": "RFC3339 window start (optional)." },
                "end": { "type": "string", "description": "RFC3339 window end (optional)." },
                "limit": { "type": "integer", "description": "Max memos to return (default 20)." }
            }
        })
    }

    async fn execute(&self, ctx: &ToolContext, input: serde_json::Value) -> ToolResult {
        let range = match parse_range(&input) {
            Ok(range) => range,
            Err(msg) => return ToolResult::error(msg),
        };
        let limit = input
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize);

        let mut request = RetrievalRequest::new(
            ctx.user_id,
            "",
            if range.is_some() {
                Strategy::MemoFilterOnly
            } else {
                Strategy::MemoListOnly
            },
        );
        request.time_range = range;
        request.limit = limit;

        match self.retriever.retrieve(&ctx.cancel, &request).await {
            Ok(outcome) if outcome.items.is_empty() => {
                ToolResult::success("No memos in that window.")
            }
            Ok(outcome) => {
                let mut out = format!("{} memo(s):\n", outcome.items.len());
                for item in &outcome.items {
                    out.push_str(&format!("- {}\n", item.content));
                }
                let event = BlockEvent::new(
                    EventType::MemoQueryResult,
                    serde_json::to_string(&outcome.items).unwrap_or_default(),
                );
                ToolResult::success(out.trim_end().to_string()).with_domain_event(event)
            }
            Err(e) => ToolResult::error(format!("memo_list failed: {e}")),
        }
    }
}
