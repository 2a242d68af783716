//! Tool system for expert tool calling.
//!
//! Defines the `Tool` trait all tools implement, a registry keyed by name,
//! and the special `report_inability` marker the executor intercepts to
//! signal handoff.

pub mod memo_list;
pub mod memo_search;
pub mod schedule_query;

pub use memo_list::MemoListTool;
pub use memo_search::MemoSearchTool;
pub use schedule_query::ScheduleQueryTool;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use mnemo_blocks::BlockEvent;
use mnemo_provider::ToolDefinition;

/// Name of the marker tool an expert calls to hand the task off.
pub const REPORT_INABILITY: &str = "report_inability";

/// Ambient context for a tool call: cooperative cancellation plus the
/// identity the tool operates on behalf of.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub cancel: CancellationToken,
    pub user_id: i64,
}

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Text content returned to the LLM.
    pub content: String,
    /// Whether the tool execution failed.
    pub is_error: bool,
    /// Optional domain event (e.g. memo_query_result) surfaced on the
    /// outbound stream in addition to the generic tool_result event.
    #[serde(skip)]
    pub domain_event: Option<BlockEvent>,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
            domain_event: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
            domain_event: None,
        }
    }

    pub fn with_domain_event(mut self, event: BlockEvent) -> Self {
        self.domain_event = Some(event);
        self
    }
}

/// Trait that all tools must implement. Tool calls are never auto-retried —
/// they may have side effects.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name for this tool (e.g. "memo_search").
    fn name(&self) -> &str;
    /// Human-readable description of what this tool does.
    fn description(&self) -> &str;
    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute the tool with the given input.
    async fn execute(&self, ctx: &ToolContext, input: serde_json::Value) -> ToolResult;
}

/// Registry of available tools, built at startup from declarative config.
/// The only dynamic-dispatch site for tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// API-level definitions for a named subset, in the given order.
    /// Unknown names are skipped.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Definition of the handoff marker tool, appended to every ReAct expert's
/// tool list.
pub fn report_inability_definition() -> ToolDefinition {
    ToolDefinition {
        name: REPORT_INABILITY.to_string(),
        description: "Call this when the request needs an ability you do not have. \
                      Describe the ability so another expert can take over."
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "ability_needed": {
                    "type": "string",
                    "description": "Short description of the missing ability, e.g. 'memo search'."
                }
            },
            "required": ["ability_needed"]
        }),
    }
}
