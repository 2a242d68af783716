use crate::provider::Usage;

/// Events emitted during an LLM streaming response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text content from the model.
    TextDelta { text: String },

    /// Incremental internal reasoning content. Callers decide how to
    /// surface or discard it; never shown to end users verbatim.
    Thinking { text: String },

    /// Model wants to call a tool.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// Stream completed successfully. Carries the final usage figures
    /// including prompt-cache reads/writes.
    Done {
        model: String,
        usage: Usage,
        stop_reason: String,
    },

    /// Error during streaming.
    Error { message: String },
}
