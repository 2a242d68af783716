use chrono::Utc;
use serde::{Deserialize, Serialize};

use mnemo_core::types::{BlockId, ConversationId, UserId};

/// A persisted conversation. Owns its blocks (cascade on delete).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub user_id: UserId,
    pub title: Option<String>,
    /// Which agent persona owns this conversation (e.g. "assistant").
    pub agent_type: String,
    /// Temporary conversations skip summarization and title generation.
    pub temporary: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Message,
    /// Carries no content; resets history visibility for the context builder.
    ContextSeparator,
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockType::Message => write!(f, "message"),
            BlockType::ContextSeparator => write!(f, "context_separator"),
        }
    }
}

impl std::str::FromStr for BlockType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "message" => Ok(BlockType::Message),
            "context_separator" => Ok(BlockType::ContextSeparator),
            other => Err(format!("unknown block type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockMode {
    #[default]
    Normal,
    Geek,
    Evolution,
}

impl std::fmt::Display for BlockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockMode::Normal => write!(f, "normal"),
            BlockMode::Geek => write!(f, "geek"),
            BlockMode::Evolution => write!(f, "evolution"),
        }
    }
}

impl std::str::FromStr for BlockMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "normal" => Ok(BlockMode::Normal),
            "geek" => Ok(BlockMode::Geek),
            "evolution" => Ok(BlockMode::Evolution),
            other => Err(format!("unknown block mode: {other}")),
        }
    }
}

/// Block lifecycle. Once Completed or Error only `metadata` may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    #[default]
    Pending,
    Streaming,
    Completed,
    Error,
}

impl BlockStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BlockStatus::Completed | BlockStatus::Error)
    }
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockStatus::Pending => write!(f, "pending"),
            BlockStatus::Streaming => write!(f, "streaming"),
            BlockStatus::Completed => write!(f, "completed"),
            BlockStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for BlockStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BlockStatus::Pending),
            "streaming" => Ok(BlockStatus::Streaming),
            "completed" => Ok(BlockStatus::Completed),
            "error" => Ok(BlockStatus::Error),
            other => Err(format!("unknown block status: {other}")),
        }
    }
}

/// One user message inside a block. Blocks can accumulate several inputs
/// while still pending (rapid follow-ups merged into one turn).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInput {
    pub content: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl UserInput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            timestamp_ms: Utc::now().timestamp_millis(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// Typed events appended to a block while it is being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Thinking,
    ToolUse,
    ToolResult,
    Answer,
    Plan,
    TaskStart,
    TaskEnd,
    MemoQueryResult,
    ScheduleQueryResult,
    ScheduleUpdated,
    UiHint,
    UserMessage,
    Warning,
    Error,
    SessionStats,
}

impl EventType {
    /// Wire name used on outbound stream frames.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Thinking => "thinking",
            EventType::ToolUse => "tool_use",
            EventType::ToolResult => "tool_result",
            EventType::Answer => "answer",
            EventType::Plan => "plan",
            EventType::TaskStart => "task_start",
            EventType::TaskEnd => "task_end",
            EventType::MemoQueryResult => "memo_query_result",
            EventType::ScheduleQueryResult => "schedule_query_result",
            EventType::ScheduleUpdated => "schedule_updated",
            EventType::UiHint => "ui_hint",
            EventType::UserMessage => "user_message",
            EventType::Warning => "warning",
            EventType::Error => "error",
            EventType::SessionStats => "session_stats",
        }
    }

    /// Critical events must reach the client; failure to deliver them
    /// aborts the stream. Everything else is best-effort.
    pub fn is_critical(&self) -> bool {
        matches!(self, EventType::Answer | EventType::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub content: String,
    /// Milliseconds since the Unix epoch — the canonical event order.
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl BlockEvent {
    pub fn new(event_type: EventType, content: impl Into<String>) -> Self {
        Self {
            event_type,
            content: content.into(),
            timestamp_ms: Utc::now().timestamp_millis(),
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Accumulated per-block accounting, persisted on completion and carried on
/// the final stream frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_write_tokens: u32,
    pub total_tokens: u32,
    pub cost_usd: f64,
    pub tool_call_count: u32,
    pub tools_used: Vec<String>,
    pub model: Option<String>,
    pub thinking_ms: u64,
    pub tool_ms: u64,
    pub generation_ms: u64,
    pub total_ms: u64,
    pub had_error: bool,
}

/// A turn-level transcript record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub conversation_id: ConversationId,
    /// Unique, strictly increasing per conversation; assigned at insert.
    pub round_number: i64,
    pub block_type: BlockType,
    pub mode: BlockMode,
    pub status: BlockStatus,
    pub user_inputs: Vec<UserInput>,
    pub assistant_content: Option<String>,
    pub event_stream: Vec<BlockEvent>,
    pub session_stats: SessionStats,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub parent_block_id: Option<BlockId>,
    /// Fork lineage, e.g. "/<root-id>/<child-id>".
    pub branch_path: String,
    pub archived: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Block {
    /// Events sorted by timestamp — the display order contract. Persistence
    /// order may differ under concurrent appends.
    pub fn events_in_order(&self) -> Vec<BlockEvent> {
        let mut events = self.event_stream.clone();
        events.sort_by_key(|e| e.timestamp_ms);
        events
    }

    /// Concatenated user input text for prompt rendering.
    pub fn user_text(&self) -> String {
        self.user_inputs
            .iter()
            .map(|i| i.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A summary record that lets the context builder truncate history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: i64,
    pub conversation_id: ConversationId,
    /// Last block covered by this summary.
    pub last_block_id: BlockId,
    pub summary: String,
    pub token_usage: u32,
    pub created_at: String,
}
