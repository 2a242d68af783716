use serde::{Deserialize, Serialize};

use crate::token::estimate_tokens;

/// Where a context segment came from. The role fixes its priority rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentRole {
    SystemPrompt,
    CurrentUserQuery,
    RecentTurns,
    RetrievalEvidence,
    EpisodicMemory,
    UserPreferences,
    OlderTurns,
}

impl SegmentRole {
    pub fn priority(&self) -> u8 {
        match self {
            SegmentRole::SystemPrompt => 100,
            SegmentRole::CurrentUserQuery => 90,
            SegmentRole::RecentTurns => 80,
            SegmentRole::RetrievalEvidence => 70,
            SegmentRole::EpisodicMemory => 60,
            SegmentRole::UserPreferences => 50,
            SegmentRole::OlderTurns => 40,
        }
    }
}

/// One candidate piece of prompt content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSegment {
    pub role: SegmentRole,
    pub priority: u8,
    pub token_cost: u32,
    pub content: String,
    /// Chronological ordering key within a role (round number for turns).
    /// Segments are offered to the ranker newest-first so the oldest are
    /// trimmed first; the builder re-sorts included turns by this key.
    pub seq: i64,
}

impl ContextSegment {
    pub fn new(role: SegmentRole, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            role,
            priority: role.priority(),
            token_cost: estimate_tokens(&content),
            content,
            seq: 0,
        }
    }

    pub fn with_seq(mut self, seq: i64) -> Self {
        self.seq = seq;
        self
    }
}
