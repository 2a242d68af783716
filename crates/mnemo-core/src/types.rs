use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Numeric user identifier.
///
/// Kept as `i64` (not a UUID) because reserved default conversations derive
/// their id from it by bit-shifting — see [`ConversationId::fixed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl UserId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

/// Conversation identifier.
///
/// Regular conversations get a random positive id; each user also owns up to
/// 256 reserved "default" conversations, one per agent offset, with the id
/// derived as `(user_id << 8) | agent_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub i64);

impl ConversationId {
    /// Reserved default conversation for a (user, agent-offset) pair.
    ///
    /// With 64-bit ids the shift cannot collide until `user_id >= 2^55`.
    pub fn fixed(user: UserId, agent_offset: u8) -> Self {
        Self((user.0 << 8) | agent_offset as i64)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ConversationId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

/// Block identifier (UUIDv7 — time-sortable for easier log correlation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(pub String);

impl BlockId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BlockId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Coarse intent classification produced by the router and consumed by the
/// budget allocator and retrieval strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    /// Looking something up (memos, schedules).
    Query,
    /// Creating or updating something (a schedule draft, a note).
    Create,
    /// Open-ended conversation with no retrieval need.
    #[default]
    Chat,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::Query => write!(f, "query"),
            Intent::Create => write!(f, "create"),
            Intent::Chat => write!(f, "chat"),
        }
    }
}

impl std::str::FromStr for Intent {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "query" => Ok(Intent::Query),
            "create" => Ok(Intent::Create),
            "chat" => Ok(Intent::Chat),
            other => Err(format!("unknown intent: {other}")),
        }
    }
}

/// Rough task-complexity tag attached to routing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskComplexity {
    #[default]
    Simple,
    Complex,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_conversation_id_packs_user_and_offset() {
        let id = ConversationId::fixed(UserId(42), 3);
        assert_eq!(id.as_i64(), (42 << 8) | 3);
    }

    #[test]
    fn fixed_ids_are_distinct_per_offset() {
        let a = ConversationId::fixed(UserId(7), 0);
        let b = ConversationId::fixed(UserId(7), 1);
        assert_ne!(a, b);
    }

    #[test]
    fn block_ids_are_time_sortable() {
        let a = BlockId::new();
        let b = BlockId::new();
        // UUIDv7 sorts lexicographically by creation time.
        assert!(a.as_str() <= b.as_str());
    }
}
