//! Sticky-route metadata: per-conversation last intent/expert plus an
//! optional pending working state, persisted in SQLite with a short-TTL
//! in-memory cache layered on top.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use mnemo_core::types::{ConversationId, Intent};

use crate::error::Result;

/// A pending, user-confirmable draft (e.g. a proposed schedule entry).
/// At most one per conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingState {
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Persisted routing state for one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingMetadata {
    pub conversation_id: ConversationId,
    pub last_intent: Intent,
    pub last_expert: String,
    pub last_tool: Option<String>,
    pub working_state: Option<WorkingState>,
    pub updated_at: DateTime<Utc>,
}

/// Short follow-up tokens that confirm the previous turn in any of the
/// configured languages.
const CONFIRMATION_TOKENS: &[&str] = &[
    "ok", "okay", "yes", "yep", "sure", "do it", "go ahead", "sounds good",
    "好的", "好", "嗯", "是的", "可以", "行", "确认",
];

/// Pronoun/reference patterns that tie a short turn to the previous one.
const REFERENCE_TOKENS: &[&str] = &[
    "it", "that", "this", "them", "those", "the same",
    "那个", "这个", "它", "他们", "刚才", "上面",
];

/// Reads and writes per-conversation routing metadata.
pub struct StickyManager {
    db: Mutex<Connection>,
    cache: DashMap<i64, (RoutingMetadata, Instant)>,
    /// Validity window for sticky decisions.
    ttl: Duration,
    /// In-memory cache freshness (5 minutes, layered over the DB).
    cache_ttl: Duration,
}

impl StickyManager {
    pub fn new(conn: Connection, ttl: Duration) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS routing_metadata (
                conversation_id INTEGER PRIMARY KEY,
                last_intent     TEXT NOT NULL,
                last_expert     TEXT NOT NULL,
                last_tool       TEXT,
                working_state   TEXT,
                updated_at      TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            db: Mutex::new(conn),
            cache: DashMap::new(),
            ttl,
            cache_ttl: Duration::from_secs(300),
        })
    }

    /// Record the outcome of a successful reply.
    pub fn record(
        &self,
        conversation_id: ConversationId,
        intent: Intent,
        expert: &str,
        tool: Option<&str>,
        working_state: Option<WorkingState>,
    ) -> Result<()> {
        let now = Utc::now();
        let state_json = working_state
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO routing_metadata
             (conversation_id, last_intent, last_expert, last_tool, working_state, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(conversation_id) DO UPDATE SET
               last_intent = excluded.last_intent,
               last_expert = excluded.last_expert,
               last_tool = excluded.last_tool,
               working_state = excluded.working_state,
               updated_at = excluded.updated_at",
            rusqlite::params![
                conversation_id.as_i64(),
                intent.to_string(),
                expert,
                tool,
                state_json,
                now.to_rfc3339()
            ],
        )?;
        drop(db);

        let meta = RoutingMetadata {
            conversation_id,
            last_intent: intent,
            last_expert: expert.to_string(),
            last_tool: tool.map(str::to_string),
            working_state,
            updated_at: now,
        };
        self.cache
            .insert(conversation_id.as_i64(), (meta, Instant::now()));
        Ok(())
    }

    /// Current metadata regardless of TTL. Cache first, then DB.
    pub fn get(&self, conversation_id: ConversationId) -> Result<Option<RoutingMetadata>> {
        if let Some(entry) = self.cache.get(&conversation_id.as_i64()) {
            let (meta, cached_at) = entry.value();
            if cached_at.elapsed() < self.cache_ttl {
                return Ok(Some(meta.clone()));
            }
        }

        let db = self.db.lock().unwrap();
        let row = db
            .query_row(
                "SELECT last_intent, last_expert, last_tool, working_state, updated_at
                 FROM routing_metadata WHERE conversation_id = ?1",
                rusqlite::params![conversation_id.as_i64()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        drop(db);

        let Some((intent, expert, tool, state_json, updated_at)) = row else {
            return Ok(None);
        };
        let meta = RoutingMetadata {
            conversation_id,
            last_intent: intent.parse().unwrap_or_default(),
            last_expert: expert,
            last_tool: tool,
            working_state: state_json.and_then(|s| serde_json::from_str(&s).ok()),
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        };
        self.cache
            .insert(conversation_id.as_i64(), (meta.clone(), Instant::now()));
        Ok(Some(meta))
    }

    /// Metadata only when still inside the sticky TTL window.
    pub fn get_valid(&self, conversation_id: ConversationId) -> Result<Option<RoutingMetadata>> {
        let Some(meta) = self.get(conversation_id)? else {
            return Ok(None);
        };
        let age = Utc::now().signed_duration_since(meta.updated_at);
        if age.num_seconds() >= 0 && (age.num_seconds() as u64) < self.ttl.as_secs() {
            Ok(Some(meta))
        } else {
            Ok(None)
        }
    }

    /// Drop the pending working state once consumed or abandoned.
    pub fn clear_working_state(&self, conversation_id: ConversationId) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE routing_metadata SET working_state = NULL WHERE conversation_id = ?1",
            rusqlite::params![conversation_id.as_i64()],
        )?;
        drop(db);
        self.cache.remove(&conversation_id.as_i64());
        Ok(())
    }

    /// Delete metadata alongside its conversation.
    pub fn delete(&self, conversation_id: ConversationId) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM routing_metadata WHERE conversation_id = ?1",
            rusqlite::params![conversation_id.as_i64()],
        )?;
        drop(db);
        self.cache.remove(&conversation_id.as_i64());
        Ok(())
    }
}

/// Short confirmation like "ok" / "好的" in any configured language.
pub fn is_short_confirmation(input: &str) -> bool {
    let trimmed = input.trim().trim_end_matches(['!', '.', '。', '！']).to_lowercase();
    if trimmed.chars().count() > 12 {
        return false;
    }
    CONFIRMATION_TOKENS.iter().any(|t| trimmed == *t)
}

/// Whether a short turn refers back to the previous intent: keyword overlap
/// with the previous expert's vocabulary, or a pronoun/reference pattern.
pub fn is_related_to_last_intent(input: &str, expert_keywords: &[String]) -> bool {
    let lowered = input.to_lowercase();
    if expert_keywords
        .iter()
        .any(|k| lowered.contains(&k.to_lowercase()))
    {
        return true;
    }
    let word_count = lowered.split_whitespace().count();
    if word_count > 8 {
        return false;
    }
    REFERENCE_TOKENS.iter().any(|t| {
        if t.is_ascii() {
            lowered
                .split(|c: char| !c.is_alphanumeric())
                .any(|w| w == *t)
        } else {
            lowered.contains(t)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(ttl_secs: u64) -> StickyManager {
        StickyManager::new(Connection::open_in_memory().unwrap(), Duration::from_secs(ttl_secs))
            .unwrap()
    }

    #[test]
    fn record_then_get_roundtrips() {
        let m = manager(300);
        let conv = ConversationId(7);
        m.record(conv, Intent::Query, "memo", Some("memo_search"), None)
            .unwrap();

        let meta = m.get_valid(conv).unwrap().unwrap();
        assert_eq!(meta.last_expert, "memo");
        assert_eq!(meta.last_intent, Intent::Query);
        assert_eq!(meta.last_tool.as_deref(), Some("memo_search"));
    }

    #[test]
    fn expired_metadata_is_not_valid() {
        let m = manager(0);
        let conv = ConversationId(8);
        m.record(conv, Intent::Chat, "memo", None, None).unwrap();
        assert!(m.get_valid(conv).unwrap().is_none());
        // Still present when queried without the TTL filter.
        assert!(m.get(conv).unwrap().is_some());
    }

    #[test]
    fn working_state_roundtrips_and_clears() {
        let m = manager(300);
        let conv = ConversationId(9);
        let state = WorkingState {
            kind: "schedule_draft".to_string(),
            payload: serde_json::json!({"title": "dentist"}),
            created_at: Utc::now(),
        };
        m.record(conv, Intent::Create, "schedule", None, Some(state))
            .unwrap();
        assert!(m.get(conv).unwrap().unwrap().working_state.is_some());

        m.clear_working_state(conv).unwrap();
        assert!(m.get(conv).unwrap().unwrap().working_state.is_none());
    }

    #[test]
    fn confirmation_tokens_match_in_both_languages() {
        assert!(is_short_confirmation("ok"));
        assert!(is_short_confirmation("  Yes! "));
        assert!(is_short_confirmation("好的"));
        assert!(is_short_confirmation("可以。"));
        assert!(!is_short_confirmation("ok but actually change the time"));
        assert!(!is_short_confirmation("what schedule"));
    }

    #[test]
    fn reference_patterns_tie_short_turns_back() {
        let keywords = vec!["schedule".to_string(), "meeting".to_string()];
        assert!(is_related_to_last_intent("move it to 3pm", &keywords));
        assert!(is_related_to_last_intent("把那个改到下午", &keywords));
        assert!(is_related_to_last_intent("and the meeting after", &keywords));
        assert!(!is_related_to_last_intent("tell me a joke", &keywords));
    }
}
