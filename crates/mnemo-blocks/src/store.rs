use std::str::FromStr;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use mnemo_core::types::{BlockId, ConversationId, UserId};

use crate::error::{BlockError, Result};
use crate::types::*;

/// Filters for [`BlockStore::list_blocks`].
#[derive(Debug, Clone, Default)]
pub struct BlockFilter {
    pub status: Option<BlockStatus>,
    pub block_type: Option<BlockType>,
    pub include_archived: bool,
    pub limit: Option<usize>,
}

/// Thread-safe transcript store.
///
/// Wraps a single SQLite connection in a `Mutex`; every public mutation is
/// one short transaction, so callers can invoke streaming appends without
/// holding any transaction themselves.
pub struct BlockStore {
    db: Mutex<Connection>,
}

impl BlockStore {
    /// Wrap an already-open connection, initialising tables if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        crate::db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    /// Create a conversation with a store-assigned id.
    pub fn create_conversation(
        &self,
        user_id: UserId,
        agent_type: &str,
        temporary: bool,
    ) -> Result<Conversation> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO conversations (user_id, agent_type, temporary, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            rusqlite::params![user_id.as_i64(), agent_type, temporary as i64, now],
        )?;
        let id = db.last_insert_rowid();
        Ok(Conversation {
            id: ConversationId(id),
            user_id,
            title: None,
            agent_type: agent_type.to_string(),
            temporary,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Return the reserved default conversation for (user, agent_offset),
    /// creating it on first use. The id is `(user_id << 8) | agent_offset`.
    pub fn get_or_create_fixed(
        &self,
        user_id: UserId,
        agent_offset: u8,
        agent_type: &str,
    ) -> Result<Conversation> {
        let id = ConversationId::fixed(user_id, agent_offset);
        if let Some(conv) = self.get_conversation(id)? {
            return Ok(conv);
        }

        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        // INSERT OR IGNORE handles the race where two requests create it at once.
        db.execute(
            "INSERT OR IGNORE INTO conversations
             (id, user_id, agent_type, temporary, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?4)",
            rusqlite::params![id.as_i64(), user_id.as_i64(), agent_type, now],
        )?;
        drop(db);
        self.get_conversation(id)?
            .ok_or(BlockError::ConversationNotFound { id: id.as_i64() })
    }

    pub fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, user_id, title, agent_type, temporary, created_at, updated_at
             FROM conversations WHERE id = ?1",
            rusqlite::params![id.as_i64()],
            row_to_conversation,
        )
        .optional()
        .map_err(BlockError::Database)
    }

    pub fn list_conversations(&self, user_id: UserId, limit: usize) -> Result<Vec<Conversation>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user_id, title, agent_type, temporary, created_at, updated_at
             FROM conversations
             WHERE user_id = ?1
             ORDER BY updated_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![user_id.as_i64(), limit as i64],
            row_to_conversation,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn set_title(&self, id: ConversationId, title: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![title, now, id.as_i64()],
        )?;
        if changed == 0 {
            return Err(BlockError::ConversationNotFound { id: id.as_i64() });
        }
        Ok(())
    }

    /// Delete a conversation with its blocks and checkpoints.
    pub fn delete_conversation(&self, id: ConversationId) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "DELETE FROM blocks WHERE conversation_id = ?1",
            rusqlite::params![id.as_i64()],
        )?;
        tx.execute(
            "DELETE FROM checkpoints WHERE conversation_id = ?1",
            rusqlite::params![id.as_i64()],
        )?;
        let changed = tx.execute(
            "DELETE FROM conversations WHERE id = ?1",
            rusqlite::params![id.as_i64()],
        )?;
        tx.commit()?;
        if changed == 0 {
            return Err(BlockError::ConversationNotFound { id: id.as_i64() });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    /// Create a block in PENDING state, atomically assigning the next
    /// round_number for the conversation.
    pub fn create_block(
        &self,
        conversation_id: ConversationId,
        block_type: BlockType,
        mode: BlockMode,
        user_inputs: Vec<UserInput>,
    ) -> Result<Block> {
        let id = BlockId::new();
        let now = chrono::Utc::now().to_rfc3339();
        let inputs_json = serde_json::to_string(&user_inputs)?;
        let branch_path = format!("/{}", id);

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let round: i64 = tx.query_row(
            "SELECT COALESCE(MAX(round_number), 0) + 1 FROM blocks WHERE conversation_id = ?1",
            rusqlite::params![conversation_id.as_i64()],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO blocks
             (id, conversation_id, round_number, block_type, mode, status,
              user_inputs, branch_path, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?8)",
            rusqlite::params![
                id.as_str(),
                conversation_id.as_i64(),
                round,
                block_type.to_string(),
                mode.to_string(),
                inputs_json,
                branch_path,
                now,
            ],
        )?;
        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now, conversation_id.as_i64()],
        )?;
        tx.commit()?;

        debug!(block = %id, round, conversation = %conversation_id, "block created");
        Ok(Block {
            id,
            conversation_id,
            round_number: round,
            block_type,
            mode,
            status: BlockStatus::Pending,
            user_inputs,
            assistant_content: None,
            event_stream: Vec::new(),
            session_stats: SessionStats::default(),
            metadata: serde_json::Map::new(),
            parent_block_id: None,
            branch_path,
            archived: false,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Insert a CONTEXT_SEPARATOR block. Idempotent: if the latest block is
    /// already a separator the call is a no-op returning that block.
    pub fn create_separator(&self, conversation_id: ConversationId) -> Result<Block> {
        if let Some(latest) = self.latest_block(conversation_id)? {
            if latest.block_type == BlockType::ContextSeparator {
                return Ok(latest);
            }
        }
        let block = self.create_block(
            conversation_id,
            BlockType::ContextSeparator,
            BlockMode::Normal,
            Vec::new(),
        )?;
        // Separators carry no content and never stream.
        self.complete_block(&block.id, None, SessionStats::default())?;
        self.get_block(&block.id)?
            .ok_or_else(|| BlockError::BlockNotFound {
                id: block.id.to_string(),
            })
    }

    pub fn latest_block(&self, conversation_id: ConversationId) -> Result<Option<Block>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("{SELECT_BLOCK} WHERE conversation_id = ?1 ORDER BY round_number DESC LIMIT 1"),
            rusqlite::params![conversation_id.as_i64()],
            row_to_block,
        )
        .optional()
        .map_err(BlockError::Database)
    }

    pub fn get_block(&self, id: &BlockId) -> Result<Option<Block>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("{SELECT_BLOCK} WHERE id = ?1"),
            rusqlite::params![id.as_str()],
            row_to_block,
        )
        .optional()
        .map_err(BlockError::Database)
    }

    /// Append a user input. Only allowed while the block is PENDING or
    /// STREAMING.
    pub fn append_user_input(&self, id: &BlockId, input: UserInput) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let (status, inputs_json): (String, String) = tx
            .query_row(
                "SELECT status, user_inputs FROM blocks WHERE id = ?1",
                rusqlite::params![id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| BlockError::BlockNotFound { id: id.to_string() })?;

        let parsed = BlockStatus::from_str(&status).unwrap_or_default();
        if parsed.is_terminal() {
            return Err(BlockError::InvalidState {
                id: id.to_string(),
                status,
                operation: "append_user_input",
            });
        }

        let mut inputs: Vec<UserInput> = serde_json::from_str(&inputs_json)?;
        inputs.push(input);
        let now = chrono::Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE blocks SET user_inputs = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![serde_json::to_string(&inputs)?, now, id.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Append one event to the block's event stream.
    pub fn append_event(&self, id: &BlockId, event: BlockEvent) -> Result<()> {
        self.append_events_batch(id, std::slice::from_ref(&event))
    }

    /// Append several events in one write. Under streaming this batched path
    /// is the norm — it cuts write count by an order of magnitude.
    ///
    /// The first `answer` event moves a PENDING block to STREAMING.
    pub fn append_events_batch(&self, id: &BlockId, events: &[BlockEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let (status, stream_json): (String, String) = tx
            .query_row(
                "SELECT status, event_stream FROM blocks WHERE id = ?1",
                rusqlite::params![id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| BlockError::BlockNotFound { id: id.to_string() })?;

        let parsed = BlockStatus::from_str(&status).unwrap_or_default();
        if parsed.is_terminal() {
            return Err(BlockError::InvalidState {
                id: id.to_string(),
                status,
                operation: "append_event",
            });
        }

        let mut stream: Vec<BlockEvent> = serde_json::from_str(&stream_json)?;
        let starts_streaming = parsed == BlockStatus::Pending
            && events.iter().any(|e| e.event_type == EventType::Answer);
        stream.extend_from_slice(events);

        let now = chrono::Utc::now().to_rfc3339();
        let new_status = if starts_streaming {
            BlockStatus::Streaming
        } else {
            parsed
        };
        tx.execute(
            "UPDATE blocks SET event_stream = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
            rusqlite::params![
                serde_json::to_string(&stream)?,
                new_status.to_string(),
                now,
                id.as_str()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Atomically finish a block: status COMPLETED, content and stats set.
    pub fn complete_block(
        &self,
        id: &BlockId,
        assistant_content: Option<&str>,
        stats: SessionStats,
    ) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let status: String = tx
            .query_row(
                "SELECT status FROM blocks WHERE id = ?1",
                rusqlite::params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| BlockError::BlockNotFound { id: id.to_string() })?;

        if BlockStatus::from_str(&status).unwrap_or_default().is_terminal() {
            return Err(BlockError::InvalidState {
                id: id.to_string(),
                status,
                operation: "complete_block",
            });
        }

        let now = chrono::Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE blocks SET status = 'completed', assistant_content = ?1,
             session_stats = ?2, updated_at = ?3 WHERE id = ?4",
            rusqlite::params![
                assistant_content,
                serde_json::to_string(&stats)?,
                now,
                id.as_str()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Move a block to ERROR from any non-terminal state, recording the
    /// error event and partial stats.
    pub fn mark_error(
        &self,
        id: &BlockId,
        error_event: BlockEvent,
        stats: SessionStats,
    ) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let (status, stream_json): (String, String) = tx
            .query_row(
                "SELECT status, event_stream FROM blocks WHERE id = ?1",
                rusqlite::params![id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| BlockError::BlockNotFound { id: id.to_string() })?;

        if BlockStatus::from_str(&status).unwrap_or_default().is_terminal() {
            return Err(BlockError::InvalidState {
                id: id.to_string(),
                status,
                operation: "mark_error",
            });
        }

        let mut stream: Vec<BlockEvent> = serde_json::from_str(&stream_json)?;
        stream.push(error_event);
        let mut stats = stats;
        stats.had_error = true;

        let now = chrono::Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE blocks SET status = 'error', event_stream = ?1,
             session_stats = ?2, updated_at = ?3 WHERE id = ?4",
            rusqlite::params![
                serde_json::to_string(&stream)?,
                serde_json::to_string(&stats)?,
                now,
                id.as_str()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Merge keys into a block's metadata map. This is the only mutation
    /// allowed after a block reaches COMPLETED or ERROR.
    pub fn merge_block_metadata(
        &self,
        id: &BlockId,
        updates: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let meta_json: String = tx
            .query_row(
                "SELECT metadata FROM blocks WHERE id = ?1",
                rusqlite::params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| BlockError::BlockNotFound { id: id.to_string() })?;

        let mut meta: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&meta_json)?;
        meta.extend(updates);

        let now = chrono::Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE blocks SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![serde_json::to_string(&meta)?, now, id.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Fork a block: the child records its parent and extends the branch
    /// path. Sibling branches can later be archived.
    pub fn fork_block(
        &self,
        parent_id: &BlockId,
        reason: &str,
        replacement_user_inputs: Option<Vec<UserInput>>,
    ) -> Result<Block> {
        let parent = self
            .get_block(parent_id)?
            .ok_or_else(|| BlockError::BlockNotFound {
                id: parent_id.to_string(),
            })?;

        let inputs = replacement_user_inputs.unwrap_or_else(|| parent.user_inputs.clone());
        let mut child = self.create_block(
            parent.conversation_id,
            parent.block_type,
            parent.mode,
            inputs,
        )?;

        let branch_path = format!("{}/{}", parent.branch_path, child.id);
        let mut meta = serde_json::Map::new();
        meta.insert("fork_reason".to_string(), serde_json::Value::from(reason));

        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE blocks SET parent_block_id = ?1, branch_path = ?2, metadata = ?3
             WHERE id = ?4",
            rusqlite::params![
                parent_id.as_str(),
                branch_path,
                serde_json::to_string(&meta)?,
                child.id.as_str()
            ],
        )?;
        child.parent_block_id = Some(parent_id.clone());
        child.branch_path = branch_path;
        child.metadata = meta;
        Ok(child)
    }

    pub fn list_blocks(
        &self,
        conversation_id: ConversationId,
        filter: &BlockFilter,
    ) -> Result<Vec<Block>> {
        let conversation = conversation_id.as_i64();
        let status = filter.status.map(|s| s.to_string());
        let block_type = filter.block_type.map(|t| t.to_string());
        let limit = filter.limit.map(|l| l as i64);

        let mut sql = format!("{SELECT_BLOCK} WHERE conversation_id = ?1");
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&conversation];
        if !filter.include_archived {
            sql.push_str(" AND archived = 0");
        }
        if let Some(ref status) = status {
            params.push(status);
            sql.push_str(&format!(" AND status = ?{}", params.len()));
        }
        if let Some(ref block_type) = block_type {
            params.push(block_type);
            sql.push_str(&format!(" AND block_type = ?{}", params.len()));
        }
        sql.push_str(" ORDER BY round_number");
        if let Some(ref limit) = limit {
            params.push(limit);
            sql.push_str(&format!(" LIMIT ?{}", params.len()));
        }

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params.as_slice(), row_to_block)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Blocks on the active (non-archived) branch, in round order.
    pub fn get_active_path(&self, conversation_id: ConversationId) -> Result<Vec<Block>> {
        self.list_blocks(conversation_id, &BlockFilter::default())
    }

    /// Archive every branch that does not lead to `keep_leaf`.
    pub fn archive_inactive_branches(
        &self,
        conversation_id: ConversationId,
        keep_leaf: &BlockId,
    ) -> Result<usize> {
        let leaf = self
            .get_block(keep_leaf)?
            .ok_or_else(|| BlockError::BlockNotFound {
                id: keep_leaf.to_string(),
            })?;

        // A block is on the active path if the kept leaf's branch path
        // starts with its own (ancestor) or it has no fork lineage at all.
        let all = self.list_blocks(
            conversation_id,
            &BlockFilter {
                include_archived: true,
                ..BlockFilter::default()
            },
        )?;
        let mut archived = 0usize;
        let db = self.db.lock().unwrap();
        for block in &all {
            let on_path = leaf.branch_path.starts_with(&block.branch_path)
                || block.parent_block_id.is_none();
            if !on_path && !block.archived {
                db.execute(
                    "UPDATE blocks SET archived = 1 WHERE id = ?1",
                    rusqlite::params![block.id.as_str()],
                )?;
                archived += 1;
            }
        }
        Ok(archived)
    }

    /// Blocks visible to the context builder: everything after the latest
    /// CONTEXT_SEPARATOR (or all blocks when none exists), active branch only.
    pub fn blocks_since_separator(&self, conversation_id: ConversationId) -> Result<Vec<Block>> {
        let blocks = self.get_active_path(conversation_id)?;
        let cut = blocks
            .iter()
            .rposition(|b| b.block_type == BlockType::ContextSeparator);
        Ok(match cut {
            Some(i) => blocks[i + 1..].to_vec(),
            None => blocks,
        })
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    pub fn write_checkpoint(
        &self,
        conversation_id: ConversationId,
        last_block_id: &BlockId,
        summary: &str,
        token_usage: u32,
    ) -> Result<Checkpoint> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO checkpoints (conversation_id, last_block_id, summary, token_usage, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                conversation_id.as_i64(),
                last_block_id.as_str(),
                summary,
                token_usage,
                now
            ],
        )?;
        Ok(Checkpoint {
            id: db.last_insert_rowid(),
            conversation_id,
            last_block_id: last_block_id.clone(),
            summary: summary.to_string(),
            token_usage,
            created_at: now,
        })
    }

    pub fn latest_checkpoint(&self, conversation_id: ConversationId) -> Result<Option<Checkpoint>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, conversation_id, last_block_id, summary, token_usage, created_at
             FROM checkpoints WHERE conversation_id = ?1 ORDER BY id DESC LIMIT 1",
            rusqlite::params![conversation_id.as_i64()],
            |row| {
                Ok(Checkpoint {
                    id: row.get(0)?,
                    conversation_id: ConversationId(row.get(1)?),
                    last_block_id: BlockId(row.get(2)?),
                    summary: row.get(3)?,
                    token_usage: row.get(4)?,
                    created_at: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(BlockError::Database)
    }

    /// Completed MESSAGE blocks newer than the latest checkpoint — the
    /// summarizer's trigger input.
    pub fn blocks_since_checkpoint(&self, conversation_id: ConversationId) -> Result<Vec<Block>> {
        let checkpoint = self.latest_checkpoint(conversation_id)?;
        let blocks = self.get_active_path(conversation_id)?;
        let completed: Vec<Block> = blocks
            .into_iter()
            .filter(|b| b.block_type == BlockType::Message && b.status == BlockStatus::Completed)
            .collect();

        Ok(match checkpoint {
            Some(cp) => {
                let last_round = completed
                    .iter()
                    .find(|b| b.id == cp.last_block_id)
                    .map(|b| b.round_number);
                match last_round {
                    Some(round) => completed
                        .into_iter()
                        .filter(|b| b.round_number > round)
                        .collect(),
                    None => completed,
                }
            }
            None => completed,
        })
    }
}

const SELECT_BLOCK: &str = "SELECT id, conversation_id, round_number, block_type, mode, status,
    user_inputs, assistant_content, event_stream, session_stats, metadata,
    parent_block_id, branch_path, archived, created_at, updated_at FROM blocks";

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: ConversationId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        title: row.get(2)?,
        agent_type: row.get(3)?,
        temporary: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<Block> {
    let inputs_json: String = row.get(6)?;
    let stream_json: String = row.get(8)?;
    let stats_json: String = row.get(9)?;
    let meta_json: String = row.get(10)?;
    let parent: Option<String> = row.get(11)?;

    Ok(Block {
        id: BlockId(row.get(0)?),
        conversation_id: ConversationId(row.get(1)?),
        round_number: row.get(2)?,
        block_type: row
            .get::<_, String>(3)?
            .parse()
            .unwrap_or(BlockType::Message),
        mode: row.get::<_, String>(4)?.parse().unwrap_or_default(),
        status: row.get::<_, String>(5)?.parse().unwrap_or_default(),
        user_inputs: serde_json::from_str(&inputs_json).unwrap_or_default(),
        assistant_content: row.get(7)?,
        event_stream: serde_json::from_str(&stream_json).unwrap_or_default(),
        session_stats: serde_json::from_str(&stats_json).unwrap_or_default(),
        metadata: serde_json::from_str(&meta_json).unwrap_or_default(),
        parent_block_id: parent.map(BlockId),
        branch_path: row.get(12)?,
        archived: row.get::<_, i64>(13)? != 0,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> BlockStore {
        BlockStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn conversation(store: &BlockStore) -> Conversation {
        store.create_conversation(UserId(1), "assistant", false).unwrap()
    }

    #[test]
    fn round_numbers_are_strictly_increasing() {
        let store = store();
        let conv = conversation(&store);
        let mut rounds = Vec::new();
        for i in 0..5 {
            let b = store
                .create_block(
                    conv.id,
                    BlockType::Message,
                    BlockMode::Normal,
                    vec![UserInput::new(format!("msg {i}"))],
                )
                .unwrap();
            rounds.push(b.round_number);
        }
        assert_eq!(rounds, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn fixed_conversation_is_created_once() {
        let store = store();
        let a = store.get_or_create_fixed(UserId(42), 0, "assistant").unwrap();
        let b = store.get_or_create_fixed(UserId(42), 0, "assistant").unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.as_i64(), 42 << 8);
    }

    #[test]
    fn separator_creation_is_idempotent() {
        let store = store();
        let conv = conversation(&store);
        store
            .create_block(conv.id, BlockType::Message, BlockMode::Normal, vec![])
            .unwrap();
        let s1 = store.create_separator(conv.id).unwrap();
        let s2 = store.create_separator(conv.id).unwrap();
        assert_eq!(s1.id, s2.id);
        let all = store.list_blocks(conv.id, &BlockFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn list_blocks_applies_bound_filters() {
        let store = store();
        let conv = conversation(&store);
        let first = store
            .create_block(conv.id, BlockType::Message, BlockMode::Normal, vec![])
            .unwrap();
        store
            .complete_block(&first.id, Some("done"), SessionStats::default())
            .unwrap();
        store
            .create_block(conv.id, BlockType::Message, BlockMode::Normal, vec![])
            .unwrap();
        store.create_separator(conv.id).unwrap();

        let completed = store
            .list_blocks(
                conv.id,
                &BlockFilter {
                    status: Some(BlockStatus::Completed),
                    ..BlockFilter::default()
                },
            )
            .unwrap();
        // The completed message block plus the auto-completed separator.
        assert_eq!(completed.len(), 2);

        let separators = store
            .list_blocks(
                conv.id,
                &BlockFilter {
                    block_type: Some(BlockType::ContextSeparator),
                    ..BlockFilter::default()
                },
            )
            .unwrap();
        assert_eq!(separators.len(), 1);

        let limited = store
            .list_blocks(
                conv.id,
                &BlockFilter {
                    limit: Some(1),
                    ..BlockFilter::default()
                },
            )
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, first.id);
    }

    #[test]
    fn appends_rejected_after_completion() {
        let store = store();
        let conv = conversation(&store);
        let block = store
            .create_block(conv.id, BlockType::Message, BlockMode::Normal, vec![])
            .unwrap();
        store
            .complete_block(&block.id, Some("done"), SessionStats::default())
            .unwrap();

        let err = store
            .append_event(&block.id, BlockEvent::new(EventType::Answer, "late"))
            .unwrap_err();
        assert!(matches!(err, BlockError::InvalidState { .. }));

        let err = store
            .append_user_input(&block.id, UserInput::new("late"))
            .unwrap_err();
        assert!(matches!(err, BlockError::InvalidState { .. }));

        // Metadata is still mutable.
        let mut meta = serde_json::Map::new();
        meta.insert("note".into(), serde_json::Value::from("ok"));
        store.merge_block_metadata(&block.id, meta).unwrap();
    }

    #[test]
    fn first_answer_event_moves_block_to_streaming() {
        let store = store();
        let conv = conversation(&store);
        let block = store
            .create_block(conv.id, BlockType::Message, BlockMode::Normal, vec![])
            .unwrap();
        store
            .append_event(&block.id, BlockEvent::new(EventType::Thinking, "hm"))
            .unwrap();
        assert_eq!(
            store.get_block(&block.id).unwrap().unwrap().status,
            BlockStatus::Pending
        );
        store
            .append_event(&block.id, BlockEvent::new(EventType::Answer, "hello"))
            .unwrap();
        assert_eq!(
            store.get_block(&block.id).unwrap().unwrap().status,
            BlockStatus::Streaming
        );
    }

    #[test]
    fn events_read_back_in_timestamp_order() {
        let store = store();
        let conv = conversation(&store);
        let block = store
            .create_block(conv.id, BlockType::Message, BlockMode::Normal, vec![])
            .unwrap();

        let mut late = BlockEvent::new(EventType::ToolResult, "result");
        late.timestamp_ms += 100;
        let early = BlockEvent::new(EventType::ToolUse, "call");
        // Persist out of order; readers sort by timestamp.
        store.append_events_batch(&block.id, &[late.clone(), early.clone()]).unwrap();

        let read = store.get_block(&block.id).unwrap().unwrap();
        let ordered = read.events_in_order();
        assert_eq!(ordered[0].event_type, EventType::ToolUse);
        assert_eq!(ordered[1].event_type, EventType::ToolResult);
    }

    #[test]
    fn mark_error_records_event_and_flag() {
        let store = store();
        let conv = conversation(&store);
        let block = store
            .create_block(conv.id, BlockType::Message, BlockMode::Normal, vec![])
            .unwrap();
        store
            .mark_error(
                &block.id,
                BlockEvent::new(EventType::Error, "cancelled"),
                SessionStats::default(),
            )
            .unwrap();
        let read = store.get_block(&block.id).unwrap().unwrap();
        assert_eq!(read.status, BlockStatus::Error);
        assert!(read.session_stats.had_error);
        assert_eq!(read.event_stream.len(), 1);
    }

    #[test]
    fn fork_extends_branch_path() {
        let store = store();
        let conv = conversation(&store);
        let parent = store
            .create_block(conv.id, BlockType::Message, BlockMode::Normal, vec![])
            .unwrap();
        let child = store
            .fork_block(&parent.id, "retry", Some(vec![UserInput::new("again")]))
            .unwrap();
        assert_eq!(child.parent_block_id.as_ref(), Some(&parent.id));
        assert!(child.branch_path.starts_with(&parent.branch_path));
        assert!(child.round_number > parent.round_number);
    }

    #[test]
    fn blocks_since_separator_hides_older_history() {
        let store = store();
        let conv = conversation(&store);
        store
            .create_block(conv.id, BlockType::Message, BlockMode::Normal, vec![])
            .unwrap();
        store.create_separator(conv.id).unwrap();
        let visible_block = store
            .create_block(conv.id, BlockType::Message, BlockMode::Normal, vec![])
            .unwrap();

        let visible = store.blocks_since_separator(conv.id).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, visible_block.id);
    }

    #[test]
    fn checkpoint_bounds_summarizer_input() {
        let store = store();
        let conv = conversation(&store);
        let mut last_id = None;
        for i in 0..4 {
            let b = store
                .create_block(
                    conv.id,
                    BlockType::Message,
                    BlockMode::Normal,
                    vec![UserInput::new(format!("m{i}"))],
                )
                .unwrap();
            store
                .complete_block(&b.id, Some("reply"), SessionStats::default())
                .unwrap();
            last_id = Some(b.id);
        }
        assert_eq!(store.blocks_since_checkpoint(conv.id).unwrap().len(), 4);

        store
            .write_checkpoint(conv.id, &last_id.unwrap(), "summary so far", 12)
            .unwrap();
        assert!(store.blocks_since_checkpoint(conv.id).unwrap().is_empty());

        let b = store
            .create_block(conv.id, BlockType::Message, BlockMode::Normal, vec![])
            .unwrap();
        store
            .complete_block(&b.id, Some("new"), SessionStats::default())
            .unwrap();
        assert_eq!(store.blocks_since_checkpoint(conv.id).unwrap().len(), 1);
    }

    #[test]
    fn delete_conversation_cascades() {
        let store = store();
        let conv = conversation(&store);
        let b = store
            .create_block(conv.id, BlockType::Message, BlockMode::Normal, vec![])
            .unwrap();
        store.write_checkpoint(conv.id, &b.id, "s", 1).unwrap();
        store.delete_conversation(conv.id).unwrap();
        assert!(store.get_conversation(conv.id).unwrap().is_none());
        assert!(store.get_block(&b.id).unwrap().is_none());
        assert!(store.latest_checkpoint(conv.id).unwrap().is_none());
    }
}
