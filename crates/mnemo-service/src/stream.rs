//! The stream adapter: converts internal block events into outbound frames
//! while batching persistence and collecting the final answer text.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use mnemo_blocks::{BlockEvent, BlockStore, EventType, SessionStats};
use mnemo_core::types::BlockId;

/// Events buffered before one batched append. Streaming answers produce
/// many small deltas; batching cuts the write count by an order of
/// magnitude.
const PERSIST_BATCH_SIZE: usize = 8;

/// One outbound frame of the chat stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamFrame {
    pub event_type: String,
    pub event_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_meta: Option<serde_json::Value>,
    #[serde(default)]
    pub done: bool,
    /// Present only on the final frame: block id plus finalized stats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_summary: Option<serde_json::Value>,
}

impl StreamFrame {
    fn from_event(event: &BlockEvent) -> Self {
        Self {
            event_type: event.event_type.as_str().to_string(),
            event_data: event.content.clone(),
            event_meta: event.meta.clone(),
            done: false,
            block_summary: None,
        }
    }
}

/// Sits between the executor's event channel and the outbound frame
/// channel. The adapter is the only frame emitter, which keeps frames
/// strictly ordered per conversation.
pub struct StreamAdapter {
    out: mpsc::UnboundedSender<StreamFrame>,
    store: Arc<BlockStore>,
    block_id: BlockId,
    pending: Vec<BlockEvent>,
    answer: String,
    client_gone: bool,
}

impl StreamAdapter {
    pub fn new(
        out: mpsc::UnboundedSender<StreamFrame>,
        store: Arc<BlockStore>,
        block_id: BlockId,
    ) -> Self {
        Self {
            out,
            store,
            block_id,
            pending: Vec::new(),
            answer: String::new(),
            client_gone: false,
        }
    }

    /// Forward one event as a frame and queue it for persistence.
    /// Returns false when the client is gone (the caller should cancel).
    pub fn handle(&mut self, event: BlockEvent) -> bool {
        if event.event_type == EventType::Answer {
            self.answer.push_str(&event.content);
        }

        if !self.client_gone && self.out.send(StreamFrame::from_event(&event)).is_err() {
            self.client_gone = true;
        }

        self.pending.push(event);
        if self.pending.len() >= PERSIST_BATCH_SIZE {
            self.flush();
        }

        !self.client_gone
    }

    /// Persist all buffered events in one append.
    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.pending);
        if let Err(e) = self.store.append_events_batch(&self.block_id, &events) {
            warn!(block = %self.block_id, err = %e, "event batch persist failed");
        }
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }

    pub fn client_gone(&self) -> bool {
        self.client_gone
    }

    /// Emit the final frame with the block summary and return the built
    /// answer text. Consumes the adapter; everything pending is flushed.
    pub fn finish(mut self, stats: &SessionStats) -> String {
        self.flush();
        let summary = serde_json::json!({
            "block_id": self.block_id.as_str(),
            "session_stats": stats,
        });
        let _ = self.out.send(StreamFrame {
            event_type: EventType::SessionStats.as_str().to_string(),
            event_data: String::new(),
            event_meta: None,
            done: true,
            block_summary: Some(summary),
        });
        self.answer
    }

    /// Flush buffered events without emitting further frames. Used on
    /// cancellation: the block goes to ERROR and the stream just ends.
    pub fn abort(mut self) -> String {
        self.flush();
        std::mem::take(&mut self.answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_blocks::{BlockMode, BlockType};
    use mnemo_core::types::UserId;
    use rusqlite::Connection;

    fn setup() -> (
        Arc<BlockStore>,
        BlockId,
        mpsc::UnboundedReceiver<StreamFrame>,
        StreamAdapter,
    ) {
        let store = Arc::new(BlockStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let conv = store.create_conversation(UserId(1), "assistant", false).unwrap();
        let block = store
            .create_block(conv.id, BlockType::Message, BlockMode::Normal, vec![])
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = StreamAdapter::new(tx, Arc::clone(&store), block.id.clone());
        (store, block.id, rx, adapter)
    }

    #[test]
    fn events_become_frames_and_answers_accumulate() {
        let (_store, _block, mut rx, mut adapter) = setup();
        assert!(adapter.handle(BlockEvent::new(EventType::Thinking, "hm")));
        assert!(adapter.handle(BlockEvent::new(EventType::Answer, "Hello ")));
        assert!(adapter.handle(BlockEvent::new(EventType::Answer, "world")));

        assert_eq!(rx.try_recv().unwrap().event_type, "thinking");
        assert_eq!(rx.try_recv().unwrap().event_data, "Hello ");
        assert_eq!(rx.try_recv().unwrap().event_data, "world");
        assert_eq!(adapter.answer(), "Hello world");
    }

    #[test]
    fn finish_emits_done_frame_with_summary() {
        let (store, block_id, mut rx, mut adapter) = setup();
        adapter.handle(BlockEvent::new(EventType::Answer, "hi"));
        let answer = adapter.finish(&SessionStats::default());
        assert_eq!(answer, "hi");

        let mut last = None;
        while let Ok(frame) = rx.try_recv() {
            last = Some(frame);
        }
        let last = last.unwrap();
        assert!(last.done);
        let summary = last.block_summary.unwrap();
        assert_eq!(
            summary.get("block_id").and_then(|v| v.as_str()).unwrap(),
            block_id.as_str()
        );

        // Everything was persisted on finish.
        let read = store.get_block(&block_id).unwrap().unwrap();
        assert_eq!(read.event_stream.len(), 1);
    }

    #[test]
    fn batch_persistence_reduces_writes() {
        let (store, block_id, _rx, mut adapter) = setup();
        for i in 0..PERSIST_BATCH_SIZE - 1 {
            adapter.handle(BlockEvent::new(EventType::Answer, format!("d{i}")));
        }
        // Below the batch size: nothing persisted yet.
        assert!(store.get_block(&block_id).unwrap().unwrap().event_stream.is_empty());

        adapter.handle(BlockEvent::new(EventType::Answer, "last"));
        let read = store.get_block(&block_id).unwrap().unwrap();
        assert_eq!(read.event_stream.len(), PERSIST_BATCH_SIZE);
    }

    #[test]
    fn closed_client_is_reported_but_events_still_persist() {
        let (store, block_id, rx, mut adapter) = setup();
        drop(rx);
        assert!(!adapter.handle(BlockEvent::new(EventType::Answer, "hi")));
        assert!(adapter.client_gone());
        let answer = adapter.abort();
        assert_eq!(answer, "hi");
        let read = store.get_block(&block_id).unwrap().unwrap();
        assert_eq!(read.event_stream.len(), 1);
    }
}
