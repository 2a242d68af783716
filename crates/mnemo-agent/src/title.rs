//! Conversation title generation from the first turn.

use std::sync::Arc;

use tracing::warn;

use mnemo_blocks::BlockStore;
use mnemo_core::types::ConversationId;
use mnemo_provider::{ChatRequest, LlmProvider, Message, ModelConfig};

const TITLE_MODEL: &str = "claude-haiku-4-5";
const TITLE_MAX_CHARS: usize = 60;

/// Fire-and-forget: give an untitled conversation a short LLM-generated
/// title based on its first message. Failures are logged and dropped.
pub fn spawn_title_generation(
    store: Arc<BlockStore>,
    provider: Arc<dyn LlmProvider>,
    conversation_id: ConversationId,
    first_message: String,
) {
    tokio::spawn(async move {
        match store.get_conversation(conversation_id) {
            Ok(Some(conv)) if conv.title.is_none() && !conv.temporary => {}
            _ => return,
        }

        let request = ChatRequest::new(
            &ModelConfig {
                model: TITLE_MODEL.to_string(),
                max_tokens: 32,
                temperature: None,
            },
            "Produce a short title (max 6 words) for a conversation that starts \
             with the message below. Answer with the title only, no quotes."
                .to_string(),
            vec![Message::user(first_message)],
        );

        let title = match provider.send(&request).await {
            Ok(response) => {
                let t = response.content.trim().trim_matches('"').to_string();
                if t.is_empty() {
                    return;
                }
                truncate(&t, TITLE_MAX_CHARS)
            }
            Err(e) => {
                warn!(conversation = %conversation_id, err = %e, "title generation failed");
                return;
            }
        };

        if let Err(e) = store.set_title(conversation_id, &title) {
            warn!(conversation = %conversation_id, err = %e, "title write failed");
        }
    });
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}
