//! Conversation summarization — checkpoint writing for history truncation.
//!
//! Triggered fire-and-forget after a block completes. Runs detached from
//! the originating request with its own timeout; any failure is logged and
//! silently dropped — the next completion retries.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use mnemo_blocks::BlockStore;
use mnemo_core::config::SummarizerConfig;
use mnemo_core::types::ConversationId;
use mnemo_provider::{ChatRequest, LlmProvider, Message, ModelConfig};

/// Model used for summaries — cheap and fast.
const SUMMARY_MODEL: &str = "claude-haiku-4-5";
const SUMMARY_MAX_TOKENS: u32 = 512;
const SUMMARY_TIMEOUT: Duration = Duration::from_secs(30);

/// Spawn the summarizer if the conversation crossed a threshold.
///
/// Detached from the caller's cancellation scope: client disconnects must
/// not kill an in-flight checkpoint write.
pub fn maybe_summarize(
    store: Arc<BlockStore>,
    provider: Arc<dyn LlmProvider>,
    config: SummarizerConfig,
    conversation_id: ConversationId,
) {
    tokio::spawn(async move {
        let result = tokio::time::timeout(
            SUMMARY_TIMEOUT,
            summarize_if_needed(store, provider, config, conversation_id),
        )
        .await;
        match result {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {}
            Ok(Err(e)) => {
                warn!(conversation = %conversation_id, err = %e, "summarizer failed")
            }
            Err(_) => warn!(conversation = %conversation_id, "summarizer timed out"),
        }
    });
}

/// Returns Ok(true) when a checkpoint was written.
async fn summarize_if_needed(
    store: Arc<BlockStore>,
    provider: Arc<dyn LlmProvider>,
    config: SummarizerConfig,
    conversation_id: ConversationId,
) -> Result<bool, String> {
    let blocks = store
        .blocks_since_checkpoint(conversation_id)
        .map_err(|e| e.to_string())?;

    let total_chars: usize = blocks
        .iter()
        .map(|b| {
            b.user_text().len() + b.assistant_content.as_deref().map(str::len).unwrap_or(0)
        })
        .sum();
    let over_messages = blocks.len() >= config.message_threshold;
    // The char count stands in for tokens at roughly 1:1 against the very
    // large global ceiling.
    let over_tokens = total_chars as u64 >= config.token_threshold;
    if !over_messages && !over_tokens {
        return Ok(false);
    }

    let Some(last) = blocks.last() else {
        return Ok(false);
    };
    let last_id = last.id.clone();

    let transcript: String = blocks
        .iter()
        .flat_map(|b| {
            let mut turns = Vec::new();
            let user = b.user_text();
            if !user.is_empty() {
                turns.push(format!("USER: {user}"));
            }
            if let Some(assistant) = &b.assistant_content {
                turns.push(format!("ASSISTANT: {assistant}"));
            }
            turns
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let request = ChatRequest::new(
        &ModelConfig {
            model: SUMMARY_MODEL.to_string(),
            max_tokens: SUMMARY_MAX_TOKENS,
            temperature: None,
        },
        concat!(
            "You summarize conversations for context compression. ",
            "Write a dense summary of the conversation below: decisions made, ",
            "facts established, open follow-ups. No preamble, no bullet fluff. ",
            "Keep it under 200 words."
        )
        .to_string(),
        vec![Message::user(format!("Summarize:\n\n{transcript}"))],
    );

    let response = provider.send(&request).await.map_err(|e| e.to_string())?;
    if response.content.trim().is_empty() {
        return Err("empty summary".to_string());
    }

    store
        .write_checkpoint(
            conversation_id,
            &last_id,
            response.content.trim(),
            response.usage.total(),
        )
        .map_err(|e| e.to_string())?;

    info!(
        conversation = %conversation_id,
        blocks = blocks.len(),
        "checkpoint written"
    );
    Ok(true)
}
