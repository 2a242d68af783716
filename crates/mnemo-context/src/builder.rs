//! The context builder: transcript + checkpoint + episodic memory +
//! retrieval evidence + pending input, fitted to the model budget.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, warn};

use mnemo_blocks::{Block, BlockStatus, BlockStore, BlockType};
use mnemo_core::config::{ContextConfig, SummarizerConfig};
use mnemo_core::types::{ConversationId, Intent};
use mnemo_provider::Message;
use mnemo_retrieval::RetrievalItem;

use crate::error::{ContextError, Result};
use crate::ranker::{rank_and_fit, DEFAULT_MIN_SEGMENT_TOKENS};
use crate::segment::{ContextSegment, SegmentRole};
use crate::token::BudgetAllocator;

/// How many episodic memories to recall per request.
const EPISODIC_TOP_K: usize = 5;

/// One semantically-similar past episode.
#[derive(Debug, Clone)]
pub struct Episode {
    pub content: String,
    pub score: f64,
}

/// Optional provider of semantic episodic memory. Failures are soft: the
/// builder logs and continues without episodes.
#[async_trait]
pub trait EpisodicMemory: Send + Sync {
    async fn recall(&self, user_id: i64, query: &str, k: usize) -> Vec<Episode>;
}

/// Tokens actually consumed per section, for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionTally {
    pub system: u32,
    pub query: u32,
    pub recent_turns: u32,
    pub older_turns: u32,
    pub retrieval: u32,
    pub episodic: u32,
    pub user_prefs: u32,
}

impl SectionTally {
    pub fn total(&self) -> u32 {
        self.system
            + self.query
            + self.recent_turns
            + self.older_turns
            + self.retrieval
            + self.episodic
            + self.user_prefs
    }
}

/// The finalized prompt bundle handed to the expert executor.
#[derive(Debug, Clone)]
pub struct PromptBundle {
    pub system_prompt: String,
    /// Trimmed conversation history, chronological.
    pub history: Vec<Message>,
    /// Retrieval evidence that survived the budget.
    pub evidence: Vec<RetrievalItem>,
    /// Episodic memories that survived the budget.
    pub episodes: Vec<String>,
    pub user_prefs: Option<String>,
    pub pending_user: String,
    pub section_tokens: SectionTally,
}

impl PromptBundle {
    /// Render into a (system, messages) pair for an LLM call. Evidence and
    /// episodes are folded into the final user turn; preferences into the
    /// system prompt.
    pub fn to_chat(&self) -> (String, Vec<Message>) {
        let mut system = self.system_prompt.clone();
        if let Some(prefs) = &self.user_prefs {
            system.push_str("\n\n## User preferences\n");
            system.push_str(prefs);
        }

        let mut messages = self.history.clone();
        let mut user_turn = String::new();
        if !self.episodes.is_empty() {
            user_turn.push_str("Relevant past conversations:\n");
            for ep in &self.episodes {
                user_turn.push_str(&format!("- {ep}\n"));
            }
            user_turn.push('\n');
        }
        if !self.evidence.is_empty() {
            user_turn.push_str("Retrieved evidence:\n");
            for item in &self.evidence {
                user_turn.push_str(&format!("- [{}] {}\n", item.kind, item.content));
            }
            user_turn.push('\n');
        }
        user_turn.push_str(&self.pending_user);
        messages.push(Message::user(user_turn));
        (system, messages)
    }
}

/// Everything a build call needs besides the stores.
#[derive(Debug, Clone)]
pub struct BuildInput<'a> {
    pub conversation_id: ConversationId,
    pub user_id: i64,
    pub system_prompt: &'a str,
    pub pending_message: &'a str,
    pub user_prefs: Option<&'a str>,
    pub retrieval: &'a [RetrievalItem],
    pub intent: Intent,
}

pub struct ContextBuilder {
    allocator: BudgetAllocator,
    max_tokens: u32,
    hot_zone_rounds: i64,
    large_message_threshold: usize,
}

struct RenderedTurn {
    user: String,
    assistant: Option<String>,
}

impl ContextBuilder {
    pub fn new(context: &ContextConfig, summarizer: &SummarizerConfig) -> Self {
        Self {
            allocator: BudgetAllocator::from_config(context),
            max_tokens: context.max_tokens,
            hot_zone_rounds: summarizer.hot_zone_rounds,
            large_message_threshold: summarizer.large_message_threshold,
        }
    }

    /// Assemble a PromptBundle for the pending turn.
    pub async fn build(
        &self,
        store: &BlockStore,
        episodic: Option<&dyn EpisodicMemory>,
        input: BuildInput<'_>,
    ) -> Result<PromptBundle> {
        // 1. Visible transcript: everything after the last separator.
        let mut blocks = store.blocks_since_separator(input.conversation_id)?;

        // 2. Fold in the summary checkpoint, discarding covered blocks.
        let mut summary_turn: Option<String> = None;
        if let Some(checkpoint) = store.latest_checkpoint(input.conversation_id)? {
            if let Some(last_round) = blocks
                .iter()
                .find(|b| b.id == checkpoint.last_block_id)
                .map(|b| b.round_number)
            {
                blocks.retain(|b| b.round_number > last_round);
            }
            summary_turn = Some(format!(
                "Summary of the earlier conversation: {}",
                checkpoint.summary
            ));
        }

        // 3/4. Render turns, substituting cool-zone summaries. Only
        // finished turns count as history: ERROR blocks are dropped and
        // in-flight blocks (including the one being processed right now)
        // are represented by the pending message instead.
        let max_round = blocks.iter().map(|b| b.round_number).max().unwrap_or(0);
        let hot_floor = max_round - self.hot_zone_rounds;
        let mut turns: HashMap<i64, RenderedTurn> = HashMap::new();
        for block in &blocks {
            if block.block_type != BlockType::Message || block.status != BlockStatus::Completed {
                continue;
            }
            let assistant = self.render_assistant(block, hot_floor);
            let user = block.user_text();
            if user.is_empty() && assistant.is_none() {
                continue;
            }
            turns.insert(block.round_number, RenderedTurn { user, assistant });
        }

        // 5. Episodic memory, when the provider is up.
        let episodes: Vec<Episode> = match episodic {
            Some(provider) => {
                provider
                    .recall(input.user_id, input.pending_message, EPISODIC_TOP_K)
                    .await
            }
            None => Vec::new(),
        };

        // 6. Segments with the fixed priority ladder.
        let mut segments = Vec::new();
        segments.push(ContextSegment::new(
            SegmentRole::SystemPrompt,
            input.system_prompt,
        ));
        segments.push(ContextSegment::new(
            SegmentRole::CurrentUserQuery,
            input.pending_message,
        ));

        let mut rounds: Vec<i64> = turns.keys().copied().collect();
        // Newest first within the role so the oldest are trimmed first.
        rounds.sort_unstable_by(|a, b| b.cmp(a));
        for round in &rounds {
            let turn = &turns[round];
            let role = if *round > hot_floor {
                SegmentRole::RecentTurns
            } else {
                SegmentRole::OlderTurns
            };
            segments
                .push(ContextSegment::new(role, render_turn(turn)).with_seq(*round));
        }
        if let Some(summary) = &summary_turn {
            // The summary joins the older-turns pool but outlives every
            // individual old turn (seq below any real round).
            segments.push(
                ContextSegment::new(SegmentRole::OlderTurns, summary.clone()).with_seq(-1),
            );
        }

        for (i, item) in input.retrieval.iter().enumerate() {
            segments.push(
                ContextSegment::new(SegmentRole::RetrievalEvidence, item.content.clone())
                    .with_seq(i as i64),
            );
        }
        for (i, ep) in episodes.iter().enumerate() {
            segments.push(
                ContextSegment::new(SegmentRole::EpisodicMemory, ep.content.clone())
                    .with_seq(i as i64),
            );
        }
        if let Some(prefs) = input.user_prefs {
            segments.push(ContextSegment::new(SegmentRole::UserPreferences, prefs));
        }

        // 7. Section budgets, then the global fit.
        let budgets = self
            .allocator
            .allocate(self.max_tokens, !input.retrieval.is_empty());
        apply_section_cap(&mut segments, &[SegmentRole::RecentTurns], budgets.short_term);
        apply_section_cap(
            &mut segments,
            &[SegmentRole::EpisodicMemory, SegmentRole::OlderTurns],
            budgets.long_term,
        );
        apply_section_cap(
            &mut segments,
            &[SegmentRole::RetrievalEvidence],
            budgets.retrieval,
        );
        apply_section_cap(
            &mut segments,
            &[SegmentRole::UserPreferences],
            budgets.user_prefs,
        );

        let included = rank_and_fit(segments, self.max_tokens, DEFAULT_MIN_SEGMENT_TOKENS)?;

        // 8. Reassemble the bundle and tally actual usage.
        let mut tally = SectionTally::default();
        let mut included_turns: Vec<(i64, String)> = Vec::new();
        let mut evidence = Vec::new();
        let mut included_episodes = Vec::new();
        let mut user_prefs = None;

        for segment in &included {
            match segment.role {
                SegmentRole::SystemPrompt => tally.system += segment.token_cost,
                SegmentRole::CurrentUserQuery => tally.query += segment.token_cost,
                SegmentRole::RecentTurns => {
                    tally.recent_turns += segment.token_cost;
                    included_turns.push((segment.seq, segment.content.clone()));
                }
                SegmentRole::OlderTurns => {
                    tally.older_turns += segment.token_cost;
                    included_turns.push((segment.seq, segment.content.clone()));
                }
                SegmentRole::RetrievalEvidence => {
                    tally.retrieval += segment.token_cost;
                    if let Some(item) = input.retrieval.get(segment.seq as usize) {
                        let mut item = item.clone();
                        // The fitted content may be a truncated prefix.
                        item.content = segment.content.clone();
                        evidence.push(item);
                    }
                }
                SegmentRole::EpisodicMemory => {
                    tally.episodic += segment.token_cost;
                    included_episodes.push(segment.content.clone());
                }
                SegmentRole::UserPreferences => {
                    tally.user_prefs += segment.token_cost;
                    user_prefs = Some(segment.content.clone());
                }
            }
        }

        // Chronological history: summary synthetic turn first (seq -1).
        included_turns.sort_by_key(|(seq, _)| *seq);
        let mut history = Vec::new();
        for (seq, content) in included_turns {
            if seq == -1 {
                history.push(Message::assistant(content));
                continue;
            }
            match turns.get(&seq) {
                Some(turn) if render_turn(turn) == content => {
                    if !turn.user.is_empty() {
                        history.push(Message::user(turn.user.clone()));
                    }
                    if let Some(assistant) = &turn.assistant {
                        history.push(Message::assistant(assistant.clone()));
                    }
                }
                // Truncated turn: keep what survived as a single user message.
                _ => history.push(Message::user(content)),
            }
        }

        debug!(
            total = tally.total(),
            budget = self.max_tokens,
            turns = history.len(),
            evidence = evidence.len(),
            "context bundle assembled"
        );
        debug_assert!(tally.total() <= self.max_tokens);

        Ok(PromptBundle {
            system_prompt: input.system_prompt.to_string(),
            history,
            evidence,
            episodes: included_episodes,
            user_prefs,
            pending_user: input.pending_message.to_string(),
            section_tokens: tally,
        })
    }

    /// Cool-zone rule: large content older than the hot zone is replaced by
    /// its cached summary when one exists; otherwise kept verbatim.
    fn render_assistant(&self, block: &Block, hot_floor: i64) -> Option<String> {
        let content = block.assistant_content.clone()?;
        let flagged_large = block
            .metadata
            .get("large")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let is_large = flagged_large || content.chars().count() > self.large_message_threshold;
        if is_large && block.round_number <= hot_floor {
            if let Some(summary) = block.metadata.get("summary").and_then(|v| v.as_str()) {
                return Some(summary.to_string());
            }
            warn!(block = %block.id, "large cool-zone block has no cached summary, keeping verbatim");
        }
        Some(content)
    }
}

fn render_turn(turn: &RenderedTurn) -> String {
    match &turn.assistant {
        Some(a) if !turn.user.is_empty() => format!("{}\n{}", turn.user, a),
        Some(a) => a.clone(),
        None => turn.user.clone(),
    }
}

/// Greedily keep a role group's segments (already newest/highest first)
/// within its section budget; everything over the cap is dropped.
fn apply_section_cap(segments: &mut Vec<ContextSegment>, roles: &[SegmentRole], cap: u32) {
    let mut used = 0u32;
    segments.retain(|s| {
        if !roles.contains(&s.role) {
            return true;
        }
        if used + s.token_cost <= cap {
            used += s.token_cost;
            true
        } else {
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_blocks::{BlockMode, SessionStats, UserInput};
    use mnemo_core::types::UserId;
    use mnemo_retrieval::ItemKind;
    use rusqlite::Connection;

    fn store() -> BlockStore {
        BlockStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn builder() -> ContextBuilder {
        ContextBuilder::new(&ContextConfig::default(), &SummarizerConfig::default())
    }

    fn complete_turn(store: &BlockStore, conv: ConversationId, user: &str, assistant: &str) {
        let b = store
            .create_block(
                conv,
                BlockType::Message,
                BlockMode::Normal,
                vec![UserInput::new(user)],
            )
            .unwrap();
        store
            .complete_block(&b.id, Some(assistant), SessionStats::default())
            .unwrap();
    }

    fn input<'a>(conv: ConversationId, pending: &'a str) -> BuildInput<'a> {
        BuildInput {
            conversation_id: conv,
            user_id: 1,
            system_prompt: "You are a helpful assistant.",
            pending_message: pending,
            user_prefs: None,
            retrieval: &[],
            intent: Intent::Chat,
        }
    }

    #[tokio::test]
    async fn bundle_contains_history_and_pending() {
        let store = store();
        let conv = store.create_conversation(UserId(1), "assistant", false).unwrap();
        complete_turn(&store, conv.id, "hello", "hi there");

        let bundle = builder()
            .build(&store, None, input(conv.id, "how are you?"))
            .await
            .unwrap();

        assert_eq!(bundle.history.len(), 2);
        assert_eq!(bundle.pending_user, "how are you?");
        assert!(bundle.section_tokens.system > 0);
        assert!(bundle.section_tokens.query > 0);
        assert!(bundle.section_tokens.total() <= 4096);
    }

    #[tokio::test]
    async fn error_blocks_are_skipped() {
        let store = store();
        let conv = store.create_conversation(UserId(1), "assistant", false).unwrap();
        let b = store
            .create_block(
                conv.id,
                BlockType::Message,
                BlockMode::Normal,
                vec![UserInput::new("doomed")],
            )
            .unwrap();
        store
            .mark_error(
                &b.id,
                mnemo_blocks::BlockEvent::new(mnemo_blocks::EventType::Error, "boom"),
                SessionStats::default(),
            )
            .unwrap();
        complete_turn(&store, conv.id, "hello", "hi");

        let bundle = builder()
            .build(&store, None, input(conv.id, "next"))
            .await
            .unwrap();
        assert!(bundle.history.iter().all(|m| !m.content.contains("doomed")));
    }

    #[tokio::test]
    async fn checkpoint_replaces_covered_blocks() {
        let store = store();
        let conv = store.create_conversation(UserId(1), "assistant", false).unwrap();
        let mut last = None;
        for i in 0..3 {
            let b = store
                .create_block(
                    conv.id,
                    BlockType::Message,
                    BlockMode::Normal,
                    vec![UserInput::new(format!("old {i}"))],
                )
                .unwrap();
            store
                .complete_block(&b.id, Some("old reply"), SessionStats::default())
                .unwrap();
            last = Some(b.id);
        }
        store
            .write_checkpoint(conv.id, &last.unwrap(), "they talked about old things", 8)
            .unwrap();
        complete_turn(&store, conv.id, "new question", "new reply");

        let bundle = builder()
            .build(&store, None, input(conv.id, "follow-up"))
            .await
            .unwrap();

        // Summary synthetic turn + the one post-checkpoint turn pair.
        assert!(bundle.history[0].content.contains("old things"));
        assert!(bundle.history.iter().all(|m| !m.content.contains("old 1")));
        assert!(bundle
            .history
            .iter()
            .any(|m| m.content.contains("new question")));
    }

    #[tokio::test]
    async fn separator_resets_visible_history() {
        let store = store();
        let conv = store.create_conversation(UserId(1), "assistant", false).unwrap();
        complete_turn(&store, conv.id, "before separator", "reply");
        store.create_separator(conv.id).unwrap();
        complete_turn(&store, conv.id, "after separator", "reply");

        let bundle = builder()
            .build(&store, None, input(conv.id, "next"))
            .await
            .unwrap();
        assert!(bundle
            .history
            .iter()
            .all(|m| !m.content.contains("before separator")));
        assert!(bundle
            .history
            .iter()
            .any(|m| m.content.contains("after separator")));
    }

    struct FixedEpisodes;

    #[async_trait]
    impl EpisodicMemory for FixedEpisodes {
        async fn recall(&self, _user: i64, _query: &str, k: usize) -> Vec<Episode> {
            (0..k.min(2))
                .map(|i| Episode {
                    content: format!("episode {i}"),
                    score: 0.9,
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn episodic_memories_join_the_bundle() {
        let store = store();
        let conv = store.create_conversation(UserId(1), "assistant", false).unwrap();
        let bundle = builder()
            .build(&store, Some(&FixedEpisodes), input(conv.id, "query"))
            .await
            .unwrap();
        assert_eq!(bundle.episodes.len(), 2);
        assert!(bundle.section_tokens.episodic > 0);
    }

    #[tokio::test]
    async fn evidence_survives_and_is_rendered() {
        let store = store();
        let conv = store.create_conversation(UserId(1), "assistant", false).unwrap();
        let items = vec![RetrievalItem {
            id: 1,
            kind: ItemKind::Memo,
            content: "Redis caching notes".to_string(),
            score: 0.9,
            evidence: None,
        }];
        let mut inp = input(conv.id, "find my redis notes");
        inp.retrieval = &items;

        let bundle = builder().build(&store, None, inp).await.unwrap();
        assert_eq!(bundle.evidence.len(), 1);
        let (_system, messages) = bundle.to_chat();
        assert!(messages
            .last()
            .unwrap()
            .content
            .contains("Redis caching notes"));
    }

    #[tokio::test]
    async fn oversized_system_prompt_is_a_typed_error() {
        let store = store();
        let conv = store.create_conversation(UserId(1), "assistant", false).unwrap();
        let big = "x".repeat(20_000); // 5000 tokens > 4096 budget
        let mut inp = input(conv.id, "hi");
        inp.system_prompt = &big;

        let err = builder().build(&store, None, inp).await.unwrap_err();
        assert!(matches!(err, ContextError::ContextTooLarge { .. }));
    }

    #[tokio::test]
    async fn old_turns_are_trimmed_before_new_ones() {
        let store = store();
        let conv = store.create_conversation(UserId(1), "assistant", false).unwrap();
        // Enough long turns to overflow the short-term budget.
        for i in 0..30 {
            complete_turn(
                &store,
                conv.id,
                &format!("question {i} {}", "pad ".repeat(120)),
                &format!("answer {i} {}", "pad ".repeat(120)),
            );
        }
        let bundle = builder()
            .build(&store, None, input(conv.id, "latest"))
            .await
            .unwrap();
        // The newest turn must survive; the oldest must not.
        assert!(bundle.history.iter().any(|m| m.content.contains("question 29")));
        assert!(bundle.history.iter().all(|m| !m.content.contains("question 0 ")));
        assert!(bundle.section_tokens.total() <= 4096);
    }
}
