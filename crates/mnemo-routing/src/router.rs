//! The two-layer router: an LRU+TTL decision cache over keyword-weight
//! rule scoring, with sticky-route short-circuiting for follow-up turns.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use mnemo_core::cache::TtlCache;
use mnemo_core::types::{ConversationId, Intent, TaskComplexity, UserId};
use mnemo_provider::ModelConfig;

use crate::capability::CapabilityMap;
use crate::error::Result;
use crate::sticky::{is_related_to_last_intent, is_short_confirmation, StickyManager};

/// The router's verdict for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub expert: String,
    pub intent: Intent,
    pub complexity: TaskComplexity,
    /// In [0, 1].
    pub confidence: f64,
    pub model_config: ModelConfig,
    /// True when the rule layer could not pick a clear winner and the
    /// orchestrator should decompose instead.
    pub needs_orchestration: bool,
    pub rationale: String,
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
    /// Normalized-confidence gap below which the turn is ambiguous.
    pub ambiguity_threshold: f64,
    /// Minimum raw score for a rule-layer decision.
    pub min_score: f64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(900),
            cache_max_entries: 500,
            ambiguity_threshold: 0.1,
            min_score: 1.0,
        }
    }
}

enum KeywordMatcher {
    /// ASCII keywords match on word boundaries to avoid substring false
    /// positives ("note" vs "noted" is fine, "not" vs "note" is not).
    WordBoundary(Regex),
    /// CJK keywords match by substring — there are no word boundaries.
    Substring(String),
}

impl KeywordMatcher {
    fn compile(keyword: &str) -> Self {
        if keyword.is_ascii() {
            let pattern = format!(r"(?i)\b{}\b", regex::escape(keyword));
            // The pattern is built from an escaped literal; compilation
            // cannot fail for valid config.
            match Regex::new(&pattern) {
                Ok(re) => KeywordMatcher::WordBoundary(re),
                Err(_) => KeywordMatcher::Substring(keyword.to_lowercase()),
            }
        } else {
            KeywordMatcher::Substring(keyword.to_lowercase())
        }
    }

    fn matches(&self, normalized: &str) -> bool {
        match self {
            KeywordMatcher::WordBoundary(re) => re.is_match(normalized),
            KeywordMatcher::Substring(s) => normalized.contains(s.as_str()),
        }
    }
}

struct CompiledExpert {
    name: String,
    keywords: Vec<KeywordMatcher>,
    mutex_groups: Vec<String>,
    base_score: f64,
    keyword_bonus: f64,
    timeword_bonus: f64,
    fast_path_words: Option<Vec<String>>,
}

const TIME_WORDS: &[&str] = &[
    "today", "tomorrow", "yesterday", "tonight", "morning", "afternoon", "evening",
    "monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday",
    "next week", "this week",
    "今天", "明天", "昨天", "早上", "上午", "下午", "晚上", "本周", "下周",
    "周一", "周二", "周三", "周四", "周五", "周六", "周日",
];

const QUERY_WORDS: &[&str] = &[
    "what", "when", "where", "which", "who", "show", "find", "search", "list", "any",
    "什么", "何时", "哪里", "哪个", "查", "找", "搜索", "看看",
];

const CREATE_WORDS: &[&str] = &[
    "add", "create", "remind", "remember", "save", "set up", "book", "write down",
    "记住", "添加", "创建", "提醒", "保存", "预定",
];

/// Two ordered layers; either may produce a decision. The router itself
/// never calls an LLM.
pub struct Router {
    map: Arc<CapabilityMap>,
    sticky: Arc<StickyManager>,
    cache: TtlCache<String, RoutingDecision>,
    compiled: Vec<CompiledExpert>,
    time_patterns: Vec<Regex>,
    settings: RouterSettings,
}

impl Router {
    pub fn new(
        map: Arc<CapabilityMap>,
        sticky: Arc<StickyManager>,
        settings: RouterSettings,
    ) -> Self {
        let compiled = map
            .experts()
            .map(|e| CompiledExpert {
                name: e.name.clone(),
                keywords: e
                    .routing
                    .keywords
                    .iter()
                    .map(|k| KeywordMatcher::compile(k))
                    .collect(),
                mutex_groups: e.routing.mutex_groups.clone(),
                base_score: e.routing.weight_config.base_score,
                keyword_bonus: e.routing.weight_config.keyword_bonus,
                timeword_bonus: e.routing.weight_config.timeword_bonus,
                fast_path_words: e
                    .routing
                    .fast_path
                    .as_ref()
                    .map(|f| f.query_words.iter().map(|w| w.to_lowercase()).collect()),
            })
            .collect();

        let time_patterns = [
            r"\d{4}-\d{2}-\d{2}",
            r"\b\d{1,2}:\d{2}\b",
            r"\b\d{1,2}\s?(am|pm)\b",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();

        Self {
            cache: TtlCache::new(settings.cache_max_entries, settings.cache_ttl),
            map,
            sticky,
            compiled,
            time_patterns,
            settings,
        }
    }

    /// Route one turn. Order: sticky short-circuit, decision cache, rule
    /// scoring. Sticky decisions are conversation-bound and never cached.
    pub fn route(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        message: &str,
    ) -> Result<RoutingDecision> {
        let normalized = normalize(message);

        if let Some(decision) = self.sticky_decision(conversation_id, &normalized)? {
            debug!(expert = %decision.expert, "sticky route applied");
            return Ok(decision);
        }

        // Layer 0: fingerprint cache.
        let key = fingerprint(user_id, &normalized);
        if let Some(decision) = self.cache.get(&key) {
            debug!(expert = %decision.expert, "routing cache hit");
            return Ok(decision);
        }

        // Layer 1: keyword-weight scoring.
        let decision = self.score(&normalized);
        self.cache.insert(key, decision.clone());
        Ok(decision)
    }

    fn sticky_decision(
        &self,
        conversation_id: ConversationId,
        normalized: &str,
    ) -> Result<Option<RoutingDecision>> {
        let Some(meta) = self.sticky.get_valid(conversation_id)? else {
            return Ok(None);
        };
        let Some(expert) = self.map.get_expert(&meta.last_expert) else {
            return Ok(None);
        };

        let applies = is_short_confirmation(normalized)
            || is_related_to_last_intent(normalized, &expert.routing.keywords);
        if !applies {
            return Ok(None);
        }

        Ok(Some(RoutingDecision {
            expert: expert.name.clone(),
            intent: meta.last_intent,
            complexity: TaskComplexity::Simple,
            confidence: 0.9,
            model_config: expert.model_config.clone(),
            needs_orchestration: false,
            rationale: format!("sticky: follow-up to {}", meta.last_expert),
        }))
    }

    fn score(&self, normalized: &str) -> RoutingDecision {
        let time_hits = self.count_time_tokens(normalized);
        let intent = classify_intent(normalized, time_hits > 0);

        let mut scores: Vec<(usize, f64, usize)> = self
            .compiled
            .iter()
            .enumerate()
            .map(|(i, expert)| {
                let keyword_hits = expert
                    .keywords
                    .iter()
                    .filter(|m| m.matches(normalized))
                    .count();
                let score = expert.base_score
                    + expert.keyword_bonus * keyword_hits as f64
                    + expert.timeword_bonus * time_hits as f64;
                (i, score, keyword_hits)
            })
            .collect();

        self.apply_mutex_groups(&mut scores);

        // Fast path: time pattern + query word, and no competitor keyword.
        if time_hits > 0 {
            for (i, _, keyword_hits) in &scores {
                let expert = &self.compiled[*i];
                let Some(words) = &expert.fast_path_words else {
                    continue;
                };
                let query_word_hit = words.iter().any(|w| normalized.contains(w.as_str()));
                let competitor_keyword = scores
                    .iter()
                    .any(|(j, _, hits)| j != i && *hits > 0);
                if query_word_hit && !competitor_keyword && *keyword_hits == 0 {
                    return RoutingDecision {
                        expert: expert.name.clone(),
                        intent: Intent::Query,
                        complexity: TaskComplexity::Simple,
                        confidence: 0.85,
                        model_config: self.model_config_for(&expert.name),
                        needs_orchestration: false,
                        rationale: "fast path: time pattern + query word".to_string(),
                    };
                }
            }
        }

        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(self.compiled[a.0].name.cmp(&self.compiled[b.0].name))
        });

        let Some(&(top_idx, top_score, _)) = scores.first() else {
            return RoutingDecision {
                expert: String::new(),
                intent,
                complexity: TaskComplexity::Complex,
                confidence: 0.0,
                model_config: ModelConfig::default(),
                needs_orchestration: true,
                rationale: "no experts registered".to_string(),
            };
        };
        let second_score = scores.get(1).map(|s| s.1).unwrap_or(0.0);

        let top_conf = confidence(top_score);
        let second_conf = confidence(second_score);
        let ambiguous = top_score < self.settings.min_score
            || (top_conf - second_conf) < self.settings.ambiguity_threshold;

        let expert = &self.compiled[top_idx];
        RoutingDecision {
            expert: expert.name.clone(),
            intent,
            complexity: if ambiguous {
                TaskComplexity::Complex
            } else {
                TaskComplexity::Simple
            },
            confidence: top_conf,
            model_config: self.model_config_for(&expert.name),
            needs_orchestration: ambiguous,
            rationale: format!(
                "rule layer: top={} score={:.1}, second score={:.1}, time tokens={}",
                expert.name, top_score, second_score, time_hits
            ),
        }
    }

    /// Within each mutex group only the highest scorer keeps its score;
    /// ties go to the lexicographically first expert name.
    fn apply_mutex_groups(&self, scores: &mut [(usize, f64, usize)]) {
        let mut groups: std::collections::HashMap<&str, Vec<usize>> =
            std::collections::HashMap::new();
        for (pos, (idx, score, _)) in scores.iter().enumerate() {
            if *score <= 0.0 {
                continue;
            }
            for group in &self.compiled[*idx].mutex_groups {
                groups.entry(group.as_str()).or_default().push(pos);
            }
        }

        for members in groups.values() {
            if members.len() < 2 {
                continue;
            }
            let Some(&winner) = members.iter().min_by(|&&a, &&b| {
                scores[b]
                    .1
                    .partial_cmp(&scores[a].1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(self.compiled[scores[a].0].name.cmp(&self.compiled[scores[b].0].name))
            }) else {
                continue;
            };
            for &pos in members {
                if pos != winner {
                    scores[pos].1 = 0.0;
                }
            }
        }
    }

    fn count_time_tokens(&self, normalized: &str) -> usize {
        let word_hits = TIME_WORDS
            .iter()
            .filter(|w| {
                if w.is_ascii() {
                    normalized
                        .split(|c: char| !c.is_alphanumeric())
                        .any(|tok| tok == **w)
                        || (w.contains(' ') && normalized.contains(*w))
                } else {
                    normalized.contains(*w)
                }
            })
            .count();
        let pattern_hits = self
            .time_patterns
            .iter()
            .filter(|re| re.is_match(normalized))
            .count();
        word_hits + pattern_hits
    }

    fn model_config_for(&self, name: &str) -> ModelConfig {
        self.map
            .get_expert(name)
            .map(|e| e.model_config.clone())
            .unwrap_or_default()
    }
}

/// Raw rule score normalized into [0, 1).
fn confidence(score: f64) -> f64 {
    if score <= 0.0 {
        0.0
    } else {
        score / (score + 5.0)
    }
}

fn normalize(message: &str) -> String {
    message
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn fingerprint(user_id: UserId, normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_i64().to_le_bytes());
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn classify_intent(normalized: &str, has_time: bool) -> Intent {
    let contains_any = |words: &[&str]| {
        words.iter().any(|w| {
            if w.is_ascii() && !w.contains(' ') {
                normalized
                    .split(|c: char| !c.is_alphanumeric())
                    .any(|tok| tok == *w)
            } else {
                normalized.contains(w)
            }
        })
    };

    if contains_any(CREATE_WORDS) {
        Intent::Create
    } else if contains_any(QUERY_WORDS) || has_time {
        Intent::Query
    } else {
        Intent::Chat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ExpertConfig, ExpertStrategy, FastPath, RoutingRules, WeightConfig};
    use rusqlite::Connection;

    fn expert(name: &str, keywords: &[&str], fast_path: Option<FastPath>) -> ExpertConfig {
        expert_in_group(name, keywords, fast_path, &[])
    }

    fn expert_in_group(
        name: &str,
        keywords: &[&str],
        fast_path: Option<FastPath>,
        mutex_groups: &[&str],
    ) -> ExpertConfig {
        ExpertConfig {
            name: name.to_string(),
            display_name: name.to_string(),
            description: format!("{name} expert"),
            capabilities: vec![format!("{name} search")],
            strategy: ExpertStrategy::TwoPhase,
            system_prompt: String::new(),
            tools: Vec::new(),
            routing: RoutingRules {
                keywords: keywords.iter().map(|s| s.to_string()).collect(),
                weight_config: WeightConfig::default(),
                mutex_groups: mutex_groups.iter().map(|s| s.to_string()).collect(),
                fast_path,
            },
            model_config: ModelConfig::default(),
        }
    }

    fn router() -> Router {
        let map = Arc::new(
            CapabilityMap::from_configs(vec![
                expert("memo", &["memo", "notes", "note"], None),
                expert(
                    "schedule",
                    &["schedule", "meeting", "event"],
                    Some(FastPath {
                        query_words: vec!["anything".to_string(), "what".to_string()],
                    }),
                ),
            ])
            .unwrap(),
        );
        let sticky = Arc::new(
            StickyManager::new(
                Connection::open_in_memory().unwrap(),
                Duration::from_secs(300),
            )
            .unwrap(),
        );
        Router::new(map, sticky, RouterSettings::default())
    }

    #[test]
    fn keyword_match_routes_to_memo_expert() {
        let r = router();
        let d = r
            .route(UserId(42), ConversationId(1), "find my notes about Redis caching")
            .unwrap();
        assert_eq!(d.expert, "memo");
        assert!(!d.needs_orchestration);
        assert!(d.confidence > 0.0);
    }

    #[test]
    fn word_boundaries_prevent_substring_false_positives() {
        let r = router();
        // "noteworthy" must not match the "note" keyword.
        let d = r
            .route(UserId(42), ConversationId(1), "nothing noteworthy happened")
            .unwrap();
        assert!(d.needs_orchestration || d.expert != "memo" || d.confidence < 0.3);
    }

    #[test]
    fn time_pattern_fast_path_picks_schedule() {
        let r = router();
        let d = r
            .route(
                UserId(42),
                ConversationId(1),
                "anything on 2026-02-17 afternoon?",
            )
            .unwrap();
        assert_eq!(d.expert, "schedule");
        assert!((d.confidence - 0.85).abs() < 1e-9);
        assert!(!d.needs_orchestration);
        assert_eq!(d.intent, Intent::Query);
    }

    #[test]
    fn fast_path_blocked_by_competitor_keyword() {
        let r = router();
        // "notes" competes, so the fast path must not fire.
        let d = r
            .route(UserId(42), ConversationId(1), "what notes did I take today?")
            .unwrap();
        assert_eq!(d.expert, "memo");
    }

    #[test]
    fn ambiguous_input_flags_orchestration() {
        let r = router();
        let d = r
            .route(
                UserId(42),
                ConversationId(1),
                "show today's schedule and related notes",
            )
            .unwrap();
        assert!(d.needs_orchestration);
        assert_eq!(d.complexity, TaskComplexity::Complex);
    }

    #[test]
    fn no_signal_input_flags_orchestration() {
        let r = router();
        let d = r.route(UserId(42), ConversationId(1), "hmm").unwrap();
        assert!(d.needs_orchestration);
    }

    #[test]
    fn cache_hit_returns_identical_decision() {
        let r = router();
        let first = r
            .route(UserId(42), ConversationId(1), "find my notes about Redis")
            .unwrap();
        let second = r
            .route(UserId(42), ConversationId(2), "Find  my NOTES about redis")
            .unwrap();
        assert_eq!(first.expert, second.expert);
        assert_eq!(first.intent, second.intent);
        assert!((first.confidence - second.confidence).abs() < 1e-12);
    }

    #[test]
    fn sticky_route_wins_for_confirmation() {
        let map = Arc::new(
            CapabilityMap::from_configs(vec![
                expert("memo", &["memo", "notes"], None),
                expert("schedule", &["schedule"], None),
            ])
            .unwrap(),
        );
        let sticky = Arc::new(
            StickyManager::new(
                Connection::open_in_memory().unwrap(),
                Duration::from_secs(300),
            )
            .unwrap(),
        );
        sticky
            .record(ConversationId(5), Intent::Create, "schedule", None, None)
            .unwrap();
        let r = Router::new(map, sticky, RouterSettings::default());

        let d = r.route(UserId(1), ConversationId(5), "ok").unwrap();
        assert_eq!(d.expert, "schedule");
        assert_eq!(d.intent, Intent::Create);
        assert!(!d.needs_orchestration);

        // A different conversation has no sticky state.
        let d2 = r.route(UserId(1), ConversationId(6), "ok").unwrap();
        assert_ne!(d2.rationale, d.rationale);
    }

    #[test]
    fn mutex_group_keeps_only_the_higher_scorer() {
        // "casual" outscores "formal" inside the shared group, so formal's
        // score is zeroed and casual wins cleanly instead of ambiguously.
        let map = Arc::new(
            CapabilityMap::from_configs(vec![
                expert_in_group("casual", &["chat", "joke", "fun"], None, &["tone"]),
                expert_in_group("formal", &["chat"], None, &["tone"]),
            ])
            .unwrap(),
        );
        let sticky = Arc::new(
            StickyManager::new(
                Connection::open_in_memory().unwrap(),
                Duration::from_secs(300),
            )
            .unwrap(),
        );
        let r = Router::new(map, sticky, RouterSettings::default());
        let d = r
            .route(UserId(1), ConversationId(1), "chat with me, tell a joke for fun")
            .unwrap();
        assert_eq!(d.expert, "casual");
        assert!(!d.needs_orchestration);
    }

    #[test]
    fn intent_classification_covers_the_three_tags() {
        assert_eq!(classify_intent("find my notes", false), Intent::Query);
        assert_eq!(classify_intent("remind me to stretch", false), Intent::Create);
        assert_eq!(classify_intent("nice weather", false), Intent::Chat);
        assert_eq!(classify_intent("free slots", true), Intent::Query);
    }
}
