//! Result-quality heuristic and the rerank gate.

use crate::types::RetrievalItem;

/// Coarse quality of a semantic result set, judged from its score shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    High,
    /// Permits one expansion of the semantic search to a larger top-K.
    Medium,
    Low,
}

/// Judge a score-sorted semantic result list.
///
/// High: clear winner (top − second > 0.20) or near-certain top (> 0.90).
/// Medium: decent top score (> 0.70). Low: everything else.
pub fn assess(items: &[RetrievalItem]) -> Quality {
    let top = items.first().map(|i| i.score).unwrap_or(0.0);
    let second = items.get(1).map(|i| i.score).unwrap_or(0.0);

    if (top - second) > 0.20 || top > 0.90 {
        Quality::High
    } else if top > 0.70 {
        Quality::Medium
    } else {
        Quality::Low
    }
}

/// Words that mark a query as complex enough to benefit from reranking,
/// in either English or Chinese.
const COMPLEX_WORDS: &[&str] = &[
    "what", "when", "where", "which", "who", "why", "how", "and", "or", "but",
    "什么", "何时", "哪里", "哪个", "谁", "为什么", "怎么", "以及", "或者", "但是",
];

/// Decide whether the reranker pass is worth running.
///
/// Skipped when the service is disabled, the candidate set is small, the
/// query is short and simple, or the top result already stands clear of the
/// rest (top − second > 0.15).
pub fn should_rerank(query: &str, items: &[RetrievalItem], reranker_enabled: bool) -> bool {
    if !reranker_enabled {
        return false;
    }
    if items.len() < 5 {
        return false;
    }

    let runes = query.chars().count();
    let lowered = query.to_lowercase();
    let has_complex_word = COMPLEX_WORDS.iter().any(|w| lowered.contains(w));
    if runes < 10 && !has_complex_word {
        return false;
    }

    let top = items.first().map(|i| i.score).unwrap_or(0.0);
    let second = items.get(1).map(|i| i.score).unwrap_or(0.0);
    if (top - second) > 0.15 {
        return false;
    }

    true
}
