//! Heuristic token estimation and section budget allocation.

use mnemo_core::config::ContextConfig;
use mnemo_core::types::Intent;

/// Estimate the token cost of a text without a tokenizer.
///
/// Per code point: ASCII weighs 0.25 tokens, CJK and every other non-ASCII
/// code point weigh 2. Non-empty input never estimates to zero.
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let cost: f64 = text.chars().map(char_token_cost).sum();
    (cost.ceil() as u32).max(1)
}

/// Per-character weight. CJK ideographs and other non-ASCII script both
/// land at 2 tokens per code point under the operational billing model.
pub(crate) fn char_token_cost(c: char) -> f64 {
    if c.is_ascii() {
        0.25
    } else {
        2.0
    }
}

/// Token budgets for each prompt section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionBudgets {
    pub system: u32,
    pub user_prefs: u32,
    pub short_term: u32,
    pub long_term: u32,
    pub retrieval: u32,
}

impl SectionBudgets {
    pub fn total(&self) -> u32 {
        self.system + self.user_prefs + self.short_term + self.long_term + self.retrieval
    }
}

/// Splits a total token budget into per-section reservations.
#[derive(Debug, Clone)]
pub struct BudgetAllocator {
    system_tokens: u32,
    user_prefs_ratio: f64,
    short_term_ratio: f64,
    long_term_ratio: f64,
    retrieval_ratio: f64,
}

impl BudgetAllocator {
    pub fn from_config(config: &ContextConfig) -> Self {
        Self {
            system_tokens: config.system_prompt_tokens,
            user_prefs_ratio: config.user_prefs_ratio,
            short_term_ratio: config.short_term_ratio,
            long_term_ratio: config.long_term_ratio,
            retrieval_ratio: config.retrieval_ratio,
        }
    }

    /// Reserve system + user-prefs, then split the remainder.
    ///
    /// With retrieval present the configured ratios apply (40/15/45 by
    /// default); without it history gets more room (55/30, no retrieval).
    pub fn allocate(&self, total_max_tokens: u32, has_retrieval: bool) -> SectionBudgets {
        let system = self.system_tokens.min(total_max_tokens);
        let user_prefs = (total_max_tokens as f64 * self.user_prefs_ratio) as u32;
        let remainder = total_max_tokens.saturating_sub(system + user_prefs) as f64;

        if has_retrieval {
            SectionBudgets {
                system,
                user_prefs,
                short_term: (remainder * self.short_term_ratio) as u32,
                long_term: (remainder * self.long_term_ratio) as u32,
                retrieval: (remainder * self.retrieval_ratio) as u32,
            }
        } else {
            SectionBudgets {
                system,
                user_prefs,
                short_term: (remainder * 0.55) as u32,
                long_term: (remainder * 0.30) as u32,
                retrieval: 0,
            }
        }
    }

    /// Intent-keyed split: queries lean on retrieval, creation leans on
    /// recent history, chat barely retrieves at all.
    pub fn allocate_adaptive(&self, total_max_tokens: u32, intent: Intent) -> SectionBudgets {
        let system = self.system_tokens.min(total_max_tokens);
        let user_prefs = (total_max_tokens as f64 * self.user_prefs_ratio) as u32;
        let remainder = total_max_tokens.saturating_sub(system + user_prefs) as f64;

        let (short, long, retrieval) = match intent {
            Intent::Query => (0.30, 0.15, 0.55),
            Intent::Create => (0.50, 0.15, 0.35),
            Intent::Chat => (0.65, 0.30, 0.05),
        };
        SectionBudgets {
            system,
            user_prefs,
            short_term: (remainder * short) as u32,
            long_term: (remainder * long) as u32,
            retrieval: (remainder * retrieval) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero_tokens() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn non_empty_is_at_least_one() {
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens(" "), 1);
    }

    #[test]
    fn ascii_weighs_quarter_token() {
        // 40 ASCII chars * 0.25 = 10 tokens.
        assert_eq!(estimate_tokens(&"x".repeat(40)), 10);
    }

    #[test]
    fn cjk_weighs_two_tokens() {
        assert_eq!(estimate_tokens("你好"), 4);
        assert_eq!(estimate_tokens("日本語のメモ"), 12);
    }

    #[test]
    fn mixed_text_sums_weights() {
        // "ab" = 0.5, "你" = 2 → ceil(2.5) = 3.
        assert_eq!(estimate_tokens("ab你"), 3);
    }

    fn allocator() -> BudgetAllocator {
        BudgetAllocator::from_config(&ContextConfig::default())
    }

    #[test]
    fn allocation_with_retrieval_uses_configured_ratios() {
        let b = allocator().allocate(4096, true);
        assert_eq!(b.system, 500);
        assert_eq!(b.user_prefs, 409);
        let remainder = (4096 - 500 - 409) as f64;
        assert_eq!(b.short_term, (remainder * 0.40) as u32);
        assert_eq!(b.long_term, (remainder * 0.15) as u32);
        assert_eq!(b.retrieval, (remainder * 0.45) as u32);
        assert!(b.total() <= 4096);
    }

    #[test]
    fn allocation_without_retrieval_gives_history_more_room() {
        let b = allocator().allocate(4096, false);
        assert_eq!(b.retrieval, 0);
        let remainder = (4096 - 500 - 409) as f64;
        assert_eq!(b.short_term, (remainder * 0.55) as u32);
        assert_eq!(b.long_term, (remainder * 0.30) as u32);
    }

    #[test]
    fn adaptive_query_is_retrieval_heavy() {
        let q = allocator().allocate_adaptive(4096, Intent::Query);
        let c = allocator().allocate_adaptive(4096, Intent::Chat);
        assert!(q.retrieval > q.short_term);
        assert!(c.retrieval < c.short_term);
    }
}
