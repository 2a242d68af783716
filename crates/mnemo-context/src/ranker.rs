//! Priority-ranked greedy fit of context segments into a token budget.

use crate::error::{ContextError, Result};
use crate::segment::{ContextSegment, SegmentRole};
use crate::token::{char_token_cost, estimate_tokens};

/// Minimum useful size for a partially-included segment.
pub const DEFAULT_MIN_SEGMENT_TOKENS: u32 = 100;

/// Sort segments by priority (stable, descending) and greedily include them
/// until the budget runs out. The first segment that would overflow is
/// prefix-truncated token-wise if at least `min_segment_tokens` remain;
/// nothing after it is included either way.
///
/// SystemPrompt and CurrentUserQuery must always fit — when they alone
/// exceed the budget the caller must re-allocate or fail, so this returns a
/// typed error.
pub fn rank_and_fit(
    mut segments: Vec<ContextSegment>,
    budget: u32,
    min_segment_tokens: u32,
) -> Result<Vec<ContextSegment>> {
    let mandatory: u32 = segments
        .iter()
        .filter(|s| {
            matches!(
                s.role,
                SegmentRole::SystemPrompt | SegmentRole::CurrentUserQuery
            )
        })
        .map(|s| s.token_cost)
        .sum();
    if mandatory > budget {
        return Err(ContextError::ContextTooLarge {
            needed: mandatory,
            budget,
        });
    }

    segments.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut included = Vec::new();
    let mut used = 0u32;

    for segment in segments {
        if used + segment.token_cost <= budget {
            used += segment.token_cost;
            included.push(segment);
            continue;
        }

        // First overflow: partial fit or stop.
        let remaining = budget - used;
        if remaining >= min_segment_tokens {
            let truncated = truncate_to_tokens(&segment.content, remaining);
            let mut partial = segment;
            partial.token_cost = estimate_tokens(&truncated);
            partial.content = truncated;
            included.push(partial);
        }
        break;
    }

    Ok(included)
}

/// Cut a string to at most `max_tokens` estimated tokens, on a character
/// boundary (token-wise, never mid-code-point).
pub fn truncate_to_tokens(content: &str, max_tokens: u32) -> String {
    let mut cost = 0.0f64;
    let mut out = String::new();
    for c in content.chars() {
        cost += char_token_cost(c);
        if cost > max_tokens as f64 {
            break;
        }
        out.push(c);
    }
    out
}
