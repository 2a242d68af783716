use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RetrievalError, Result};

/// What kind of record a retrieval hit points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Memo,
    Schedule,
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemKind::Memo => write!(f, "memo"),
            ItemKind::Schedule => write!(f, "schedule"),
        }
    }
}

/// One retrieval hit. Scores are comparable only within one strategy's
/// output; after RRF fusion they are unitless and monotone-ranked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalItem {
    pub id: i64,
    pub kind: ItemKind,
    pub content: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<serde_json::Value>,
}

/// A validated half-open time window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(RetrievalError::InvalidTimeRange {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }
}

/// The nine named retrieval strategies. Selection happens upstream: the
/// router's intent tag for top-level retrieval, the expert's declared needs
/// for in-expert retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    ScheduleBm25Only,
    MemoListOnly,
    MemoFilterOnly,
    MemoBm25Only,
    MemoSemanticOnly,
    HybridStandard,
    HybridBm25Weighted,
    HybridWithTimeFilter,
    FullPipelineWithReranker,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::ScheduleBm25Only => "schedule_bm25_only",
            Strategy::MemoListOnly => "memo_list_only",
            Strategy::MemoFilterOnly => "memo_filter_only",
            Strategy::MemoBm25Only => "memo_bm25_only",
            Strategy::MemoSemanticOnly => "memo_semantic_only",
            Strategy::HybridStandard => "hybrid_standard",
            Strategy::HybridBm25Weighted => "hybrid_bm25_weighted",
            Strategy::HybridWithTimeFilter => "hybrid_with_time_filter",
            Strategy::FullPipelineWithReranker => "full_pipeline_with_reranker",
        }
    }

    /// Semantic weight used when this strategy fuses two ranked lists.
    pub fn semantic_weight(&self) -> f64 {
        match self {
            Strategy::HybridBm25Weighted => 0.3,
            _ => 0.5,
        }
    }
}

/// A retrieval request as handed to the engine.
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub user_id: i64,
    pub query: String,
    pub strategy: Strategy,
    pub time_range: Option<TimeRange>,
    /// Result cap; strategy defaults apply when unset.
    pub limit: Option<usize>,
    /// Minimum score filter, applied at the end of score-bearing strategies.
    pub min_score: Option<f64>,
}

impl RetrievalRequest {
    pub fn new(user_id: i64, query: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            user_id,
            query: query.into(),
            strategy,
            time_range: None,
            limit: None,
            min_score: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn inverted_time_range_is_rejected() {
        let start = Utc.with_ymd_and_hms(2026, 2, 18, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 2, 17, 0, 0, 0).unwrap();
        assert!(TimeRange::new(start, end).is_err());
        assert!(TimeRange::new(end, start).is_ok());
    }
}
