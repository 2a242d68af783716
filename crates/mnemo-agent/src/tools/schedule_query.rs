//! Schedule lookup tool.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

use mnemo_blocks::{BlockEvent, EventType};
use mnemo_retrieval::{RetrievalRequest, Retriever, Strategy, TimeRange};

use super::{Tool, ToolContext, ToolResult};

/// Scans the user's schedules inside a time window.
pub struct ScheduleQueryTool {
    retriever: Arc<Retriever>,
}

impl ScheduleQueryTool {
    pub fn new(retriever: Arc<Retriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl Tool for ScheduleQueryTool {
    fn name(&self) -> &str {
        "schedule_query"
    }

    fn description(&self) -> &str {
        "Look up the user's schedule entries. Provide either a date \
         (YYYY-MM-DD) or an explicit start/end RFC3339 window."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "date": { "type": "string", "description": "A single day, YYYY-MM-DD." },
                "start": { "type": "string", "description": "RFC3339 window start." },
                "end": { "type": "string", "description": "RFC3339 window end." }
            }
        })
    }

    async fn execute(&self, ctx: &ToolContext, input: serde_json::Value) -> ToolResult {
        let range = match parse_range(&input) {
            Ok(Some(range)) => range,
            Ok(None) => return ToolResult::error("provide a date or a start/end window"),
            Err(msg) => return ToolResult::error(msg),
        };

        let mut request = RetrievalRequest::new(ctx.user_id, "", Strategy::ScheduleBm25Only);
        request.time_range = Some(range);

        match self.retriever.retrieve(&ctx.cancel, &request).await {
            Ok(outcome) => {
                let event = BlockEvent::new(
                    EventType::ScheduleQueryResult,
                    serde_json::to_string(&outcome.items).unwrap_or_default(),
                );
                let content = if outcome.items.is_empty() {
                    "No schedule entries in that window.".to_string()
                } else {
                    let mut out = format!("{} schedule entry/entries:\n", outcome.items.len());
                    for item in &outcome.items {
                        out.push_str(&format!("- {}\n", item.content));
                    }
                    out.trim_end().to_string()
                };
                ToolResult::success(content).with_domain_event(event)
            }
            Err(e) => ToolResult::error(format!("schedule_query failed: {e}")),
        }
    }
}

/// Parse a window from tool input: either `date` (whole day, UTC) or
/// `start`/`end` RFC3339 pair. Returns Ok(None) when neither is given.
pub(crate) fn parse_range(
    input: &serde_json::Value,
) -> std::result::Result<Option<TimeRange>, String> {
    if let Some(date) = input.get("date").and_then(|v| v.as_str()) {
        let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|_| format!("invalid date: {date}"))?;
        let start = Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0).unwrap());
        return TimeRange::new(start, start + Duration::days(1))
            .map(Some)
            .map_err(|e| e.to_string());
    }

    let start = input.get("start").and_then(|v| v.as_str());
    let end = input.get("end").and_then(|v| v.as_str());
    match (start, end) {
        (Some(s), Some(e)) => {
            let start = parse_ts(s)?;
            let end = parse_ts(e)?;
            TimeRange::new(start, end).map(Some).map_err(|e| e.to_string())
        }
        (None, None) => Ok(None),
        _ => Err("both start and end are required for a window".to_string()),
    }
}

fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| format!("invalid timestamp: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_parses_to_a_whole_day() {
        let range = parse_range(&serde_json::json!({"date": "2026-02-17"}))
            .unwrap()
            .unwrap();
        assert_eq!((range.end - range.start).num_hours(), 24);
    }

    #[test]
    fn inverted_window_is_an_error() {
        let out = parse_range(&serde_json::json!({
            "start": "2026-02-18T00:00:00Z",
            "end": "2026-02-17T00:00:00Z"
        }));
        assert!(out.is_err());
    }

    #[test]
    fn missing_fields_yield_none() {
        assert!(parse_range(&serde_json::json!({})).unwrap().is_none());
    }
}
