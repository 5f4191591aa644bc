use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Citation;

/// Event pushed from an external source via a tool adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceEvent {
    pub tool_id: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Caller-supplied retrieval filters; the tenant is taken from the request
/// context, never from the body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HybridQuery {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<QueryFilters>,
    #[serde(default)]
    pub use_graph: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub stream: bool,
}

/// Final non-streaming answer shape. An insufficient-evidence refusal is a
/// normal response, not an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroundedAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub has_sufficient_evidence: bool,
    pub evidence_score: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Answer,
    Citations,
    Cancelled,
    Error,
}

/// One frame of a streaming answer. `done == true` is guaranteed on every
/// exit path: success, refusal, cancellation and error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub content: Value,
    pub done: bool,
}

impl StreamFrame {
    pub fn answer(content: impl Into<String>, done: bool) -> Self {
        Self {
            frame_type: FrameType::Answer,
            content: Value::String(content.into()),
            done,
        }
    }

    pub fn citations(citations: &[Citation]) -> Self {
        Self {
            frame_type: FrameType::Citations,
            content: serde_json::to_value(citations).unwrap_or(Value::Null),
            done: true,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            frame_type: FrameType::Cancelled,
            content: Value::Null,
            done: true,
        }
    }

    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Error,
            content: serde_json::json!({"kind": kind, "message": message.into()}),
            done: true,
        }
    }
}
