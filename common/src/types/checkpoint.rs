use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persistent cursor enabling incremental and resumable ingestion, keyed by
/// tool or resource id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Checkpoint {
    Cursor {
        cursor: String,
        last_sync: DateTime<Utc>,
    },
    Stream {
        last_event_id: String,
        last_event: DateTime<Utc>,
    },
}

impl Checkpoint {
    pub fn cursor(cursor: impl Into<String>) -> Self {
        Self::Cursor {
            cursor: cursor.into(),
            last_sync: Utc::now(),
        }
    }

    pub fn stream(last_event_id: impl Into<String>) -> Self {
        Self::Stream {
            last_event_id: last_event_id.into(),
            last_event: Utc::now(),
        }
    }
}
