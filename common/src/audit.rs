//! Append-only audit trail for tool invocations. Deliberately independent
//! of the tracing backend: records go to their own sink and are never
//! rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tokio::{
    io::AsyncWriteExt,
    sync::Mutex,
};
use uuid::Uuid;

use crate::error::RagError;
use async_trait::async_trait;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Started,
    Succeeded { result_bytes: usize },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub invocation_id: Uuid,
    pub tool_id: String,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub params: Value,
    pub ts: DateTime<Utc>,
    pub outcome: AuditOutcome,
}

impl AuditRecord {
    pub fn started(
        invocation_id: Uuid,
        tool_id: &str,
        tenant_id: Option<&str>,
        user_id: Option<&str>,
        params: Value,
    ) -> Self {
        Self {
            invocation_id,
            tool_id: tool_id.to_owned(),
            tenant_id: tenant_id.map(str::to_owned),
            user_id: user_id.map(str::to_owned),
            params,
            ts: Utc::now(),
            outcome: AuditOutcome::Started,
        }
    }

    pub fn finished(&self, outcome: AuditOutcome) -> Self {
        Self {
            ts: Utc::now(),
            outcome,
            params: Value::Null,
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, record: AuditRecord) -> Result<(), RagError>;
}

#[derive(Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append(&self, record: AuditRecord) -> Result<(), RagError> {
        self.records.lock().await.push(record);
        Ok(())
    }
}

/// JSON-lines file sink, opened in append mode.
pub struct FileAuditLog {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl FileAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AuditLog for FileAuditLog {
    async fn append(&self, record: AuditRecord) -> Result<(), RagError> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(&line).await?;
            file.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_log_is_append_only_in_order() {
        let log = MemoryAuditLog::new();
        let id = Uuid::new_v4();
        let started = AuditRecord::started(id, "crm.list_leads", Some("acme"), None, json!({}));
        log.append(started.clone()).await.unwrap();
        log.append(started.finished(AuditOutcome::Succeeded { result_bytes: 128 }))
            .await
            .unwrap();

        let records = log.records().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, AuditOutcome::Started);
        assert_eq!(
            records[1].outcome,
            AuditOutcome::Succeeded { result_bytes: 128 }
        );
        assert_eq!(records[0].invocation_id, records[1].invocation_id);
    }

    #[tokio::test]
    async fn file_log_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = FileAuditLog::new(&path);

        let id = Uuid::new_v4();
        log.append(AuditRecord::started(
            id,
            "crm.list_leads",
            Some("acme"),
            Some("ada"),
            json!({"cursor": "p1"}),
        ))
        .await
        .unwrap();
        log.append(
            AuditRecord::started(id, "crm.list_leads", Some("acme"), Some("ada"), json!({}))
                .finished(AuditOutcome::Failed {
                    error: "timeout".into(),
                }),
        )
        .await
        .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.tool_id, "crm.list_leads");
        assert_eq!(first.outcome, AuditOutcome::Started);
    }
}
