//! Append-only JSON-lines journal of farm records.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ExpenseEntry, FarmRecordLogger, HarvestEntry, RecordAck};
use crate::error::ToolError;

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JournalRecord<'a> {
    Harvest {
        id: &'a str,
        logged_at: DateTime<Utc>,
        #[serde(flatten)]
        entry: &'a HarvestEntry,
    },
    Expense {
        id: &'a str,
        logged_at: DateTime<Utc>,
        #[serde(flatten)]
        entry: &'a ExpenseEntry,
    },
}

pub struct JsonlRecordLogger {
    path: PathBuf,
    // Serialises appends so lines never interleave
    write_lock: Mutex<()>,
}

impl JsonlRecordLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: &JournalRecord<'_>) -> Result<(), ToolError> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| ToolError::Failed(format!("encode record: {}", e)))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::Failed(format!("create {}: {}", parent.display(), e)))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| ToolError::Failed(format!("open {}: {}", self.path.display(), e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| ToolError::Failed(format!("write {}: {}", self.path.display(), e)))?;
        file.flush()
            .await
            .map_err(|e| ToolError::Failed(format!("flush {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

fn ack(id: String, logged_at: DateTime<Utc>) -> RecordAck {
    RecordAck {
        status: "success".to_string(),
        record_id: id,
        logged_at,
    }
}

#[async_trait]
impl FarmRecordLogger for JsonlRecordLogger {
    async fn log_harvest(&self, entry: HarvestEntry) -> Result<RecordAck, ToolError> {
        let id = Uuid::new_v4().to_string();
        let logged_at = Utc::now();
        self.append(&JournalRecord::Harvest {
            id: &id,
            logged_at,
            entry: &entry,
        })
        .await?;
        log::info!(
            "Logged harvest {}: {} {} {}",
            id,
            entry.amount,
            entry.unit,
            entry.crop
        );
        Ok(ack(id, logged_at))
    }

    async fn log_expense(&self, entry: ExpenseEntry) -> Result<RecordAck, ToolError> {
        let id = Uuid::new_v4().to_string();
        let logged_at = Utc::now();
        self.append(&JournalRecord::Expense {
            id: &id,
            logged_at,
            entry: &entry,
        })
        .await?;
        log::info!("Logged expense {}: {} {}", id, entry.amount, entry.category);
        Ok(ack(id, logged_at))
    }
}
