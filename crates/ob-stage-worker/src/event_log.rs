//! Append-only JSONL audit log.
//!
//! One `ProgressEvent` per line. The file and its parent directory are
//! created on first write.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use ob_stage_core::ProgressEvent;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct EventLog {
    path: PathBuf,
    writer: Arc<Mutex<Option<BufWriter<File>>>>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, event: &ProgressEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event).context("Failed to serialize event")?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        if let Some(writer) = guard.as_mut() {
            writer
                .write_all(&line)
                .await
                .with_context(|| format!("Failed to write {}", self.path.display()))?;
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            writer
                .flush()
                .await
                .with_context(|| format!("Failed to flush {}", self.path.display()))?;
        }
        Ok(())
    }

    async fn open(&self) -> Result<BufWriter<File>> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        Ok(BufWriter::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ob_stage_core::EventPayload;
    use tempfile::tempdir;

    fn event(workflow_id: i64) -> ProgressEvent {
        ProgressEvent::new(EventPayload::WorkflowSynced {
            workflow_id,
            synced: 1,
            failed: 0,
        })
    }

    #[tokio::test]
    async fn test_append_writes_one_line_per_event() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path().join("nested/events.jsonl"));

        log.append(&event(1)).await.unwrap();
        log.append(&event(2)).await.unwrap();
        log.flush().await.unwrap();

        let content = tokio::fs::read_to_string(log.path()).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let second: ProgressEvent = serde_json::from_str(lines[1]).unwrap();
        assert!(matches!(second.payload, EventPayload::WorkflowSynced { workflow_id: 2, .. }));
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        let first = EventLog::new(&path);
        first.append(&event(1)).await.unwrap();
        first.flush().await.unwrap();

        let second = EventLog::new(&path);
        second.append(&event(2)).await.unwrap();
        second.flush().await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_flush_before_write_is_noop() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events.jsonl"));
        log.flush().await.unwrap();
        assert!(!log.path().exists());
    }
}
