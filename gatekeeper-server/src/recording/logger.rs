use super::types::RecordedEvent;
use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Appends recorded events to a JSONL file from a background task.
///
/// Cloning is cheap; every clone feeds the same writer.
#[derive(Clone)]
pub struct RecordingLogger {
    sender: mpsc::UnboundedSender<RecordedEvent>,
}

impl RecordingLogger {
    pub fn new(log_file_path: PathBuf) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            if let Err(e) = Self::writer_task(log_file_path, receiver).await {
                error!("Recording logger failed: {:#}", e);
            }
        });

        Self { sender }
    }

    pub fn record(&self, event: RecordedEvent) {
        if self.sender.send(event).is_err() {
            error!("Failed to send event to recording logger: writer stopped");
        }
    }

    async fn writer_task(
        log_file_path: PathBuf,
        mut receiver: mpsc::UnboundedReceiver<RecordedEvent>,
    ) -> Result<()> {
        if let Some(parent) = log_file_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create recording directory")?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file_path)
            .await
            .with_context(|| format!("Failed to open {}", log_file_path.display()))?;

        info!("Recording events to: {}", log_file_path.display());

        while let Some(event) = receiver.recv().await {
            let line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            if let Err(e) = file.write_all(format!("{}\n", line).as_bytes()).await {
                error!("Failed to write event to log: {}", e);
                continue;
            }
            if let Err(e) = file.flush().await {
                error!("Failed to flush log file: {}", e);
            }
        }

        info!("Recording writer task shutting down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{Direction, EventType};
    use std::collections::HashMap;
    use std::time::Duration;

    #[tokio::test]
    async fn test_events_are_appended_as_json_lines() {
        let path = std::env::temp_dir()
            .join(format!("gatekeeper-recording-{}", uuid::Uuid::new_v4()))
            .join("events.jsonl");
        let logger = RecordingLogger::new(path.clone());

        for i in 0..2 {
            logger.record(RecordedEvent {
                timestamp: "2024-05-01T12:00:00Z".to_string(),
                correlation_id: format!("cid-{}", i),
                event_type: EventType::GitHubApiCall,
                direction: Direction::Request,
                operation: "GET /repos/octo/hello".to_string(),
                data: serde_json::Value::Null,
                metadata: HashMap::new(),
            });
        }

        let mut lines = Vec::new();
        for _ in 0..100 {
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                lines = content.lines().map(str::to_string).collect();
                if lines.len() == 2 {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(lines.len(), 2);
        let first: RecordedEvent = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first.correlation_id, "cid-0");

        if let Some(dir) = path.parent() {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
    }
}
