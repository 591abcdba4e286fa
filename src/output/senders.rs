use async_trait::async_trait;
use log::{debug, error};
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use super::payload::Publication;
use crate::utils::error::ModbusError;

#[async_trait]
pub trait DataSender: Send + Sync {
    /// `formatted` is the formatter's rendering of `publication`.
    async fn send(&self, publication: &Publication, formatted: &str) -> Result<(), ModbusError>;
    fn sender_type(&self) -> &str;
    fn destination(&self) -> &str;
}

pub struct ConsoleSender;

#[async_trait]
impl DataSender for ConsoleSender {
    async fn send(&self, publication: &Publication, formatted: &str) -> Result<(), ModbusError> {
        println!("{}", publication.topic);
        println!("{}", formatted);
        Ok(())
    }

    fn sender_type(&self) -> &str {
        "console"
    }

    fn destination(&self) -> &str {
        "stdout"
    }
}

/// Appends one JSON object per publication: `{"topic": ..., "retain": ..., "payload": {...}}`.
pub struct FileSender {
    file_path: String,
}

impl FileSender {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        Self {
            file_path: file_path.as_ref().to_string_lossy().to_string(),
        }
    }
}

#[async_trait]
impl DataSender for FileSender {
    async fn send(&self, publication: &Publication, _formatted: &str) -> Result<(), ModbusError> {
        let line = json!({
            "topic": publication.topic,
            "retain": publication.retain,
            "payload": publication.payload,
        });

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .await
            .map_err(|e| {
                error!("❌ Failed to open file {}: {}", self.file_path, e);
                ModbusError::CommunicationError(format!("File open error: {}", e))
            })?;

        file.write_all(format!("{}\n", line).as_bytes()).await.map_err(|e| {
            error!("❌ Failed to write to file {}: {}", self.file_path, e);
            ModbusError::CommunicationError(format!("File write error: {}", e))
        })?;
        file.flush().await?;

        debug!("📝 {} appended to {}", publication.topic, self.file_path);
        Ok(())
    }

    fn sender_type(&self) -> &str {
        "file"
    }

    fn destination(&self) -> &str {
        &self.file_path
    }
}

/// Keeps every `(topic, formatted)` pair in memory.
#[derive(Clone, Default)]
pub struct MemorySender {
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

impl MemorySender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DataSender for MemorySender {
    async fn send(&self, publication: &Publication, formatted: &str) -> Result<(), ModbusError> {
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| ModbusError::CommunicationError("Memory sender poisoned".to_string()))?;
        sent.push((publication.topic.clone(), formatted.to_string()));
        Ok(())
    }

    fn sender_type(&self) -> &str {
        "memory"
    }

    fn destination(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::payload::{MessageType, PayloadBuilder};
    use chrono::Utc;

    #[tokio::test]
    async fn test_file_sender_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let sender = FileSender::new(&path);

        let mut builder = PayloadBuilder::new("g", "n");
        for _ in 0..2 {
            let publication = builder.build(MessageType::DData, "dev", &[], Utc::now());
            sender.send(&publication, "").await.unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["topic"], "spBv1.0/g/DDATA/n/dev");
        assert_eq!(lines[1]["payload"]["seq"], 1);
    }

    #[tokio::test]
    async fn test_memory_sender_records() {
        let sender = MemorySender::new();
        let publication =
            PayloadBuilder::new("g", "n").build(MessageType::DBirth, "dev", &[], Utc::now());
        sender.send(&publication, "hello").await.unwrap();
        assert_eq!(
            sender.sent(),
            vec![("spBv1.0/g/DBIRTH/n/dev".to_string(), "hello".to_string())]
        );
    }
}
