//! Batch sinks: CSV files under the experiment directory and the latency HTTP API

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::buffer::Sink;
use crate::error::SinkError;
use crate::models::{LatencyRecord, SensorReading};

/// One CSV line per record
pub trait CsvLine {
    fn csv_line(&self) -> String;
}

impl CsvLine for SensorReading {
    /// `timestamp_ms,device_id,sensor_id,v1,v2,...`
    fn csv_line(&self) -> String {
        let mut line = format!("{},{},{}", self.timestamp_ms, self.device_id, self.sensor_id);
        for value in &self.values {
            line.push(',');
            line.push_str(&value.to_string());
        }
        line
    }
}

impl CsvLine for LatencyRecord {
    /// `HH:MM:SS.mmm,latency_ns`, stamped with the local time of the write
    fn csv_line(&self) -> String {
        format!(
            "{},{}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            self.latency.as_nanos()
        )
    }
}

/// Appends CSV lines to a file
pub struct FileSink {
    path: PathBuf,
    existed: bool,
}

impl FileSink {
    /// Create `output_dir` if needed and remember whether the file was already there
    pub fn open(output_dir: impl AsRef<Path>, file_name: &str) -> Result<Self, SinkError> {
        let dir = output_dir.as_ref();
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            info!("Created output directory {}", dir.display());
        }

        let path = dir.join(file_name);
        let existed = path.exists();
        if existed {
            info!("Appending to existing file {}", path.display());
        } else {
            std::fs::File::create(&path)?;
            info!("Created file {}", path.display());
        }

        Ok(Self { path, existed })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file was there before this sink opened it
    pub fn existed(&self) -> bool {
        self.existed
    }
}

#[async_trait]
impl<T> Sink<T> for FileSink
where
    T: CsvLine + Sync,
{
    async fn flush(&mut self, batch: &[T]) -> Result<(), SinkError> {
        let mut out = String::new();
        for record in batch {
            let line = record.csv_line();
            debug!(file = %self.path.display(), "{}", line);
            out.push_str(&line);
            out.push('\n');
        }

        let mut file = OpenOptions::new().append(true).create(true).open(&self.path).await?;
        file.write_all(out.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// POSTs batches as JSON arrays
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(&self, body: Vec<u8>) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<T> Sink<T> for HttpSink
where
    T: Serialize + Sync,
{
    async fn flush(&mut self, batch: &[T]) -> Result<(), SinkError> {
        self.post(serde_json::to_vec(batch)?).await?;
        debug!(url = %self.url, records = batch.len(), "batch sent");
        Ok(())
    }
}
