//! Tether sink: writes the tracked value to a local file.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tether_core::Sink;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Create or truncate the file and write in place.
    #[default]
    Truncate,
    /// Write a sibling temp file and rename it over the destination. Readers
    /// never observe a partially written file.
    Atomic,
}

/// Full-content overwrite of a single file.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
    display: String,
    mode: WriteMode,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, mode: WriteMode) -> Self {
        let path = path.into();
        let display = path.display().to_string();
        Self { path, display, mode }
    }

    pub fn path(&self) -> &Path { &self.path }
    pub fn mode(&self) -> WriteMode { self.mode }

    fn temp_path(&self) -> io::Result<PathBuf> {
        let name = self
            .path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("{} has no file name", self.display)))?;
        let mut tmp = name.to_os_string();
        tmp.push(format!(".tether-{}.tmp", std::process::id()));
        Ok(self.path.with_file_name(tmp))
    }

    async fn write_truncate(&self, content: &str) -> io::Result<()> {
        let mut f = fs::OpenOptions::new().write(true).create(true).truncate(true).open(&self.path).await?;
        f.write_all(content.as_bytes()).await?;
        f.flush().await
    }

    async fn write_atomic(&self, content: &str) -> io::Result<()> {
        let tmp = self.temp_path()?;
        let res = async {
            let mut f = fs::File::create(&tmp).await?;
            f.write_all(content.as_bytes()).await?;
            f.sync_all().await?;
            drop(f);
            fs::rename(&tmp, &self.path).await
        }
        .await;
        if res.is_err() {
            let _ = fs::remove_file(&tmp).await;
        }
        res
    }
}

#[async_trait::async_trait]
impl Sink for FileSink {
    fn destination(&self) -> &str { &self.display }

    async fn write(&self, content: &str) -> io::Result<()> {
        let started = Instant::now();
        let res = match self.mode {
            WriteMode::Truncate => self.write_truncate(content).await,
            WriteMode::Atomic => self.write_atomic(content).await,
        };
        histogram!("tether_sink_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(()) => {
                debug!(path = %self.display, bytes = content.len(), mode = ?self.mode, "sink write ok");
            }
            Err(_) => {
                counter!("tether_sink_errors_total", 1u64);
            }
        }
        res
    }
}
