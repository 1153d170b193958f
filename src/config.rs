use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::broadcast::DEFAULT_CHUNK_SIZE;
use crate::broadcast::session::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF};

// ---------- Stream ----------
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct StreamConfig {
    pub url: String,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub chunk_size: usize,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000/stream".into(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF.as_millis() as u64,
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout_secs: 10,
            read_timeout_secs: None,
        }
    }
}

impl StreamConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_secs.map(Duration::from_secs)
    }
}

// ---------- Archive ----------
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ArchiveConfig {
    pub dest: PathBuf,
    pub file_prefix: String,
    pub extension: String,
    /// Chunks buffered between fetcher and writer.
    pub channel_capacity: usize,
    /// Name and rotate files by UTC instead of local time.
    pub utc: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dest: PathBuf::from("./archives"),
            file_prefix: "archive".into(),
            extension: "mp3".into(),
            channel_capacity: 256,
            utc: false,
        }
    }
}

// ---------- Root ----------
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub stream: StreamConfig,
    pub archive: ArchiveConfig,
    pub quiet: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stream.url.trim().is_empty() {
            anyhow::bail!("stream url must not be empty");
        }
        if self.stream.chunk_size == 0 {
            anyhow::bail!("stream chunk_size must be greater than zero");
        }
        if self.stream.max_retries == 0 {
            anyhow::bail!("stream max_retries must be greater than zero");
        }
        if self.archive.channel_capacity == 0 {
            anyhow::bail!("archive channel_capacity must be greater than zero");
        }
        Ok(())
    }
}

// ---------- Loader ----------
pub fn load(path: &Path) -> anyhow::Result<Config> {
    let txt = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&txt).with_context(|| format!("parsing config {}", path.display()))
}

// ---------- Command line ----------
#[derive(Debug, Parser)]
#[command(name = "stream-archiver", about = "Archive a live audio stream into hourly files")]
pub struct Cli {
    /// Optional TOML config file; flags override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Broadcast stream URL.
    #[arg(long)]
    pub url: Option<String>,

    /// Directory to write archives to. Must be writable.
    #[arg(long)]
    pub dest: Option<PathBuf>,

    /// Hide debug logging.
    #[arg(long)]
    pub quiet: bool,
}

impl Cli {
    pub fn resolve(self) -> anyhow::Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => load(path)?,
            None => Config::default(),
        };

        if let Some(url) = self.url {
            cfg.stream.url = url;
        }
        if let Some(dest) = self.dest {
            cfg.archive.dest = dest;
        }
        cfg.quiet |= self.quiet;

        cfg.validate()?;
        Ok(cfg)
    }
}
