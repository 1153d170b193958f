// src/broadcast/session.rs

use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use log::{info, warn};

use super::{ChunkSender, DEFAULT_CHUNK_SIZE, FetchEvent};

pub const DEFAULT_MAX_RETRIES: u32 = 8;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Consecutive-failure counter with a fixed backoff.
///
/// `count` never exceeds `max`: the fetcher only increments after an attempt
/// that started with `count < max`.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    count: u32,
    max: u32,
    backoff: Duration,
}

impl RetryBudget {
    pub fn new(max: u32, backoff: Duration) -> Self {
        Self {
            count: 0,
            max,
            backoff,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn exhausted(&self) -> bool {
        self.count >= self.max
    }

    /// Blocks for the backoff, then counts the failure.
    pub fn increment(&mut self) -> u32 {
        std::thread::sleep(self.backoff);
        self.count = (self.count + 1).min(self.max);
        info!("[fetcher] retrying... retry_count={}", self.count);
        self.count
    }

    /// Returns true when a failure streak was cleared.
    pub fn reset(&mut self) -> bool {
        let had_failures = self.count > 0;
        self.count = 0;
        had_failures
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF)
    }
}

/// State owned by one fetcher for its whole life.
pub struct BroadcastSession {
    url: String,
    chunk_size: usize,
    pub(crate) retry: RetryBudget,
    pub(crate) chunks: ChunkSender,
    pub(crate) quit: Receiver<()>,
    events: Option<Sender<FetchEvent>>,
}

impl BroadcastSession {
    pub fn new(url: impl Into<String>, chunks: ChunkSender, quit: Receiver<()>) -> Self {
        Self {
            url: url.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryBudget::default(),
            chunks,
            quit,
            events: None,
        }
    }

    pub fn with_retry(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.retry = RetryBudget::new(max_retries, backoff);
        self
    }

    /// Zero is ignored, it would deliver empty chunks forever.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        if chunk_size == 0 {
            warn!("[fetcher] chunk size 0 ignored, keeping {}", self.chunk_size);
            return self;
        }
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_events(mut self, events: Sender<FetchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn retry_count(&self) -> u32 {
        self.retry.count()
    }

    pub fn max_retries(&self) -> u32 {
        self.retry.max()
    }

    pub(crate) fn emit(&self, event: FetchEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    pub(crate) fn quit_fired(&self) -> bool {
        matches!(
            self.quit.try_recv(),
            Ok(()) | Err(TryRecvError::Disconnected)
        )
    }

    pub(crate) fn increment_retry(&mut self) {
        let count = self.retry.increment();
        self.emit(FetchEvent::Retrying { count });
    }

    pub(crate) fn reset_retry_count(&mut self) {
        if self.retry.reset() {
            info!("[fetcher] recovered from last error");
            self.emit(FetchEvent::Recovered);
        }
    }
}
