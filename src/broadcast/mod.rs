// src/broadcast/mod.rs

use std::io::{self, Read};

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, bounded};

pub mod fetcher;
pub mod http;
pub mod session;

pub use fetcher::run_fetcher;
pub use http::HttpStreamOpener;
pub use session::{BroadcastSession, RetryBudget};

/// 64 KiB of stream data per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Fixed-size block of stream bytes. Cloning shares the buffer.
pub type Chunk = Bytes;

pub type ChunkSender = Sender<Chunk>;
pub type ChunkReceiver = Receiver<Chunk>;

/// Bounded FIFO between the fetcher and whichever archive writer is live.
/// The fetcher blocks on send once `capacity` chunks are queued.
pub fn chunk_channel(capacity: usize) -> (ChunkSender, ChunkReceiver) {
    bounded(capacity)
}

/// One-shot stop notification. Sending `()` or dropping the sender both fire it.
pub fn quit_signal() -> (Sender<()>, Receiver<()>) {
    bounded(1)
}

/// Something that can open the upstream stream. Dropping the returned
/// reader closes the connection.
pub trait StreamOpener: Send {
    fn open(&mut self, url: &str) -> io::Result<Box<dyn Read + Send>>;
}

impl<F> StreamOpener for F
where
    F: FnMut(&str) -> io::Result<Box<dyn Read + Send>> + Send,
{
    fn open(&mut self, url: &str) -> io::Result<Box<dyn Read + Send>> {
        self(url)
    }
}

/// Fetcher lifecycle, published for observers that care about recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchEvent {
    Connecting,
    Retrying { count: u32 },
    Recovered,
    Exhausted { retries: u32 },
    Stopped,
}
