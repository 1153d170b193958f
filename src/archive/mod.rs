// src/archive/mod.rs

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use crossbeam::channel::Receiver;

use crate::broadcast::ChunkReceiver;

pub mod naming;
pub mod rotation;
pub mod storage;
pub mod writer;

pub use naming::HourlyLayout;
pub use rotation::{RotationController, Shutdown, is_rotation_boundary};
pub use storage::FsStorage;
pub use writer::{ArchiveWriter, WriteStats, run_archive_writer};

/// Where archive bytes end up. Dropping the returned sink closes it.
pub trait ArchiveStorage: Send + Sync {
    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;
}

/// Maps a wall-clock timestamp to the destination of the archive that starts there.
pub trait NamingPolicy: Send {
    fn destination(&self, ts: NaiveDateTime) -> PathBuf;
}

impl<F> NamingPolicy for F
where
    F: Fn(NaiveDateTime) -> PathBuf + Send,
{
    fn destination(&self, ts: NaiveDateTime) -> PathBuf {
        self(ts)
    }
}

/// One archive file plus everything its writer listens on.
pub struct ArchiveTarget {
    pub path: PathBuf,
    pub chunks: ChunkReceiver,
    pub quit: Receiver<()>,
}

impl ArchiveTarget {
    pub fn new(path: impl Into<PathBuf>, chunks: ChunkReceiver, quit: Receiver<()>) -> Self {
        Self {
            path: path.into(),
            chunks,
            quit,
        }
    }
}
