// src/archive/writer.rs

use std::io::Write;
use std::path::PathBuf;

use crossbeam::channel::{Receiver, select};
use log::{debug, error, info};

use super::{ArchiveStorage, ArchiveTarget};
use crate::broadcast::ChunkReceiver;
use crate::error::{ArchiverError, ArchiverResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub path: PathBuf,
    pub chunks: u64,
    pub bytes: u64,
}

/// Drains the shared chunk channel into one open archive file.
pub struct ArchiveWriter {
    path: PathBuf,
    sink: Box<dyn Write + Send>,
    chunks: ChunkReceiver,
    quit: Receiver<()>,
}

impl ArchiveWriter {
    /// Opens the destination. Not retried.
    pub fn open(target: ArchiveTarget, storage: &dyn ArchiveStorage) -> ArchiverResult<Self> {
        let sink = storage.create(&target.path).map_err(|source| {
            error!(
                "[writer] error while creating {}: {}",
                target.path.display(),
                source
            );
            ArchiverError::DestinationOpen {
                path: target.path.clone(),
                source,
            }
        })?;
        info!("[writer] new archive file {}", target.path.display());

        Ok(Self {
            path: target.path,
            sink,
            chunks: target.chunks,
            quit: target.quit,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Writes every received chunk until quit fires, then closes the file.
    ///
    /// A failed write stops the writer with `ArchiverError::Write`; the chunk
    /// that failed is lost, nothing is put back on the channel. If the fetcher
    /// is gone and the channel is drained the file is closed as on quit.
    pub fn run(mut self) -> ArchiverResult<WriteStats> {
        let mut stats = WriteStats {
            path: self.path.clone(),
            ..Default::default()
        };

        loop {
            select! {
                recv(self.chunks) -> msg => match msg {
                    Ok(chunk) => {
                        if let Err(source) = self.sink.write_all(&chunk) {
                            error!("[writer] write to {} failed: {}", self.path.display(), source);
                            return Err(ArchiverError::Write {
                                path: self.path,
                                source,
                            });
                        }
                        stats.chunks += 1;
                        stats.bytes += chunk.len() as u64;
                    }
                    Err(_) => {
                        debug!("[writer] stream channel closed");
                        break;
                    }
                },
                recv(self.quit) -> _ => break,
            }
        }

        self.close(stats)
    }

    fn close(mut self, stats: WriteStats) -> ArchiverResult<WriteStats> {
        let flushed = self.sink.flush();
        drop(self.sink);
        flushed.map_err(|source| ArchiverError::Write {
            path: self.path.clone(),
            source,
        })?;

        info!(
            "[writer] closed archive {} ({} chunks, {} bytes)",
            self.path.display(),
            stats.chunks,
            stats.bytes
        );
        Ok(stats)
    }
}

/// Open then run, for callers that do both on the same thread.
pub fn run_archive_writer(
    target: ArchiveTarget,
    storage: &dyn ArchiveStorage,
) -> ArchiverResult<WriteStats> {
    ArchiveWriter::open(target, storage)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{chunk_channel, quit_signal};
    use crate::testing::mocks::MemoryStorage;
    use bytes::Bytes;

    #[test]
    fn quit_without_chunks_leaves_empty_closed_file() {
        let storage = MemoryStorage::new();
        let (_tx, rx) = chunk_channel(4);
        let (quit_tx, quit_rx) = quit_signal();
        quit_tx.send(()).unwrap();

        let stats = run_archive_writer(ArchiveTarget::new("a.mp3", rx, quit_rx), &storage).unwrap();

        assert_eq!(stats.bytes, 0);
        let files = storage.files();
        assert_eq!(files.len(), 1);
        assert!(files[0].is_closed());
        assert!(files[0].bytes().is_empty());
    }

    #[test]
    fn writes_chunks_in_order() {
        let storage = MemoryStorage::new();
        let (tx, rx) = chunk_channel(4);
        let (quit_tx, quit_rx) = quit_signal();
        let writer =
            ArchiveWriter::open(ArchiveTarget::new("a.mp3", rx, quit_rx), &storage).unwrap();
        let handle = std::thread::spawn(move || writer.run());

        tx.send(Bytes::from_static(b"abc")).unwrap();
        tx.send(Bytes::from_static(b"def")).unwrap();
        // once the channel is empty only quit can win the next select
        while !tx.is_empty() {
            std::thread::yield_now();
        }
        drop(quit_tx);

        let stats = handle.join().unwrap().unwrap();
        assert_eq!(stats.chunks, 2);
        assert_eq!(storage.files()[0].bytes(), b"abcdef");
        assert!(storage.files()[0].is_closed());
    }

    #[test]
    fn open_failure_is_reported_not_retried() {
        let storage = MemoryStorage::new();
        storage.refuse_creates(true);
        let (_tx, rx) = chunk_channel(4);
        let (_quit_tx, quit_rx) = quit_signal();

        let err =
            run_archive_writer(ArchiveTarget::new("a.mp3", rx, quit_rx), &storage).unwrap_err();

        assert!(matches!(err, ArchiverError::DestinationOpen { .. }));
        assert!(storage.files().is_empty());
    }

    #[test]
    fn write_failure_stops_writer() {
        let storage = MemoryStorage::new();
        storage.fail_writes_after(Some(4));
        let (tx, rx) = chunk_channel(4);
        let (_quit_tx, quit_rx) = quit_signal();
        tx.send(Bytes::from_static(b"abcd")).unwrap();
        tx.send(Bytes::from_static(b"efgh")).unwrap();
        tx.send(Bytes::from_static(b"ijkl")).unwrap();

        let err = run_archive_writer(ArchiveTarget::new("a.mp3", rx.clone(), quit_rx), &storage)
            .unwrap_err();

        assert!(matches!(err, ArchiverError::Write { .. }));
        assert_eq!(storage.files()[0].bytes(), b"abcd");
        // the chunk after the failed one is still there for the next writer
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"ijkl"));
    }

    #[test]
    fn closed_channel_ends_writer_cleanly() {
        let storage = MemoryStorage::new();
        let (tx, rx) = chunk_channel(4);
        let (_quit_tx, quit_rx) = quit_signal();
        tx.send(Bytes::from_static(b"tail")).unwrap();
        drop(tx);

        let stats = run_archive_writer(ArchiveTarget::new("a.mp3", rx, quit_rx), &storage).unwrap();

        assert_eq!(stats.bytes, 4);
        assert!(storage.files()[0].is_closed());
    }
}
