// src/archive/rotation.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use chrono::{NaiveDateTime, Timelike};
use crossbeam::channel::{Receiver, Sender, select};
use log::{debug, error, info, warn};

use super::{ArchiveStorage, ArchiveTarget, ArchiveWriter, NamingPolicy, WriteStats};
use crate::broadcast::{ChunkReceiver, quit_signal};
use crate::error::ArchiverResult;

/// True for ticks at the top of an hour.
pub fn is_rotation_boundary(ts: NaiveDateTime) -> bool {
    ts.minute() == 0 && ts.second() == 0
}

fn hour_of(ts: NaiveDateTime) -> Option<NaiveDateTime> {
    ts.with_minute(0)?.with_second(0)?.with_nanosecond(0)
}

struct LiveWriter {
    path: PathBuf,
    quit: Sender<()>,
    handle: Option<JoinHandle<ArchiverResult<WriteStats>>>,
}

impl LiveWriter {
    /// Fires quit and waits for the writer to close its file.
    fn finish(self) -> Option<WriteStats> {
        drop(self.quit);
        join_writer(&self.path, self.handle?)
    }

    /// Waits for the writer to empty a disconnected channel. Quit stays armed
    /// until then.
    fn drain(self) -> Option<WriteStats> {
        let stats = join_writer(&self.path, self.handle?);
        drop(self.quit);
        stats
    }
}

fn join_writer(
    path: &Path,
    handle: JoinHandle<ArchiverResult<WriteStats>>,
) -> Option<WriteStats> {
    match handle.join() {
        Ok(Ok(stats)) => Some(stats),
        Ok(Err(err)) => {
            error!("[rotation] archive writer failed: {}", err);
            None
        }
        Err(_) => {
            error!("[rotation] archive writer for {} panicked", path.display());
            None
        }
    }
}

/// How [`RotationController::run`] ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Close the live archive right away. Queued chunks are not written.
    Now,
    /// The fetcher is gone: write what is queued, then close.
    Drain,
}

/// Keeps exactly one live archive writer and swaps it at hour boundaries.
///
/// Every writer pulls from the same channel. During a swap the old and the
/// new writer both listen for a moment; each chunk still goes to exactly one
/// of them.
pub struct RotationController {
    chunks: ChunkReceiver,
    storage: Arc<dyn ArchiveStorage>,
    naming: Box<dyn NamingPolicy>,
    live: LiveWriter,
    // live writer stopped on an error and no replacement could be opened yet
    live_failed: bool,
    last_boundary: Option<NaiveDateTime>,
    rotations: u64,
}

impl RotationController {
    /// Opens the first archive, named from `now`. Failure here is fatal for the caller.
    pub fn start(
        chunks: ChunkReceiver,
        storage: Arc<dyn ArchiveStorage>,
        naming: Box<dyn NamingPolicy>,
        now: NaiveDateTime,
    ) -> ArchiverResult<Self> {
        let path = naming.destination(now);
        let live = spawn_writer(path, &chunks, storage.as_ref())?;

        Ok(Self {
            chunks,
            storage,
            naming,
            live,
            live_failed: false,
            last_boundary: if is_rotation_boundary(now) {
                hour_of(now)
            } else {
                None
            },
            rotations: 0,
        })
    }

    pub fn live_path(&self) -> &Path {
        &self.live.path
    }

    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    /// Rotates when `ts` is the first boundary tick of its hour.
    pub fn on_tick(&mut self, ts: NaiveDateTime) -> ArchiverResult<bool> {
        if !is_rotation_boundary(ts) {
            return Ok(false);
        }

        let hour = hour_of(ts);
        if hour.is_some() && self.last_boundary == hour {
            debug!("[rotation] already rotated for {}", ts);
            return Ok(false);
        }
        // a failed open is not retried until the next boundary
        self.last_boundary = hour;

        self.rotate(ts)?;
        Ok(true)
    }

    /// Starts a writer for `ts`, then retires the old one.
    ///
    /// The new file is opened before the old writer is told to quit, so an
    /// open failure leaves the old writer live.
    pub fn rotate(&mut self, ts: NaiveDateTime) -> ArchiverResult<&Path> {
        let path = self.naming.destination(ts);
        let next = match spawn_writer(path, &self.chunks, self.storage.as_ref()) {
            Ok(next) => next,
            Err(err) => {
                if self.live_failed {
                    warn!("[rotation] no live archive, retrying next tick: {}", err);
                } else {
                    warn!(
                        "[rotation] keeping {} live: {}",
                        self.live.path.display(),
                        err
                    );
                }
                return Err(err);
            }
        };

        let old = std::mem::replace(&mut self.live, next);
        self.live_failed = false;
        info!(
            "[rotation] rotating archive {} -> {}",
            old.path.display(),
            self.live.path.display()
        );
        old.finish();
        self.rotations += 1;

        Ok(&self.live.path)
    }

    /// Notices a live writer that stopped on its own.
    ///
    /// After a write error a fresh archive named from `now` takes over. If
    /// that open fails too, every later call tries again until one succeeds.
    /// A writer that ended because the stream channel closed is not replaced.
    pub fn check_live(&mut self, now: NaiveDateTime) -> ArchiverResult<bool> {
        if !self.live_failed {
            let finished = self
                .live
                .handle
                .as_ref()
                .is_some_and(|handle| handle.is_finished());
            if !finished {
                return Ok(false);
            }

            let Some(handle) = self.live.handle.take() else {
                return Ok(false);
            };
            match handle.join() {
                Ok(Ok(stats)) => {
                    info!(
                        "[rotation] archive writer for {} stopped after {} bytes",
                        stats.path.display(),
                        stats.bytes
                    );
                    return Ok(false);
                }
                Ok(Err(err)) => error!("[rotation] live archive writer failed: {}", err),
                Err(_) => error!(
                    "[rotation] archive writer for {} panicked",
                    self.live.path.display()
                ),
            }
            self.live_failed = true;
        }

        self.rotate(now)?;
        Ok(true)
    }

    /// Tick loop. Runs until `stop` says how to end or the ticker goes away,
    /// then closes the live archive.
    pub fn run<C>(
        mut self,
        ticks: &Receiver<Instant>,
        stop: &Receiver<Shutdown>,
        clock: C,
    ) -> Option<WriteStats>
    where
        C: Fn() -> NaiveDateTime,
    {
        info!("[rotation] archiving to {}", self.live.path.display());

        loop {
            select! {
                recv(ticks) -> tick => {
                    if tick.is_err() {
                        break;
                    }
                    // ticks may be dropped for a slow receiver; a missed
                    // boundary tick means no rotation that hour
                    let now = clock();
                    if let Err(err) = self.on_tick(now) {
                        error!("[rotation] rotation at {} failed: {}", now, err);
                    }
                    if let Err(err) = self.check_live(now) {
                        error!("[rotation] replacing failed writer at {} failed: {}", now, err);
                    }
                }
                recv(stop) -> msg => match msg {
                    Ok(Shutdown::Drain) => return self.drain(),
                    _ => break,
                },
            }
        }

        self.shutdown()
    }

    pub fn shutdown(self) -> Option<WriteStats> {
        info!("[rotation] closing {}", self.live.path.display());
        self.live.finish()
    }

    /// Closes the live archive once it has written every queued chunk.
    ///
    /// Blocks until all chunk senders are dropped, so call it only after the
    /// fetcher has released its session.
    pub fn drain(self) -> Option<WriteStats> {
        info!(
            "[rotation] writing queued chunks to {} before closing",
            self.live.path.display()
        );
        self.live.drain()
    }
}

fn spawn_writer(
    path: PathBuf,
    chunks: &ChunkReceiver,
    storage: &dyn ArchiveStorage,
) -> ArchiverResult<LiveWriter> {
    let (quit_tx, quit_rx) = quit_signal();
    let target = ArchiveTarget::new(path.clone(), chunks.clone(), quit_rx);
    let writer = ArchiveWriter::open(target, storage)?;
    let handle = std::thread::spawn(move || writer.run());

    Ok(LiveWriter {
        path,
        quit: quit_tx,
        handle: Some(handle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::HourlyLayout;
    use crate::broadcast::{ChunkSender, chunk_channel};
    use crate::error::ArchiverError;
    use crate::testing::mocks::MemoryStorage;
    use bytes::Bytes;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn at(d: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2015, 9, d)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn drained(tx: &ChunkSender) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !tx.is_empty() {
            assert!(Instant::now() < deadline, "writer never drained the channel");
            std::thread::yield_now();
        }
    }

    fn controller(
        storage: &MemoryStorage,
        now: NaiveDateTime,
    ) -> (ChunkSender, RotationController) {
        let (tx, rx) = chunk_channel(16);
        let ctl = RotationController::start(
            rx,
            Arc::new(storage.clone()),
            Box::new(HourlyLayout::new("/archives", "radio", "mp3")),
            now,
        )
        .unwrap();
        (tx, ctl)
    }

    #[test]
    fn boundary_is_top_of_hour_only() {
        assert!(is_rotation_boundary(at(18, 0, 0, 0)));
        assert!(is_rotation_boundary(at(18, 13, 0, 0)));
        assert!(!is_rotation_boundary(at(18, 13, 0, 1)));
        assert!(!is_rotation_boundary(at(18, 13, 1, 0)));
        assert!(!is_rotation_boundary(at(18, 23, 59, 59)));
    }

    #[test]
    fn rotates_at_midnight_not_before() {
        let storage = MemoryStorage::new();
        let (_tx, mut ctl) = controller(&storage, at(18, 23, 30, 12));

        assert!(!ctl.on_tick(at(18, 23, 59, 59)).unwrap());
        assert_eq!(storage.files().len(), 1);

        assert!(ctl.on_tick(at(19, 0, 0, 0)).unwrap());

        let files = storage.files();
        assert_eq!(files.len(), 2);
        assert!(files[0].is_closed());
        assert!(!files[1].is_closed());
        assert!(
            files[1]
                .path
                .to_string_lossy()
                .ends_with("radio_2015-09-19_000000.mp3")
        );
        assert_eq!(ctl.live_path(), files[1].path.as_path());
        assert_eq!(ctl.rotations(), 1);
    }

    #[test]
    fn rotates_at_most_once_per_hour() {
        let storage = MemoryStorage::new();
        let (_tx, mut ctl) = controller(&storage, at(18, 9, 59, 0));

        assert!(ctl.on_tick(at(18, 10, 0, 0)).unwrap());
        assert!(!ctl.on_tick(at(18, 10, 0, 0)).unwrap());
        assert!(ctl.on_tick(at(18, 11, 0, 0)).unwrap());

        assert_eq!(storage.files().len(), 3);
    }

    #[test]
    fn start_on_boundary_does_not_rotate_same_hour() {
        let storage = MemoryStorage::new();
        let (_tx, mut ctl) = controller(&storage, at(18, 10, 0, 0));

        assert!(!ctl.on_tick(at(18, 10, 0, 0)).unwrap());
        assert_eq!(storage.files().len(), 1);
    }

    #[test]
    fn open_failure_keeps_old_writer_live() {
        let storage = MemoryStorage::new();
        let (tx, mut ctl) = controller(&storage, at(18, 9, 59, 0));
        let first = ctl.live_path().to_path_buf();

        storage.refuse_creates(true);
        let err = ctl.on_tick(at(18, 10, 0, 0)).unwrap_err();
        assert!(matches!(err, ArchiverError::DestinationOpen { .. }));
        assert_eq!(ctl.live_path(), first.as_path());

        tx.send(Bytes::from_static(b"still here")).unwrap();
        drained(&tx);
        storage.refuse_creates(false);
        ctl.shutdown();

        let files = storage.files();
        assert_eq!(files.len(), 1);
        assert!(files[0].is_closed());
        assert_eq!(files[0].bytes(), b"still here");
    }

    #[test]
    fn failed_writer_is_replaced() {
        let storage = MemoryStorage::new();
        storage.fail_writes_after(Some(0));
        let (tx, mut ctl) = controller(&storage, at(18, 9, 0, 0));
        storage.fail_writes_after(None);

        tx.send(Bytes::from_static(b"lost")).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !ctl.check_live(at(18, 9, 0, 5)).unwrap() {
            assert!(Instant::now() < deadline, "writer never failed");
            std::thread::sleep(Duration::from_millis(5));
        }

        tx.send(Bytes::from_static(b"kept")).unwrap();
        drained(&tx);
        ctl.shutdown();

        let files = storage.files();
        assert_eq!(files.len(), 2);
        assert!(
            files[1]
                .path
                .to_string_lossy()
                .ends_with("radio_2015-09-18_090005.mp3")
        );
        assert_eq!(files[1].bytes(), b"kept");
    }

    #[test]
    fn run_stops_on_signal_and_closes_archive() {
        let storage = MemoryStorage::new();
        let (_tx, ctl) = controller(&storage, at(18, 9, 59, 58));
        let (tick_tx, tick_rx) = crossbeam::channel::unbounded();
        let (stop_tx, stop_rx) = crossbeam::channel::unbounded();

        let times = std::sync::Mutex::new(vec![at(18, 10, 0, 0), at(18, 9, 59, 59)]);
        let clock = move || times.lock().unwrap().pop().unwrap_or(at(18, 10, 0, 1));

        let handle = std::thread::spawn(move || ctl.run(&tick_rx, &stop_rx, clock));
        tick_tx.send(Instant::now()).unwrap();
        tick_tx.send(Instant::now()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while storage.files().len() < 2 {
            assert!(Instant::now() < deadline, "no rotation happened");
            std::thread::sleep(Duration::from_millis(5));
        }
        stop_tx.send(Shutdown::Now).unwrap();

        let stats = handle.join().unwrap().unwrap();
        assert!(stats.path.to_string_lossy().ends_with("radio_2015-09-18_100000.mp3"));
        assert!(storage.files().iter().all(|f| f.is_closed()));
    }

    #[test]
    fn failed_replacement_is_retried_on_later_checks() {
        let storage = MemoryStorage::new();
        storage.fail_writes_after(Some(0));
        let (tx, mut ctl) = controller(&storage, at(18, 9, 0, 0));
        storage.fail_writes_after(None);
        storage.refuse_creates(true);

        tx.send(Bytes::from_static(b"lost")).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match ctl.check_live(at(18, 9, 0, 1)) {
                Ok(false) => {
                    assert!(Instant::now() < deadline, "writer never failed");
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(true) => panic!("replacement opened while creates are refused"),
                Err(err) => {
                    assert!(matches!(err, ArchiverError::DestinationOpen { .. }));
                    break;
                }
            }
        }

        // nobody reads the channel until a replacement opens
        tx.send(Bytes::from_static(b"queued")).unwrap();
        assert!(ctl.check_live(at(18, 9, 0, 2)).is_err());
        assert_eq!(storage.files().len(), 1);

        storage.refuse_creates(false);
        assert!(ctl.check_live(at(18, 9, 0, 3)).unwrap());
        assert!(!ctl.check_live(at(18, 9, 0, 4)).unwrap());

        drained(&tx);
        ctl.shutdown();

        let files = storage.files();
        assert_eq!(files.len(), 2);
        assert!(
            files[1]
                .path
                .to_string_lossy()
                .ends_with("radio_2015-09-18_090003.mp3")
        );
        assert_eq!(files[1].bytes(), b"queued");
    }

    #[test]
    fn drain_writes_every_queued_chunk() {
        let storage = MemoryStorage::new();
        storage.slow_writes(Some(Duration::from_millis(5)));
        let (tx, ctl) = controller(&storage, at(18, 9, 30, 0));

        for i in 0..16u8 {
            tx.send(Bytes::from(vec![i; 8])).unwrap();
        }
        // fetcher gone
        drop(tx);

        let stats = ctl.drain().unwrap();
        assert_eq!(stats.chunks, 16);

        let files = storage.files();
        assert!(files[0].is_closed());
        let expected: Vec<u8> = (0..16u8).flat_map(|i| vec![i; 8]).collect();
        assert_eq!(files[0].bytes(), expected);
    }

    #[test]
    fn run_drains_when_told_the_fetcher_is_gone() {
        let storage = MemoryStorage::new();
        storage.slow_writes(Some(Duration::from_millis(5)));
        let (tx, ctl) = controller(&storage, at(18, 9, 30, 0));
        let (_tick_tx, tick_rx) = crossbeam::channel::unbounded();
        let (stop_tx, stop_rx) = crossbeam::channel::unbounded();

        for _ in 0..8 {
            tx.send(Bytes::from_static(b"abcd")).unwrap();
        }
        drop(tx);
        stop_tx.send(Shutdown::Drain).unwrap();

        let stats = ctl.run(&tick_rx, &stop_rx, || at(18, 9, 30, 1)).unwrap();
        assert_eq!(stats.bytes, 32);
        assert_eq!(storage.files()[0].bytes().len(), 32);
    }
}
