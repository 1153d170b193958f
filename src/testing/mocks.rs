use std::collections::VecDeque;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::archive::ArchiveStorage;
use crate::broadcast::StreamOpener;

/// What the next `open` of a [`ScriptedOpener`] does.
#[derive(Debug, Clone)]
pub enum Script {
    /// Open fails.
    Refuse,
    /// Open succeeds, the first read fails with the given kind.
    Broken(io::ErrorKind),
    /// These bytes, then EOF.
    Bytes(Vec<u8>),
    /// `count` chunks where every byte of chunk `i` is `i as u8`, then EOF.
    Numbered { chunk_size: usize, count: u64 },
    /// Numbered chunks forever.
    Endless { chunk_size: usize },
}

/// Stream source that plays back a fixed script, one entry per open.
/// Once the script runs out every open is refused.
pub struct ScriptedOpener {
    script: VecDeque<Script>,
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedOpener {
    pub fn new(script: Vec<Script>) -> Self {
        Self {
            script: script.into(),
            opens: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Open attempts so far, refused ones included.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Streams dropped so far.
    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        self.closes.clone()
    }
}

impl StreamOpener for ScriptedOpener {
    fn open(&mut self, url: &str) -> io::Result<Box<dyn Read + Send>> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let reader: Box<dyn Read + Send> = match self.script.pop_front().unwrap_or(Script::Refuse) {
            Script::Refuse => {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("scripted refusal for {}", url),
                ));
            }
            Script::Broken(kind) => Box::new(FailingReader(kind)),
            Script::Bytes(bytes) => Box::new(Cursor::new(bytes)),
            Script::Numbered { chunk_size, count } => {
                Box::new(NumberedReader::new(chunk_size, Some(count)))
            }
            Script::Endless { chunk_size } => Box::new(NumberedReader::new(chunk_size, None)),
        };

        Ok(Box::new(MockStream {
            reader,
            closes: self.closes.clone(),
        }))
    }
}

struct MockStream {
    reader: Box<dyn Read + Send>,
    closes: Arc<AtomicUsize>,
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct FailingReader(io::ErrorKind);

impl Read for FailingReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(self.0, "scripted read failure"))
    }
}

struct NumberedReader {
    chunk_size: usize,
    limit: Option<u64>,
    index: u64,
    offset: usize,
}

impl NumberedReader {
    fn new(chunk_size: usize, limit: Option<u64>) -> Self {
        Self {
            chunk_size,
            limit,
            index: 0,
            offset: 0,
        }
    }
}

impl Read for NumberedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.limit.is_some_and(|limit| self.index >= limit) {
            return Ok(0);
        }
        let n = (self.chunk_size - self.offset).min(buf.len());
        buf[..n].fill(self.index as u8);
        self.offset += n;
        if self.offset == self.chunk_size {
            self.offset = 0;
            self.index += 1;
        }
        Ok(n)
    }
}

/// A file created through [`MemoryStorage`].
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: PathBuf,
    data: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

impl StoredFile {
    pub fn bytes(&self) -> Vec<u8> {
        self.data.lock().expect("lock stored file").clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct MemoryState {
    files: Vec<StoredFile>,
    refuse_creates: bool,
    fail_writes_after: Option<usize>,
    write_delay: Option<Duration>,
}

/// In-memory archive storage. Clones share the same files.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_creates(&self, refuse: bool) {
        self.state.lock().expect("lock memory storage").refuse_creates = refuse;
    }

    /// Files created from now on fail any write that would grow them past `limit` bytes.
    pub fn fail_writes_after(&self, limit: Option<usize>) {
        self.state.lock().expect("lock memory storage").fail_writes_after = limit;
    }

    /// Files created from now on sleep this long on every write.
    pub fn slow_writes(&self, delay: Option<Duration>) {
        self.state.lock().expect("lock memory storage").write_delay = delay;
    }

    /// Files in creation order.
    pub fn files(&self) -> Vec<StoredFile> {
        self.state.lock().expect("lock memory storage").files.clone()
    }
}

impl ArchiveStorage for MemoryStorage {
    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let mut state = self.state.lock().expect("lock memory storage");
        if state.refuse_creates {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("scripted create failure for {}", path.display()),
            ));
        }

        let file = StoredFile {
            path: path.to_path_buf(),
            data: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        };
        state.files.push(file.clone());

        Ok(Box::new(MemorySink {
            data: file.data,
            closed: file.closed,
            fail_after: state.fail_writes_after,
            delay: state.write_delay,
        }))
    }
}

struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
    fail_after: Option<usize>,
    delay: Option<Duration>,
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let mut data = self.data.lock().expect("lock memory sink");
        if self.fail_after.is_some_and(|limit| data.len() + buf.len() > limit) {
            return Err(io::Error::other("scripted write failure"));
        }
        data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
