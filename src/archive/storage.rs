// src/archive/storage.rs

use std::fs::{OpenOptions, create_dir_all};
use std::io::{self, Write};
use std::path::Path;

use log::debug;

use super::ArchiveStorage;

/// Local filesystem. Parent directories are created on demand and existing
/// files are appended to, never truncated.
#[derive(Debug, Clone, Default)]
pub struct FsStorage;

impl ArchiveStorage for FsStorage {
    fn create(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        debug!("[storage] opening new archive file {}", path.display());
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(file))
    }
}
