use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type ArchiverResult<T> = Result<T, ArchiverError>;

#[derive(Debug, Error)]
pub enum ArchiverError {
    #[error("failed to open stream '{url}': {source}")]
    Open {
        url: String,
        #[source]
        source: io::Error,
    },
    #[error("failed reading stream '{url}': {source}")]
    Read {
        url: String,
        #[source]
        source: io::Error,
    },
    #[error("too many error recovery retries for '{url}' ({retries})")]
    RetryBudgetExhausted { url: String, retries: u32 },
    #[error("failed to open archive '{}': {source}", .path.display())]
    DestinationOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed writing archive '{}': {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ArchiverError {
    /// Open and read failures are recovered by the fetcher; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ArchiverError::Open { .. } | ArchiverError::Read { .. })
    }

    pub fn open(url: impl Into<String>, source: io::Error) -> Self {
        Self::Open {
            url: url.into(),
            source,
        }
    }

    pub fn read(url: impl Into<String>, source: io::Error) -> Self {
        Self::Read {
            url: url.into(),
            source,
        }
    }
}
