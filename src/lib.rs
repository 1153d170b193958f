// src/lib.rs
pub mod archive;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod testing;

pub use archive::{ArchiveStorage, NamingPolicy, RotationController};
pub use broadcast::{BroadcastSession, Chunk, FetchEvent, StreamOpener};
pub use error::{ArchiverError, ArchiverResult};
