//! Crate-wide error type.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by registration and the line stream.
///
/// Transient per-event failures (a path momentarily missing mid-rotation,
/// a read racing a writer) are not represented here; they resolve to "no
/// new lines" and the next event retries.
#[derive(Debug, Error)]
pub enum Error {
    /// A configured path is missing, not a regular file, or unreadable.
    #[error("{}: not a readable regular file: {source}", .path.display())]
    Config { path: PathBuf, source: io::Error },

    /// The OS notification backend could not be created.
    #[error("failed to initialize filesystem watcher: {0}")]
    Init(notify::Error),

    /// A watch could not be established for a path.
    #[error("{}: failed to register watch: {source}", .path.display())]
    Watch {
        path: PathBuf,
        source: notify::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}
