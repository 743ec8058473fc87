//! Everything related to turning filesystem events into captured lines.

use std::collections::{HashMap, VecDeque};
use std::fs::Metadata;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::fs::{canonicalize, metadata, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::events::{EventMux, RawEventKind};

/// Identity of the file instance currently behind a path, independent of
/// the path itself. Two distinct files at the same path over time compare
/// unequal, which is how rotation is told apart from growth.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    #[cfg(unix)]
    fn of(md: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        FileId {
            dev: md.dev(),
            ino: md.ino(),
        }
    }

    #[cfg(not(unix))]
    fn of(md: &Metadata) -> Self {
        // No stable inode equivalent on this platform; creation time is
        // the closest available proxy for "same underlying file".
        let created = md
            .created()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        FileId {
            dev: 0,
            ino: created,
        }
    }
}

/// One complete line captured from a watched file.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Line {
    source: PathBuf,
    text: String,
}

impl Line {
    /// Returns the registered path of the file the line was read from.
    pub fn source(&self) -> &Path {
        self.source.as_path()
    }

    /// Returns the line itself, without its trailing newline.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Returns the internal components that make up a `Line`.
    pub fn into_inner(self) -> (PathBuf, String) {
        let Line { source, text } = self;

        (source, text)
    }
}

/// What a metadata probe of a watched path revealed.
enum Freshness {
    /// Same file instance as last observed.
    Same,
    /// The path now refers to a different file instance.
    Rotated,
    /// The path does not currently resolve to a regular file.
    Missing,
}

/// Read cursor for a single watched file: the identity last observed at
/// its path, and how many bytes of that file have already been emitted.
#[derive(Clone, Copy, Debug)]
struct TailedFile {
    identity: FileId,
    offset: u64,
}

impl TailedFile {
    /// Cursor positioned at the current end of the file, so only content
    /// appended from now on is ever emitted.
    fn starting_at_end(md: &Metadata) -> Self {
        TailedFile {
            identity: FileId::of(md),
            offset: md.len(),
        }
    }

    /// Re-resolves the identity behind `path`, adopting a replacement file
    /// (cursor back to the start) if one is found.
    async fn probe(&mut self, path: &Path) -> Freshness {
        let md = match metadata(path).await {
            Ok(md) if md.is_file() => md,
            Ok(_) | Err(_) => return Freshness::Missing,
        };

        let identity = FileId::of(&md);
        if identity == self.identity {
            return Freshness::Same;
        }

        self.identity = identity;
        self.offset = 0;
        Freshness::Rotated
    }

    /// Reads and returns the complete lines written past the cursor,
    /// advancing it to the end of the last complete line.
    ///
    /// A replaced or shrunken file resets the cursor to the start first. A
    /// path that does not currently resolve to a regular file yields no
    /// lines and leaves the cursor untouched, as does any read error; the
    /// next event simply retries.
    async fn drain(&mut self, path: &Path) -> io::Result<Vec<String>> {
        let md = match metadata(path).await {
            Ok(md) if md.is_file() => md,
            Ok(_) | Err(_) => return Ok(Vec::new()),
        };

        let identity = FileId::of(&md);
        if identity != self.identity {
            debug!(path = %path.display(), "path now refers to a new file, reading from start");
            self.identity = identity;
            self.offset = 0;
        } else if md.len() < self.offset {
            debug!(path = %path.display(), "file shrank, reading from start");
            self.offset = 0;
        }

        if md.len() == self.offset {
            return Ok(Vec::new());
        }

        let buf = read_range(path, self.offset, md.len() - self.offset).await?;
        let (lines, consumed) = complete_lines(&buf);
        self.offset += consumed as u64;

        Ok(lines)
    }
}

async fn read_range(path: &Path, start: u64, len: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;

    let mut buf = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut buf).await?;

    Ok(buf)
}

/// Splits `buf` into its complete lines, returning them together with the
/// number of bytes they span.
///
/// Bytes past the last newline are a partial line still being written;
/// they are not returned and not counted, so the cursor holds them back
/// until a later read completes them. That also keeps a trailing partial
/// UTF-8 codepoint buffered: continuation bytes can never equal `\n`, so
/// no split point lands inside a codepoint. A complete line that still
/// fails to decode is captured lossily rather than dropped.
fn complete_lines(buf: &[u8]) -> (Vec<String>, usize) {
    let consumed = match buf.iter().rposition(|&b| b == b'\n') {
        Some(idx) => idx + 1,
        None => return (Vec::new(), 0),
    };

    let lines = buf[..consumed]
        .split_inclusive(|&b| b == b'\n')
        .map(|raw| {
            let mut end = raw.len() - 1;
            if end > 0 && raw[end - 1] == b'\r' {
                end -= 1;
            }
            match std::str::from_utf8(&raw[..end]) {
                Ok(text) => text.to_owned(),
                Err(_) => String::from_utf8_lossy(&raw[..end]).into_owned(),
            }
        })
        .collect();

    (lines, consumed)
}

/// Follows a set of files, and can be polled to receive their newly
/// written lines as a single multiplexed sequence.
///
/// ## Semantics
///
/// Each registered path starts tailing from its current end: content
/// already present at registration is never emitted. Lines surface in the
/// order the underlying filesystem events arrive across files, and in
/// write order within a file. A file replaced at its path (log rotation)
/// is picked up from the start of the replacement; a file that shrinks in
/// place is re-read from its start. Only complete, newline-terminated
/// lines are ever emitted.
#[derive(Debug)]
pub struct TailMux {
    events: EventMux,
    files: HashMap<PathBuf, TailedFile>,
    pending: VecDeque<Line>,
}

impl TailMux {
    /// Constructs a new `TailMux` with no files registered.
    pub fn new() -> Result<Self> {
        Ok(TailMux {
            events: EventMux::new()?,
            files: HashMap::new(),
            pending: VecDeque::new(),
        })
    }

    /// Registers a file to be followed. The file must already exist as a
    /// readable regular file.
    ///
    /// Returns the canonicalized version of the path originally supplied,
    /// which is the `source` subsequent [`Line`]s for this file carry.
    /// Registering a path twice is a no-op.
    pub async fn add_file(&mut self, path: impl Into<PathBuf>) -> Result<PathBuf> {
        let path = path.into();
        let path = canonicalize(&path)
            .await
            .map_err(|source| Error::Config {
                path: path.clone(),
                source,
            })?;

        if self.files.contains_key(&path) {
            return Ok(path);
        }

        let md = metadata(&path).await.map_err(|source| Error::Config {
            path: path.clone(),
            source,
        })?;
        if !md.is_file() {
            return Err(Error::Config {
                path,
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            });
        }
        // Surface a permission problem as a registration diagnostic
        // instead of a watch that never produces anything.
        File::open(&path).await.map_err(|source| Error::Config {
            path: path.clone(),
            source,
        })?;

        self.events.watch(&path)?;
        self.files.insert(path.clone(), TailedFile::starting_at_end(&md));

        Ok(path)
    }

    /// Returns the next line captured from any registered file, waiting
    /// indefinitely until one is written. Returns `None` if the event
    /// backend shut down.
    pub async fn next_line(&mut self) -> Result<Option<Line>> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(Some(line));
            }

            let Some(event) = self.events.next_event().await else {
                return Ok(None);
            };

            match event.kind {
                RawEventKind::Modified => self.read_into_pending(&event.path).await,
                RawEventKind::AttributeChanged => {
                    let rotated = match self.files.get_mut(&event.path) {
                        Some(file) => matches!(file.probe(&event.path).await, Freshness::Rotated),
                        None => false,
                    };
                    if !rotated {
                        continue;
                    }

                    debug!(path = %event.path.display(), "rotation detected, refreshing watch");
                    if let Err(err) = self.events.rewatch(&event.path) {
                        warn!(
                            path = %event.path.display(),
                            %err,
                            "could not refresh watch, path will no longer be followed"
                        );
                    }
                    self.read_into_pending(&event.path).await;
                }
                RawEventKind::Other => {}
            }
        }
    }

    async fn read_into_pending(&mut self, path: &Path) {
        let Some(file) = self.files.get_mut(path) else {
            return;
        };

        match file.drain(path).await {
            Ok(lines) => {
                self.pending.extend(lines.into_iter().map(|text| Line {
                    source: path.to_path_buf(),
                    text,
                }));
            }
            Err(err) => {
                trace!(path = %path.display(), %err, "read failed, retrying on next event");
            }
        }
    }
}
