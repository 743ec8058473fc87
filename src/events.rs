//! Everything related to watching paths for modifications, rotations, and
//! other filesystem activity.

use std::collections::{HashSet, VecDeque};
use std::fmt::{self, Debug, Formatter};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task;

use futures_util::stream::Stream as FuturesStream;
use notify::Watcher;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{Error, Result};

/// Coarse classification of a filesystem notification for a watched path.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RawEventKind {
    /// The file's content grew (or was otherwise written).
    Modified,
    /// The file's metadata, name, or existence changed. This is the class
    /// of event a rotation produces, and the cue to re-resolve identity.
    AttributeChanged,
    /// Anything else (access notifications and the like); never acted on.
    Other,
}

impl RawEventKind {
    fn classify(kind: &notify::EventKind) -> Self {
        use notify::event::ModifyKind;

        match kind {
            // Some backends report plain writes as `Modify(Any)`.
            notify::EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => {
                RawEventKind::Modified
            }
            notify::EventKind::Modify(ModifyKind::Metadata(_) | ModifyKind::Name(_)) => {
                RawEventKind::AttributeChanged
            }
            notify::EventKind::Create(_) | notify::EventKind::Remove(_) => {
                RawEventKind::AttributeChanged
            }
            _ => RawEventKind::Other,
        }
    }
}

/// A single filesystem notification for one watched path.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RawEvent {
    pub path: PathBuf,
    pub kind: RawEventKind,
}

/// Manages filesystem watches over a set of paths, and can be polled to
/// receive their events as a single fanned-in sequence.
///
/// Internally, `EventMux` owns a [`notify::RecommendedWatcher`] whose
/// callback forwards into a channel. Events carrying several paths are
/// flattened to one [`RawEvent`] per path, and events for paths that were
/// never registered are dropped.
///
/// [`notify::RecommendedWatcher`]: https://docs.rs/notify/6/notify/type.RecommendedWatcher.html
pub struct EventMux {
    inner: notify::RecommendedWatcher,
    /// Paths with an active watch registration.
    watched: HashSet<PathBuf>,
    /// Flattened events not yet handed to the caller.
    queue: VecDeque<RawEvent>,
    event_stream: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
}

impl Debug for EventMux {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("EventMux")
            .field("watched", &self.watched)
            .field("queue", &self.queue)
            .finish()
    }
}

impl EventMux {
    /// Constructs a new `EventMux` with no paths registered.
    pub fn new() -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = notify::recommended_watcher(move |res| {
            // Send only fails once the receiver is gone, i.e. the mux is
            // already being torn down.
            let _ = tx.send(res);
        })
        .map_err(Error::Init)?;

        Ok(EventMux {
            inner,
            watched: HashSet::new(),
            queue: VecDeque::new(),
            event_stream: rx,
        })
    }

    /// Registers a watch for `path`. Events for it will be delivered from
    /// [`next_event`](EventMux::next_event) until it is unwatched.
    pub fn watch(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        self.inner
            .watch(path, notify::RecursiveMode::NonRecursive)
            .map_err(|source| Error::Watch {
                path: path.to_path_buf(),
                source,
            })?;
        self.watched.insert(path.to_path_buf());

        Ok(())
    }

    /// Re-establishes the watch for an already-registered `path`.
    ///
    /// Needed after rotation: inode-bound backends keep following the file
    /// that was moved away, so the registration must be dropped and made
    /// again against whatever now lives at `path`.
    pub fn rewatch(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        match self.inner.unwatch(path) {
            Ok(()) => {}
            // The replaced inode may already be gone, taking its watch
            // with it.
            Err(err) if matches!(err.kind, notify::ErrorKind::WatchNotFound) => {}
            Err(source) => {
                return Err(Error::Watch {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        self.inner
            .watch(path, notify::RecursiveMode::NonRecursive)
            .map_err(|source| Error::Watch {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Removes the watch for `path`; pending queued events for it are
    /// dropped as well.
    pub fn unwatch(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if !self.watched.remove(path) {
            return Ok(());
        }
        self.queue.retain(|event| event.path != path);

        match self.inner.unwatch(path) {
            Ok(()) => Ok(()),
            Err(err) if matches!(err.kind, notify::ErrorKind::WatchNotFound) => Ok(()),
            Err(source) => Err(Error::Watch {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Returns the next event for any watched path, waiting indefinitely
    /// until one arrives. Returns `None` if the backend shut down.
    pub async fn next_event(&mut self) -> Option<RawEvent> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(event);
            }

            let res = self.event_stream.recv().await?;
            self.ingest(res);
        }
    }

    fn ingest(&mut self, res: notify::Result<notify::Event>) {
        match res {
            Ok(event) => {
                let kind = RawEventKind::classify(&event.kind);
                for path in event.paths {
                    if !self.watched.contains(&path) {
                        continue;
                    }
                    self.queue.push_back(RawEvent { path, kind });
                }
            }
            // Includes backend queue overflow; delivery is best-effort.
            Err(err) => warn!(%err, "filesystem watcher error, events may have been lost"),
        }
    }
}

impl FuturesStream for EventMux {
    type Item = RawEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return task::Poll::Ready(Some(event));
            }

            match futures_util::ready!(self.event_stream.poll_recv(cx)) {
                Some(res) => self.ingest(res),
                None => return task::Poll::Ready(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::stream::StreamExt;
    use tempfile::tempdir;

    use super::{EventMux, RawEventKind};

    fn classify(kind: notify::EventKind) -> RawEventKind {
        RawEventKind::classify(&kind)
    }

    #[test]
    fn test_classify_kinds() {
        use notify::event::{
            CreateKind, DataChange, MetadataKind, ModifyKind, RemoveKind, RenameMode,
        };
        use notify::EventKind;

        assert_eq!(
            classify(EventKind::Modify(ModifyKind::Data(DataChange::Any))),
            RawEventKind::Modified
        );
        assert_eq!(
            classify(EventKind::Modify(ModifyKind::Any)),
            RawEventKind::Modified
        );
        assert_eq!(
            classify(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))),
            RawEventKind::AttributeChanged
        );
        assert_eq!(
            classify(EventKind::Modify(ModifyKind::Name(RenameMode::Any))),
            RawEventKind::AttributeChanged
        );
        assert_eq!(
            classify(EventKind::Create(CreateKind::File)),
            RawEventKind::AttributeChanged
        );
        assert_eq!(
            classify(EventKind::Remove(RemoveKind::File)),
            RawEventKind::AttributeChanged
        );
        assert_eq!(
            classify(EventKind::Access(notify::event::AccessKind::Any)),
            RawEventKind::Other
        );
    }

    #[test]
    fn test_unwatch_is_idempotent() {
        let tmp_dir = tempdir().expect("failed to create tempdir");
        let path = tmp_dir.path().join("a.log");
        std::fs::write(&path, b"").unwrap();

        let mut events = EventMux::new().unwrap();
        events.watch(&path).unwrap();
        events.unwatch(&path).unwrap();
        // A second unwatch, or one for a path never registered, is a no-op.
        events.unwatch(&path).unwrap();
        events.unwatch(tmp_dir.path().join("never-registered")).unwrap();
    }

    #[test]
    fn test_watch_missing_path() {
        let tmp_dir = tempdir().expect("failed to create tempdir");

        let mut events = EventMux::new().unwrap();
        assert!(events.watch(tmp_dir.path().join("no-such-file")).is_err());
    }

    #[tokio::test]
    async fn test_unwatched_paths_ignored() {
        let tmp_dir = tempdir().expect("failed to create tempdir");
        let watched = tmp_dir.path().join("watched.log");
        let ignored = tmp_dir.path().join("ignored.log");
        std::fs::write(&watched, b"").unwrap();
        std::fs::write(&ignored, b"").unwrap();

        let mut events = EventMux::new().unwrap();
        events.watch(&watched).unwrap();

        std::fs::write(&ignored, b"noise\n").unwrap();
        std::fs::write(&watched, b"signal\n").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("no event for watched path")
            .expect("event stream ended");
        assert_eq!(event.path, watched);

        drop(events);
    }
}
