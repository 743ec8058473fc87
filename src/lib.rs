//! Multiplexed `tail -F` for a set of (namely log) files.
//!
//! Registered files are followed for appends across log rotation: a file
//! replaced at its path is picked up from the start of the replacement,
//! and only complete, newline-terminated lines are emitted, tagged with
//! the path they came from. The underlying per-path event stream (driven
//! by [`notify`](https://crates.io/crates/notify)) is also available.
//!
//! ## Example
//!
//! ```no_run
//! use tailmux::TailMux;
//!
//! #[tokio::main]
//! async fn main() -> tailmux::Result<()> {
//!     let mut mux = TailMux::new()?;
//!
//!     // Register some existing files to be followed.
//!     mux.add_file("some/file.log").await?;
//!     mux.add_file("/some/other/file.log").await?;
//!
//!     // Wait for `Line` events, each carrying one line captured for a
//!     // given source path.
//!     while let Some(line) = mux.next_line().await? {
//!         println!("source: {}, line: {}", line.source().display(), line.text());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Caveats
//!
//! A file whose content is overwritten in place without changing its size
//! or identity is not detected; only growth, shrink, and replacement are.
//! Delivery under filesystem-event-queue overflow is best-effort.

mod error;
mod events;
mod reader;

pub use error::{Error, Result};
pub use events::{EventMux, RawEvent, RawEventKind};
pub use reader::{Line, TailMux};

#[cfg(doctest)]
doc_comment::doctest!("../README.md");
