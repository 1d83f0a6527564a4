//! Filesystem watching over the native OS event sources, with a
//! portable fallback.
//!
//! A [`Watch`] monitors a root path, either a directory tree or a
//! single file, and streams [`Event`]s to a callback from a worker
//! thread. The event source is chosen per platform: `fanotify` on
//! recent Linux kernels when running as root, `inotify` elsewhere on
//! Linux and on Android, `FSEvents` on macOS and iOS,
//! `ReadDirectoryChangesW` on Windows, and a periodic tree scan
//! anywhere else (or wherever the `force-scan` feature asks for it).
//!
//! The first event a handler sees is always the `s/self/live@<root>`
//! status; the last is exactly one `{s,e}/self/die@<root>`. In
//! between, real filesystem events carry absolute paths, and watcher
//! diagnostics arrive as events with [`PathType::Watcher`].
//!
//! ```no_run
//! use pathwatch::{Event, Watch};
//!
//! let watcher = Watch::open("/tmp", |ev: Event| println!("{ev}"));
//! // ... do other work ...
//! let clean = watcher.close();
//! assert!(clean);
//! ```

mod adapter;
pub mod event;
mod living;
mod watch;

pub use crate::event::{EffectType, Event, PathType};
pub use crate::watch::{EventHandler, Watch};
