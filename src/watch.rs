//! The user-facing watch handle and the lifetime protocol around the
//! platform adapters.
//!
//! [`Watch::open`] spawns one worker thread and returns immediately.
//! The worker announces itself with a `s/self/live@<root>` status event,
//! runs the selected adapter's event loop, and ends with exactly one
//! `{s,e}/self/die@<root>` status event on every exit path. All events
//! are delivered on the worker thread, strictly in sequence.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::adapter;
use crate::event::{EffectType, Event, PathType};
use crate::living::Living;

/// Receives events on the watcher's worker thread.
///
/// Implemented for closures and for [`std::sync::mpsc::Sender`], so
/// both of these work:
///
/// ```no_run
/// use pathwatch::{Event, Watch};
///
/// let printer = Watch::open(".", |ev: Event| println!("{ev}"));
///
/// let (tx, rx) = std::sync::mpsc::channel();
/// let feeder = Watch::open(".", tx);
/// # drop((printer, feeder, rx));
/// ```
pub trait EventHandler: Send + 'static {
    fn handle_event(&mut self, event: Event);
}

impl<F> EventHandler for F
where
    F: FnMut(Event) + Send + 'static,
{
    fn handle_event(&mut self, event: Event) {
        self(event)
    }
}

impl EventHandler for std::sync::mpsc::Sender<Event> {
    fn handle_event(&mut self, event: Event) {
        // A hung-up receiver is not the watcher's problem.
        let _ = self.send(event);
    }
}

/// An asynchronous filesystem watcher.
///
/// Begins watching when constructed. Stops when [`close`](Watch::close)
/// is called or the handle is dropped. Closing is the only blocking
/// operation: it waits for the worker to notice the request, tear its
/// resources down and exit, which takes at most one timeout tick
/// (~16 ms) plus the time to drain any in-flight batch.
#[derive(Debug)]
pub struct Watch {
    living: Arc<Living>,
    worker: Mutex<Option<JoinHandle<bool>>>,
}

impl Watch {
    /// Begins watching `path`, which may name a directory (watched
    /// recursively, including directories created later) or a single
    /// file. Returns immediately; the events stream to `handler` from
    /// a dedicated worker thread.
    ///
    /// A root that cannot be watched is reported through the handler
    /// as an `e/self/sys_resource@<root>` status event followed by the
    /// terminal `e/self/die@<root>`, and [`close`](Watch::close)
    /// returns `false` for that lifetime.
    pub fn open<P, H>(path: P, handler: H) -> Watch
    where
        P: AsRef<Path>,
        H: EventHandler,
    {
        let root = canonical_root(path.as_ref());
        let living = Arc::new(Living::new());
        let worker_living = Arc::clone(&living);
        let mut handler = handler;

        let worker = thread::Builder::new()
            .name("pathwatch".into())
            .spawn(move || {
                handler.handle_event(Event::new(
                    format!("s/self/live@{}", root.display()),
                    EffectType::Create,
                    PathType::Watcher,
                ));
                adapter::watch(&root, &mut handler, &worker_living)
            });

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(err) => {
                log::error!("failed to spawn watcher thread: {err}");
                None
            }
        };

        Watch {
            living,
            worker: Mutex::new(worker),
        }
    }

    /// Stops watching and waits for the worker to exit.
    ///
    /// Returns the worker's terminal success flag: `true` for a clean
    /// shutdown, `false` if the watcher died on an error. A second (or
    /// concurrent) close returns `false` without joining again. After
    /// `close` returns, the handler is never invoked again.
    pub fn close(&self) -> bool {
        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        match worker {
            Some(handle) => {
                self.living.end();
                handle.join().unwrap_or(false)
            }
            None => false,
        }
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.close();
    }
}

/// Adapters compose event paths by joining entry names onto the root,
/// so resolve it up front. A root that does not exist is passed through
/// as given; the adapter reports the failure.
fn canonical_root(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}
