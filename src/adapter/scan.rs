//! The scan adapter: a periodic full-tree sweep for hosts without a
//! native event source, or for builds that force it with the
//! `force-scan` feature.
//!
//! A reasonably dumb adapter that works on any platform. Each sweep
//! walks the tree and diffs every regular file's last-write-time
//! against the bucket from the previous sweep; whatever fell out of
//! the tree since then is reported destroyed.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use filetime::FileTime;
use walkdir::WalkDir;

use crate::adapter::{die_event, status_event};
use crate::event::{EffectType, Event, PathType};
use crate::living::Living;
use crate::watch::EventHandler;

const DELAY: Duration = Duration::from_millis(16);

struct Seen {
    mtime: FileTime,
    /// Remembered so a later destroy can still name what it was.
    path_type: PathType,
    /// The sweep that last saw this path.
    generation: u64,
}

type Bucket = HashMap<PathBuf, Seen>;

/// Walks the tree once, updating the bucket and reporting changes.
/// The first sweep (`populate`) fills the bucket without reporting, so
/// pre-existing files don't read as freshly created.
fn sweep(
    root: &Path,
    bucket: &mut Bucket,
    generation: u64,
    populate: bool,
    handler: &mut dyn EventHandler,
) -> io::Result<()> {
    let walk = WalkDir::new(root).follow_links(true);
    for entry in walk {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err)
                if err
                    .io_error()
                    .map(|io_err| io_err.kind() == io::ErrorKind::PermissionDenied)
                    .unwrap_or(false) =>
            {
                continue
            }
            Err(err) => return Err(err.into()),
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            // Changed underneath the walk; the prune pass settles it.
            Err(_) => continue,
        };
        let mtime = FileTime::from_last_modification_time(&meta);
        let path_type = if entry.path_is_symlink() {
            PathType::SymLink
        } else {
            PathType::File
        };

        match bucket.get_mut(entry.path()) {
            None => {
                bucket.insert(
                    entry.path().to_path_buf(),
                    Seen {
                        mtime,
                        path_type,
                        generation,
                    },
                );
                if !populate {
                    handler.handle_event(Event::new(
                        entry.path(),
                        EffectType::Create,
                        path_type,
                    ));
                }
            }
            Some(seen) => {
                if seen.mtime != mtime {
                    seen.mtime = mtime;
                    handler.handle_event(Event::new(
                        entry.path(),
                        EffectType::Modify,
                        path_type,
                    ));
                }
                seen.generation = generation;
            }
        }
    }

    // Prune: whatever this sweep didn't see no longer exists.
    bucket.retain(|path, seen| {
        if seen.generation == generation {
            true
        } else {
            handler.handle_event(Event::new(
                path.clone(),
                EffectType::Destroy,
                seen.path_type,
            ));
            false
        }
    });

    Ok(())
}

/// Monitors `root` for changes. Invokes `handler` with an event when
/// they happen. Stops when asked to or when the tree cannot be
/// scanned. All events, including errors, go through `handler`.
pub(crate) fn watch(
    root: &Path,
    handler: &mut dyn EventHandler,
    living: &Living,
) -> bool {
    let mut bucket = Bucket::new();
    let mut generation = 0u64;
    let mut populate = true;

    while living.is_living() {
        generation += 1;
        if let Err(err) = sweep(root, &mut bucket, generation, populate, handler) {
            handler.handle_event(status_event(format!(
                "e/self/sys_resource({err})@{}",
                root.display()
            )));
            handler.handle_event(die_event(root, false));
            return false;
        }
        populate = false;
        thread::sleep(DELAY);
    }

    handler.handle_event(die_event(root, true));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::mpsc;

    fn run_sweep(
        root: &Path,
        bucket: &mut Bucket,
        generation: u64,
        populate: bool,
    ) -> Vec<Event> {
        let (tx, rx) = mpsc::channel();
        let mut handler: Box<dyn EventHandler> = Box::new(tx);
        sweep(root, bucket, generation, populate, &mut *handler).expect("sweep");
        drop(handler);
        rx.iter().collect()
    }

    #[test]
    fn first_sweep_is_silent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("pre.txt"), b"before").expect("write");

        let mut bucket = Bucket::new();
        let events = run_sweep(tmp.path(), &mut bucket, 1, true);
        assert!(events.is_empty());
        assert_eq!(bucket.len(), 1);
    }

    #[test]
    fn reports_create_modify_destroy() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("a.txt");
        let mut bucket = Bucket::new();
        run_sweep(tmp.path(), &mut bucket, 1, true);

        fs::write(&file, b"hello").expect("write");
        let events = run_sweep(tmp.path(), &mut bucket, 2, false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].effect_type, EffectType::Create);
        assert_eq!(events[0].path_type, PathType::File);
        assert_eq!(events[0].path_name, file);

        // A deterministic "modification": bump the write time.
        filetime::set_file_mtime(&file, FileTime::from_unix_time(1_700_000_000, 0))
            .expect("set mtime");
        let events = run_sweep(tmp.path(), &mut bucket, 3, false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].effect_type, EffectType::Modify);

        fs::remove_file(&file).expect("remove");
        let events = run_sweep(tmp.path(), &mut bucket, 4, false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].effect_type, EffectType::Destroy);
        assert_eq!(events[0].path_name, file);
        assert!(bucket.is_empty());
    }

    #[test]
    fn a_single_file_root_works() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("only.txt");
        fs::write(&file, b"x").expect("write");

        let mut bucket = Bucket::new();
        run_sweep(&file, &mut bucket, 1, true);
        assert_eq!(bucket.len(), 1);

        filetime::set_file_mtime(&file, FileTime::from_unix_time(1_700_000_000, 0))
            .expect("set mtime");
        let events = run_sweep(&file, &mut bucket, 2, false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].effect_type, EffectType::Modify);
    }

    #[test]
    fn a_missing_root_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let gone = tmp.path().join("never");
        let (tx, rx) = mpsc::channel();
        let mut handler: Box<dyn EventHandler> = Box::new(tx);
        let mut bucket = Bucket::new();
        assert!(sweep(&gone, &mut bucket, 1, true, &mut *handler).is_err());
        drop(handler);
        assert_eq!(rx.iter().count(), 0);
    }
}
