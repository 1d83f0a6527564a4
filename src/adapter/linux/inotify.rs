//! The Linux `inotify` adapter, for unprivileged processes and for
//! Android.
//!
//! Every directory in the watched tree gets its own watch descriptor,
//! and a `wd -> path` map composes full event paths. The map has to be
//! kept consistent with kernel state while the tree mutates under us:
//! new directories are added to it as their create events arrive, and
//! destroyed directories fall out of it.
//!
//! For more documentation, please read
//! [inotify(7)](https://man7.org/linux/man-pages/man7/inotify.7.html).

use std::collections::HashMap;
use std::ffi::{CStr, CString, OsStr};
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use crate::adapter::{die_event, status_event};
use crate::adapter::linux::sysres::{
    cvt, mark_tree, read_struct, Epoll, WAIT_QUEUE_MAX, WAKE_MS,
};
use crate::event::{EffectType, Event, PathType};
use crate::living::Living;
use crate::watch::EventHandler;

/// 4096 is a typical page size and holds a great many events.
const EVENT_BUF_LEN: usize = 4096;

const INO_LEN: usize = mem::size_of::<libc::inotify_event>();

/// Everything we can get, minus what we don't report.
const WATCH_MASK: u32 = libc::IN_CREATE
    | libc::IN_MODIFY
    | libc::IN_DELETE
    | libc::IN_MOVED_FROM
    | libc::IN_Q_OVERFLOW;

#[repr(align(4))]
struct EventBuf([u8; EVENT_BUF_LEN]);

struct Sysres {
    ino: OwnedFd,
    epoll: Epoll,
    /// Watch descriptor -> directory path (or the root itself when the
    /// root is a plain file).
    watches: HashMap<libc::c_int, PathBuf>,
    root_wd: libc::c_int,
}

enum Recv {
    Continue,
    /// The root's own watch went away: the root was deleted or the
    /// filesystem under it unmounted.
    RootGone,
    Fatal(String),
}

#[cfg(linux)]
fn init_fd() -> io::Result<OwnedFd> {
    let fd = cvt(unsafe { libc::inotify_init1(libc::IN_NONBLOCK) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Android's libc predates `inotify_init1` in places, so take the
/// plain init and flip the fd to non-blocking after the fact.
#[cfg(android)]
fn init_fd() -> io::Result<OwnedFd> {
    let fd = cvt(unsafe { libc::inotify_init() })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn add_watch(ino: &OwnedFd, path: &Path) -> io::Result<libc::c_int> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    cvt(unsafe {
        libc::inotify_add_watch(ino.as_raw_fd(), c_path.as_ptr(), WATCH_MASK)
    })
}

fn unfold(
    root: &Path,
    handler: &mut dyn EventHandler,
    living: &Living,
) -> Option<Sysres> {
    let ino = match init_fd() {
        Ok(fd) => fd,
        Err(err) => {
            handler.handle_event(status_event(format!(
                "e/sys/inotify_init({err})@{}",
                root.display()
            )));
            return None;
        }
    };

    let mut watches = HashMap::new();
    let mut root_wd = -1;
    let mapped = mark_tree(root, handler, |path| {
        let wd = add_watch(&ino, path)?;
        if path == root {
            root_wd = wd;
        }
        watches.insert(wd, path.to_path_buf());
        Ok(())
    });
    if let Err(err) = mapped {
        handler.handle_event(status_event(format!(
            "e/self/path_map({err})@{}",
            root.display()
        )));
        return None;
    }

    let epoll = match Epoll::new() {
        Ok(epoll) => epoll,
        Err(err) => {
            handler.handle_event(status_event(format!(
                "e/sys/epoll_create({err})@{}",
                root.display()
            )));
            return None;
        }
    };
    let mut watched = epoll.add(ino.as_raw_fd());
    if watched.is_ok() {
        if let Some(wake_fd) = living.wake_fd() {
            watched = epoll.add(wake_fd);
        }
    }
    if let Err(err) = watched {
        handler.handle_event(status_event(format!(
            "e/sys/epoll_ctl({err})@{}",
            root.display()
        )));
        return None;
    }

    Some(Sysres {
        ino,
        epoll,
        watches,
        root_wd,
    })
}

/// Walks the variable-length records in a filled event buffer. `f`
/// gets each record's watch descriptor, mask and (possibly empty)
/// name. Returns `false` when the buffer is malformed.
fn each_record<F>(buf: &[u8], read_len: usize, mut f: F) -> bool
where
    F: FnMut(libc::c_int, u32, &[u8]),
{
    let mut offset = 0;
    while offset + INO_LEN <= read_len {
        let record: libc::inotify_event = unsafe { read_struct(buf, offset) };
        let name_end = offset + INO_LEN + record.len as usize;
        if name_end > read_len {
            return false;
        }
        let name = match CStr::from_bytes_until_nul(&buf[offset + INO_LEN..name_end]) {
            Ok(name) => name.to_bytes(),
            // A name field with no terminator only happens at len 0.
            Err(_) => &[],
        };
        f(record.wd, record.mask, name);
        offset = name_end;
    }
    offset == read_len
}

fn handle_record(
    sr: &mut Sysres,
    wd: libc::c_int,
    mask: u32,
    name: &[u8],
    root: &Path,
    handler: &mut dyn EventHandler,
) -> Option<Recv> {
    if mask & libc::IN_Q_OVERFLOW != 0 {
        handler.handle_event(status_event(format!(
            "w/self/overflow@{}",
            root.display()
        )));
        return None;
    }
    if mask & libc::IN_IGNORED != 0 {
        if wd == sr.root_wd {
            return Some(Recv::RootGone);
        }
        sr.watches.remove(&wd);
        return None;
    }

    let dir = match sr.watches.get(&wd) {
        Some(dir) => dir,
        // A straggler from a watch we already removed.
        None => return None,
    };
    let path = if name.is_empty() {
        dir.clone()
    } else {
        dir.join(OsStr::from_bytes(name))
    };

    let path_type = if mask & libc::IN_ISDIR != 0 {
        PathType::Dir
    } else {
        PathType::File
    };
    let effect_type = if mask & libc::IN_CREATE != 0 {
        EffectType::Create
    } else if mask & libc::IN_DELETE != 0 {
        EffectType::Destroy
    } else if mask & libc::IN_MOVE != 0 {
        EffectType::Rename
    } else if mask & libc::IN_MODIFY != 0 {
        EffectType::Modify
    } else {
        EffectType::Other
    };

    handler.handle_event(Event::new(path.clone(), effect_type, path_type));

    if path_type == PathType::Dir {
        if effect_type == EffectType::Create {
            match add_watch(&sr.ino, &path) {
                Ok(new_wd) => {
                    sr.watches.insert(new_wd, path);
                }
                Err(err) => {
                    log::warn!("could not watch {}: {err}", path.display());
                    handler.handle_event(status_event(format!(
                        "w/sys/not_watched@{}@{}",
                        root.display(),
                        path.display()
                    )));
                }
            }
        } else if effect_type == EffectType::Destroy {
            if let Some(gone_wd) = sr
                .watches
                .iter()
                .find(|(_, watched)| **watched == path)
                .map(|(wd, _)| *wd)
            {
                // The kernel already dropped the watch with the
                // directory; this keeps our side consistent.
                let _ = unsafe {
                    libc::inotify_rm_watch(sr.ino.as_raw_fd(), gone_wd)
                };
                sr.watches.remove(&gone_wd);
            }
        }
    }

    None
}

/// Reads the inotify fd dry. There might be several events from a
/// single read, and several reads queued behind one epoll wake.
fn recv(sr: &mut Sysres, root: &Path, handler: &mut dyn EventHandler) -> Recv {
    loop {
        let mut buf = EventBuf([0; EVENT_BUF_LEN]);
        let read_len = unsafe {
            libc::read(
                sr.ino.as_raw_fd(),
                buf.0.as_mut_ptr() as *mut libc::c_void,
                EVENT_BUF_LEN,
            )
        };
        if read_len < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) => Recv::Continue,
                Some(libc::EINTR) => continue,
                _ => Recv::Fatal(format!("e/sys/read({err})@{}", root.display())),
            };
        }
        if read_len == 0 {
            return Recv::Continue;
        }

        let mut out = None;
        let well_formed = each_record(&buf.0, read_len as usize, |wd, mask, name| {
            if out.is_none() {
                out = handle_record(sr, wd, mask, name, root, handler);
            }
        });
        if let Some(recv) = out {
            return recv;
        }
        if !well_formed {
            return Recv::Fatal(format!("e/self/event_recv@{}", root.display()));
        }
    }
}

/// Monitors `root` for changes. Invokes `handler` with an event when
/// they happen. Stops when asked to or when unrecoverable errors
/// occur. All events, including errors, go through `handler`.
pub(crate) fn watch(
    root: &Path,
    handler: &mut dyn EventHandler,
    living: &Living,
) -> bool {
    let mut sr = match unfold(root, handler, living) {
        Some(sr) => sr,
        None => {
            handler.handle_event(status_event(format!(
                "e/self/sys_resource@{}",
                root.display()
            )));
            handler.handle_event(die_event(root, false));
            return false;
        }
    };

    let mut waits = [libc::epoll_event { events: 0, u64: 0 }; WAIT_QUEUE_MAX];
    let ino_fd = sr.ino.as_raw_fd() as u64;

    while living.is_living() {
        let count = match sr.epoll.wait(&mut waits, WAKE_MS) {
            Ok(count) => count,
            Err(err) => {
                handler.handle_event(status_event(format!(
                    "e/sys/epoll_wait({err})@{}",
                    root.display()
                )));
                handler.handle_event(die_event(root, false));
                return false;
            }
        };
        if !living.is_living() {
            break;
        }
        for wait in &waits[..count] {
            if wait.u64 != ino_fd {
                continue;
            }
            match recv(&mut sr, root, handler) {
                Recv::Continue => {}
                Recv::RootGone => {
                    handler.handle_event(die_event(root, false));
                    return false;
                }
                Recv::Fatal(msg) => {
                    handler.handle_event(status_event(msg));
                    handler.handle_event(die_event(root, false));
                    return false;
                }
            }
        }
    }

    drop(sr);
    handler.handle_event(die_event(root, true));
    true
}
