//! The Linux `fanotify` adapter.
//!
//! Needs a kernel at or above 5.9 (for `FAN_REPORT_DFID_NAME`) and an
//! effectively-root process (for unlimited marks). In exchange it
//! reports directory-entry events by file handle, which survive
//! renames of the containing directory and let us keep a cheap
//! handle-hash → path cache instead of one watch descriptor per
//! directory.
//!
//! For more documentation, please read
//! [fanotify(7)](https://man7.org/linux/man-pages/man7/fanotify.7.html).

use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use crate::adapter::{die_event, status_event};
use crate::adapter::linux::sysres::{
    cvt, mark_tree, read_struct, Epoll, WAIT_QUEUE_MAX, WAKE_MS,
};
use crate::event::{EffectType, Event, PathType};
use crate::living::Living;
use crate::watch::EventHandler;

mod ffi {
    use libc::{c_char, c_int, c_void};

    extern "C" {
        pub fn open_by_handle_at(
            mount_fd: c_int,
            handle: *mut c_void,
            flags: c_int,
        ) -> c_int;
        pub fn name_to_handle_at(
            dirfd: c_int,
            pathname: *const c_char,
            handle: *mut c_void,
            mount_id: *mut c_int,
            flags: c_int,
        ) -> c_int;
    }
}

/// One page is sufficiently large to hold a great many events, even
/// with the variably sized name strings in them.
const EVENT_BUF_LEN: usize = 4096;

/// Post-event reporting by directory handle and name, with the queue
/// and mark limits lifted. The limits are why we need root.
const INIT_FLAGS: libc::c_uint = libc::FAN_CLASS_NOTIF
    | libc::FAN_REPORT_DFID_NAME
    | libc::FAN_UNLIMITED_QUEUE
    | libc::FAN_UNLIMITED_MARKS;

const INIT_EVENT_FLAGS: libc::c_uint =
    (libc::O_RDONLY | libc::O_NONBLOCK | libc::O_CLOEXEC) as libc::c_uint;

/// Everything we subscribe to, on every mark.
const MARK_MASK: u64 = libc::FAN_ONDIR
    | libc::FAN_CREATE
    | libc::FAN_MODIFY
    | libc::FAN_DELETE
    | libc::FAN_MOVE
    | libc::FAN_DELETE_SELF
    | libc::FAN_MOVE_SELF;

const META_LEN: usize = mem::size_of::<libc::fanotify_event_metadata>();
const INFO_HDR_LEN: usize = mem::size_of::<libc::fanotify_event_info_header>();
const INFO_FID_LEN: usize = mem::size_of::<libc::fanotify_event_info_fid>();

/// `struct file_handle` leads with `handle_bytes: u32` and
/// `handle_type: i32`; the opaque handle bytes follow.
const FILE_HANDLE_HDR_LEN: usize = 8;

bitflags::bitflags! {
    /// Mask bits tested on incoming event metadata.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct Mask: u64 {
        const CREATE = libc::FAN_CREATE;
        const MODIFY = libc::FAN_MODIFY;
        const DELETE = libc::FAN_DELETE;
        const MOVE = libc::FAN_MOVE;
        const DELETE_SELF = libc::FAN_DELETE_SELF;
        const MOVE_SELF = libc::FAN_MOVE_SELF;
        const ONDIR = libc::FAN_ONDIR;
        const Q_OVERFLOW = libc::FAN_Q_OVERFLOW;
    }
}

#[repr(align(8))]
struct EventBuf([u8; EVENT_BUF_LEN]);

struct Sysres {
    fan: OwnedFd,
    epoll: Epoll,
    /// Paths we hold a mark on. `fanotify_mark` hands back no
    /// descriptor, so the paths themselves are the bookkeeping.
    marks: HashSet<PathBuf>,
    /// Directory-handle hash -> directory path. Purely a cache: a miss
    /// is resolved through `open_by_handle_at`, a stale entry is purged
    /// when the directory is destroyed.
    dir_map: HashMap<u64, PathBuf>,
    /// The root's own handle hash, for telling a deleted root apart
    /// from a deleted subdirectory.
    root_hash: Option<u64>,
}

enum Recv {
    Continue,
    /// The root itself was deleted or moved away.
    RootGone,
    /// Carries the status message to deliver before dying.
    Fatal(String),
}

/// The sum of the handle's bytes. A low-quality hash, but it only
/// serves as a local cache key and a miss falls back to resolving the
/// handle itself.
fn dir_hash(handle_type: i32, handle: &[u8]) -> u64 {
    handle
        .iter()
        .fold(handle_type.unsigned_abs() as u64, |hash, byte| {
            hash + *byte as u64
        })
}

/// The variable-length fid record trailing an event's metadata:
/// an info header, an fsid, a `struct file_handle`, and (for
/// `FAN_EVENT_INFO_TYPE_DFID_NAME`) the entry name.
struct FidInfo {
    hash: u64,
    handle_offset: usize,
    name_offset: usize,
    info_end: usize,
}

fn parse_fid(buf: &[u8], info_offset: usize) -> Option<FidInfo> {
    if info_offset + INFO_HDR_LEN > buf.len() {
        return None;
    }
    let hdr: libc::fanotify_event_info_header =
        unsafe { read_struct(buf, info_offset) };
    let info_end = info_offset + hdr.len as usize;
    let handle_offset = info_offset + INFO_FID_LEN;
    if info_end > buf.len() || handle_offset + FILE_HANDLE_HDR_LEN > info_end {
        return None;
    }
    let handle_bytes: u32 = unsafe { read_struct(buf, handle_offset) };
    let handle_type: i32 = unsafe { read_struct(buf, handle_offset + 4) };
    let name_offset = handle_offset + FILE_HANDLE_HDR_LEN + handle_bytes as usize;
    if name_offset > info_end {
        return None;
    }
    let hash = dir_hash(
        handle_type,
        &buf[handle_offset + FILE_HANDLE_HDR_LEN..name_offset],
    );
    Some(FidInfo {
        hash,
        handle_offset,
        name_offset,
        info_end,
    })
}

/// The entry name after the file handle. The kernel null-terminates
/// it; `"."` means the event hit the directory itself.
fn entry_name(buf: &[u8], info: &FidInfo) -> Option<Vec<u8>> {
    let raw = CStr::from_bytes_until_nul(&buf[info.name_offset..info.info_end])
        .ok()?
        .to_bytes();
    if raw.is_empty() || raw == b"." {
        None
    } else {
        Some(raw.to_vec())
    }
}

fn cpath(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn mark(fan: &OwnedFd, path: &Path) -> io::Result<()> {
    let path = cpath(path)?;
    cvt(unsafe {
        libc::fanotify_mark(
            fan.as_raw_fd(),
            libc::FAN_MARK_ADD,
            MARK_MASK,
            libc::AT_FDCWD,
            path.as_ptr(),
        )
    })?;
    Ok(())
}

fn unmark(fan: &OwnedFd, path: &Path) -> io::Result<()> {
    let path = cpath(path)?;
    cvt(unsafe {
        libc::fanotify_mark(
            fan.as_raw_fd(),
            libc::FAN_MARK_REMOVE,
            MARK_MASK,
            libc::AT_FDCWD,
            path.as_ptr(),
        )
    })?;
    Ok(())
}

/// Hashes the root's own directory handle, so later `DELETE_SELF`
/// events can be matched against it and so events directly inside the
/// root start out on the cached fast path.
fn root_handle_hash(root: &Path) -> Option<u64> {
    const MAX_HANDLE_SZ: usize = 128;

    #[repr(C)]
    struct HandleBuf {
        handle_bytes: u32,
        handle_type: i32,
        f_handle: [u8; MAX_HANDLE_SZ],
    }

    let path = cpath(root).ok()?;
    let mut handle = HandleBuf {
        handle_bytes: MAX_HANDLE_SZ as u32,
        handle_type: 0,
        f_handle: [0; MAX_HANDLE_SZ],
    };
    let mut mount_id = 0 as libc::c_int;
    let res = unsafe {
        ffi::name_to_handle_at(
            libc::AT_FDCWD,
            path.as_ptr(),
            &mut handle as *mut HandleBuf as *mut libc::c_void,
            &mut mount_id,
            0,
        )
    };
    if res != 0 {
        return None;
    }
    let len = (handle.handle_bytes as usize).min(MAX_HANDLE_SZ);
    Some(dir_hash(handle.handle_type, &handle.f_handle[..len]))
}

/// Opens the directory behind a kernel-provided `struct file_handle`
/// and reads its path back through `/proc/self/fd`.
fn resolve_dir(buf: &[u8], handle_offset: usize) -> Option<PathBuf> {
    let fd = unsafe {
        ffi::open_by_handle_at(
            libc::AT_FDCWD,
            buf.as_ptr().add(handle_offset) as *mut libc::c_void,
            libc::O_RDONLY | libc::O_CLOEXEC | libc::O_PATH | libc::O_NONBLOCK,
        )
    };
    if fd < 0 {
        return None;
    }
    let dir = std::fs::read_link(format!("/proc/self/fd/{fd}")).ok();
    unsafe { libc::close(fd) };
    dir
}

/// Acquires the fanotify group, the recursive mark set and the epoll
/// set. Emits a specific `e/sys/...` status event and returns `None`
/// on failure; emits `w/sys/not_watched` per unmarkable subdirectory
/// and keeps going.
fn unfold(
    root: &Path,
    handler: &mut dyn EventHandler,
    living: &Living,
) -> Option<Sysres> {
    let fan = match cvt(unsafe { libc::fanotify_init(INIT_FLAGS, INIT_EVENT_FLAGS) }) {
        Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
        Err(err) => {
            handler.handle_event(status_event(format!(
                "e/sys/fanotify_init({err})@{}",
                root.display()
            )));
            return None;
        }
    };

    let mut marks = HashSet::new();
    let marked = mark_tree(root, handler, |path| {
        mark(&fan, path)?;
        marks.insert(path.to_path_buf());
        Ok(())
    });
    if let Err(err) = marked {
        handler.handle_event(status_event(format!(
            "e/sys/fanotify_mark({err})@{}",
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
    let mut watched = epoll.add(fan.as_raw_fd());
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

    let root_hash = root_handle_hash(root);
    let mut dir_map = HashMap::new();
    if let Some(hash) = root_hash {
        dir_map.insert(hash, root.to_path_buf());
    }

    Some(Sysres {
        fan,
        epoll,
        marks,
        dir_map,
        root_hash,
    })
}

/// Promotes one `FAN_EVENT_INFO_TYPE_DFID_NAME` record to a full path
/// and sends it to the user, tending the mark set and the handle cache
/// when directories come and go.
fn send(
    sr: &mut Sysres,
    buf: &[u8],
    info_offset: usize,
    mask: Mask,
    root: &Path,
    handler: &mut dyn EventHandler,
) {
    let no_path = |handler: &mut dyn EventHandler| {
        handler.handle_event(status_event(format!(
            "w/self/no_path@{}",
            root.display()
        )));
    };

    let info = match parse_fid(buf, info_offset) {
        Some(info) => info,
        None => return no_path(handler),
    };
    let dir = match sr.dir_map.get(&info.hash) {
        Some(dir) => dir.clone(),
        None => match resolve_dir(buf, info.handle_offset) {
            Some(dir) => {
                sr.dir_map.insert(info.hash, dir.clone());
                dir
            }
            None => return no_path(handler),
        },
    };
    let path = match entry_name(buf, &info) {
        Some(name) => dir.join(PathBuf::from(std::ffi::OsString::from_vec(name))),
        None => dir,
    };

    let effect_type = if mask.contains(Mask::CREATE) {
        EffectType::Create
    } else if mask.contains(Mask::DELETE) {
        EffectType::Destroy
    } else if mask.contains(Mask::MODIFY) {
        EffectType::Modify
    } else if mask.intersects(Mask::MOVE) {
        EffectType::Rename
    } else {
        EffectType::Other
    };
    let path_type = if mask.contains(Mask::ONDIR) {
        PathType::Dir
    } else {
        PathType::File
    };

    if path_type == PathType::Dir {
        if effect_type == EffectType::Create {
            match mark(&sr.fan, &path) {
                Ok(()) => {
                    sr.marks.insert(path.clone());
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
            let _ = unmark(&sr.fan, &path);
            sr.marks.remove(&path);
            sr.dir_map.retain(|_, cached| cached != &path);
        }
    }

    handler.handle_event(Event::new(path, effect_type, path_type));
}

/// `DELETE_SELF`/`MOVE_SELF` arrive as plain `DFID` records (there is
/// no entry name for an inode's own demise). The only one we act on is
/// the root's: that ends the watch.
fn self_gone(sr: &Sysres, buf: &[u8], info_offset: usize, mask: Mask) -> bool {
    if !mask.intersects(Mask::DELETE_SELF | Mask::MOVE_SELF) {
        return false;
    }
    match (parse_fid(buf, info_offset), sr.root_hash) {
        (Some(info), Some(root_hash)) => info.hash == root_hash,
        _ => false,
    }
}

/// Reads one buffer of events and forwards them. Level-triggered epoll
/// re-arms for whatever is left in the queue.
fn recv(sr: &mut Sysres, root: &Path, handler: &mut dyn EventHandler) -> Recv {
    let mut buf = EventBuf([0; EVENT_BUF_LEN]);
    let read_len = unsafe {
        libc::read(
            sr.fan.as_raw_fd(),
            buf.0.as_mut_ptr() as *mut libc::c_void,
            EVENT_BUF_LEN,
        )
    };
    if read_len < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => Recv::Continue,
            _ => Recv::Fatal(format!("e/sys/read({err})@{}", root.display())),
        };
    }

    let read_len = read_len as usize;
    let mut offset = 0;
    while read_len - offset >= META_LEN {
        let meta: libc::fanotify_event_metadata =
            unsafe { read_struct(&buf.0, offset) };
        let event_len = meta.event_len as usize;
        if event_len < META_LEN || offset + event_len > read_len {
            return Recv::Fatal(format!("e/self/event_recv@{}", root.display()));
        }
        if meta.fd != libc::FAN_NOFD {
            return Recv::Fatal(format!("e/sys/wrong_event_fd@{}", root.display()));
        }
        if meta.vers != libc::FANOTIFY_METADATA_VERSION {
            return Recv::Fatal(format!("e/sys/kernel_version@{}", root.display()));
        }
        let mask = Mask::from_bits_truncate(meta.mask);
        if mask.contains(Mask::Q_OVERFLOW) {
            return Recv::Fatal(format!("e/sys/overflow@{}", root.display()));
        }

        if event_len >= META_LEN + INFO_HDR_LEN {
            let info_offset = offset + META_LEN;
            let hdr: libc::fanotify_event_info_header =
                unsafe { read_struct(&buf.0, info_offset) };
            match hdr.info_type {
                libc::FAN_EVENT_INFO_TYPE_DFID_NAME => {
                    send(sr, &buf.0, info_offset, mask, root, handler)
                }
                libc::FAN_EVENT_INFO_TYPE_DFID => {
                    if self_gone(sr, &buf.0, info_offset, mask) {
                        return Recv::RootGone;
                    }
                }
                _ => handler.handle_event(status_event(format!(
                    "w/self/event_info@{}",
                    root.display()
                ))),
            }
        }

        offset += event_len;
    }
    Recv::Continue
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
    let fan_fd = sr.fan.as_raw_fd() as u64;

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
            if wait.u64 != fan_fd {
                continue; // the close-side eventfd; the loop condition handles it
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_type_plus_byte_sum() {
        assert_eq!(dir_hash(0, &[]), 0);
        assert_eq!(dir_hash(-1, &[2, 3]), 6);
        assert_eq!(dir_hash(1, &[0xff, 0xff]), 1 + 255 + 255);
    }

    /// Lays out an info record the way the kernel does: header, fsid,
    /// file handle header, handle bytes, entry name.
    fn fid_record(handle_type: i32, handle: &[u8], name: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        let len = INFO_FID_LEN + FILE_HANDLE_HDR_LEN + handle.len() + name.len() + 1;
        buf.push(libc::FAN_EVENT_INFO_TYPE_DFID_NAME); // info_type
        buf.push(0); // pad
        buf.extend_from_slice(&(len as u16).to_ne_bytes());
        buf.extend_from_slice(&[0u8; 8]); // fsid
        buf.extend_from_slice(&(handle.len() as u32).to_ne_bytes());
        buf.extend_from_slice(&handle_type.to_ne_bytes());
        buf.extend_from_slice(handle);
        buf.extend_from_slice(name);
        buf.push(0);
        buf
    }

    #[test]
    fn parses_a_dfid_name_record() {
        let buf = fid_record(2, &[1, 2, 3, 4], b"a.txt");
        let info = parse_fid(&buf, 0).expect("well-formed record");
        assert_eq!(info.hash, dir_hash(2, &[1, 2, 3, 4]));
        assert_eq!(entry_name(&buf, &info), Some(b"a.txt".to_vec()));
    }

    #[test]
    fn dot_names_mean_the_directory_itself() {
        let buf = fid_record(2, &[1, 2, 3, 4], b".");
        let info = parse_fid(&buf, 0).expect("well-formed record");
        assert_eq!(entry_name(&buf, &info), None);
    }

    #[test]
    fn truncated_records_do_not_parse() {
        let buf = fid_record(2, &[1, 2, 3, 4], b"a.txt");
        assert!(parse_fid(&buf[..8], 0).is_none());
        // A handle length pointing past the record's end.
        let mut bad = fid_record(2, &[1, 2, 3, 4], b"");
        bad[INFO_FID_LEN] = 200;
        assert!(parse_fid(&bad, 0).is_none());
    }
}
