//! The Windows `ReadDirectoryChangesW` adapter.
//!
//! One overlapped directory read at a time, completed through an I/O
//! completion port so the worker can keep checking whether it has been
//! closed. Rename events arrive as separate old-name/new-name records
//! with no documented ordering between them; both halves are held
//! until the pair is complete and then emitted as one event.

use std::ffi::OsString;
use std::io;
use std::mem;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;

use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_IO_PENDING, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
    FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
    FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION,
    FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME,
    FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SECURITY,
    FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION, FILE_SHARE_DELETE,
    FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED,
};

use crate::adapter::{die_event, status_event};
use crate::event::{EffectType, Event, PathType};
use crate::living::Living;
use crate::watch::EventHandler;

/// Timeout for the completion port to wait for events, giving us some
/// room to check if we're still alive.
const DELAY_MS: u32 = 16;

/// The default page size in Windows is 64 KiB.
const EVENT_BUF_LEN: usize = 64 * 1024;

const CHANGE_FILTER: u32 = FILE_NOTIFY_CHANGE_SECURITY
    | FILE_NOTIFY_CHANGE_CREATION
    | FILE_NOTIFY_CHANGE_LAST_WRITE
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_FILE_NAME;

/// `FILE_NOTIFY_INFORMATION` minus its inline first name character.
const NOTIFY_HDR_LEN: usize = 12;

#[repr(align(4))]
struct EventBuf([u8; EVENT_BUF_LEN]);

struct DirWatch {
    dir: HANDLE,
    port: HANDLE,
    // Boxed so their addresses stay put across re-issued reads.
    overlap: Box<OVERLAPPED>,
    buf: Box<EventBuf>,
}

impl Drop for DirWatch {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.dir);
            CloseHandle(self.port);
        }
    }
}

/// One half of a rename, waiting for its partner.
#[derive(Default)]
struct RenamePair {
    old: Option<(PathBuf, PathType)>,
    new: Option<(PathBuf, PathType)>,
}

fn open_root(root: &Path) -> io::Result<DirWatch> {
    let wide: Vec<u16> = root.as_os_str().encode_wide().chain(Some(0)).collect();
    let dir = unsafe {
        CreateFileW(
            wide.as_ptr(),
            FILE_LIST_DIRECTORY,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
            ptr::null(),
            OPEN_EXISTING,
            FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
            0,
        )
    };
    if dir == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    let port = unsafe { CreateIoCompletionPort(dir, 0, dir as usize, 1) };
    if port == 0 {
        let err = io::Error::last_os_error();
        unsafe { CloseHandle(dir) };
        return Err(err);
    }
    Ok(DirWatch {
        dir,
        port,
        overlap: Box::new(unsafe { mem::zeroed() }),
        buf: Box::new(EventBuf([0; EVENT_BUF_LEN])),
    })
}

impl DirWatch {
    /// Queues the next overlapped directory read.
    fn issue(&mut self) -> io::Result<()> {
        *self.overlap = unsafe { mem::zeroed() };
        let mut returned = 0u32;
        let issued = unsafe {
            ReadDirectoryChangesW(
                self.dir,
                self.buf.0.as_mut_ptr().cast(),
                EVENT_BUF_LEN as u32,
                1, // watch the whole subtree
                CHANGE_FILTER,
                &mut returned,
                &mut *self.overlap,
                None,
            )
        };
        if issued == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

fn path_type_of(path: &Path) -> PathType {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => PathType::Dir,
        Ok(_) => PathType::File,
        // The path may already be gone.
        Err(_) => PathType::Other,
    }
}

/// Walks the `FILE_NOTIFY_INFORMATION` chain in a completed buffer.
fn drain(
    buf: &[u8],
    filled: usize,
    root: &Path,
    pending: &mut RenamePair,
    handler: &mut dyn EventHandler,
) {
    let mut offset = 0usize;
    loop {
        if offset + NOTIFY_HDR_LEN > filled.min(buf.len()) {
            return;
        }
        let next_entry = u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap_or([0; 4]));
        let action = u32::from_ne_bytes(buf[offset + 4..offset + 8].try_into().unwrap_or([0; 4]));
        let name_len = u32::from_ne_bytes(buf[offset + 8..offset + 12].try_into().unwrap_or([0; 4])) as usize;

        let name_offset = offset + NOTIFY_HDR_LEN;
        // The length is in bytes and always even.
        if name_len % 2 == 0 && name_offset + name_len <= filled.min(buf.len()) {
            let units: Vec<u16> = buf[name_offset..name_offset + name_len]
                .chunks_exact(2)
                .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
                .collect();
            let path = root.join(OsString::from_wide(&units));
            let path_type = path_type_of(&path);

            match action {
                FILE_ACTION_RENAMED_OLD_NAME => {
                    pending.old = Some((path, path_type));
                    emit_pair(pending, handler);
                }
                FILE_ACTION_RENAMED_NEW_NAME => {
                    pending.new = Some((path, path_type));
                    emit_pair(pending, handler);
                }
                FILE_ACTION_ADDED => {
                    handler.handle_event(Event::new(path, EffectType::Create, path_type))
                }
                FILE_ACTION_REMOVED => {
                    handler.handle_event(Event::new(path, EffectType::Destroy, path_type))
                }
                FILE_ACTION_MODIFIED => {
                    handler.handle_event(Event::new(path, EffectType::Modify, path_type))
                }
                _ => handler.handle_event(Event::new(path, EffectType::Other, path_type)),
            }
        }

        if next_entry == 0 {
            return;
        }
        offset += next_entry as usize;
    }
}

/// Joins the two halves of a rename into one event, tolerating either
/// arrival order. The old side is usually gone from disk already, so
/// its path type falls back to the new side's.
fn emit_pair(pending: &mut RenamePair, handler: &mut dyn EventHandler) {
    if pending.old.is_none() || pending.new.is_none() {
        return;
    }
    if let (Some((old_path, old_type)), Some((new_path, new_type))) =
        (pending.old.take(), pending.new.take())
    {
        let path_type = if old_type == PathType::Other {
            new_type
        } else {
            old_type
        };
        handler.handle_event(
            Event::new(old_path, EffectType::Rename, path_type).associated(new_path),
        );
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
    let mut watch = match open_root(root) {
        Ok(watch) => watch,
        Err(err) => {
            handler.handle_event(status_event(format!(
                "e/self/sys_resource({err})@{}",
                root.display()
            )));
            handler.handle_event(die_event(root, false));
            return false;
        }
    };

    let fail_read = |handler: &mut dyn EventHandler, err: io::Error| {
        let tag = if err.raw_os_error() == Some(ERROR_IO_PENDING as i32) {
            "e/sys/read/pending"
        } else {
            "e/sys/read"
        };
        handler.handle_event(status_event(format!(
            "{tag}({err})@{}",
            root.display()
        )));
        handler.handle_event(die_event(root, false));
        false
    };

    if let Err(err) = watch.issue() {
        return fail_read(handler, err);
    }

    let mut pending = RenamePair::default();
    while living.is_living() {
        let mut filled = 0u32;
        let mut key = 0usize;
        let mut overlap: *mut OVERLAPPED = ptr::null_mut();
        let completed = unsafe {
            GetQueuedCompletionStatus(watch.port, &mut filled, &mut key, &mut overlap, DELAY_MS)
        };

        if completed == 0 {
            if overlap.is_null() {
                continue; // timeout tick; the loop condition checks liveness
            }
            // A completion failed outright: the directory handle went
            // bad underneath us (the root was likely deleted).
            return fail_read(handler, io::Error::last_os_error());
        }
        if overlap.is_null() {
            continue;
        }

        if filled == 0 {
            // The kernel dropped changes because our buffer was full.
            handler.handle_event(status_event(format!(
                "w/self/overflow@{}",
                root.display()
            )));
        } else {
            drain(&watch.buf.0, filled as usize, root, &mut pending, handler);
        }
        if let Err(err) = watch.issue() {
            return fail_read(handler, err);
        }
    }

    drop(watch);
    handler.handle_event(die_event(root, true));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn push_record(buf: &mut Vec<u8>, next: u32, action: u32, name: &str) {
        let units: Vec<u16> = name.encode_utf16().collect();
        buf.extend_from_slice(&next.to_ne_bytes());
        buf.extend_from_slice(&action.to_ne_bytes());
        buf.extend_from_slice(&((units.len() * 2) as u32).to_ne_bytes());
        for unit in units {
            buf.extend_from_slice(&unit.to_ne_bytes());
        }
    }

    fn collect(buf: &[u8]) -> Vec<Event> {
        let (tx, rx) = mpsc::channel();
        let mut handler: Box<dyn EventHandler> = Box::new(tx);
        let mut pending = RenamePair::default();
        drain(buf, buf.len(), Path::new("C:\\w"), &mut pending, &mut *handler);
        drop(handler);
        rx.iter().collect()
    }

    #[test]
    fn decodes_a_chain_of_records() {
        let mut buf = Vec::new();
        let first_len = NOTIFY_HDR_LEN + "gone.txt".len() * 2;
        push_record(&mut buf, first_len as u32, FILE_ACTION_REMOVED, "gone.txt");
        push_record(&mut buf, 0, FILE_ACTION_ADDED, "fresh.txt");

        let events = collect(&buf);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].effect_type, EffectType::Destroy);
        assert_eq!(events[0].path_name, Path::new("C:\\w\\gone.txt"));
        assert_eq!(events[1].effect_type, EffectType::Create);
        assert_eq!(events[1].path_name, Path::new("C:\\w\\fresh.txt"));
    }

    #[test]
    fn joins_rename_halves_in_either_order() {
        for flip in [false, true] {
            let mut buf = Vec::new();
            let (first, second) = if flip {
                (FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME)
            } else {
                (FILE_ACTION_RENAMED_OLD_NAME, FILE_ACTION_RENAMED_NEW_NAME)
            };
            let first_name = if flip { "b.txt" } else { "a.txt" };
            let second_name = if flip { "a.txt" } else { "b.txt" };
            let first_len = NOTIFY_HDR_LEN + first_name.len() * 2;
            push_record(&mut buf, first_len as u32, first, first_name);
            push_record(&mut buf, 0, second, second_name);

            let events = collect(&buf);
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].effect_type, EffectType::Rename);
            assert_eq!(events[0].path_name, Path::new("C:\\w\\a.txt"));
            assert_eq!(
                events[0].associated_path_name.as_deref(),
                Some(Path::new("C:\\w\\b.txt"))
            );
        }
    }

    #[test]
    fn a_lone_rename_half_waits() {
        let mut buf = Vec::new();
        push_record(&mut buf, 0, FILE_ACTION_RENAMED_OLD_NAME, "a.txt");
        let events = collect(&buf);
        assert!(events.is_empty());
    }
}
