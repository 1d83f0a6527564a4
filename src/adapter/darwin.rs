//! The Darwin `FSEvents` adapter.
//!
//! The stream delivers batches of `(path, flags)` tuples on a private
//! serial dispatch queue; the worker thread itself only sleeps in
//! short ticks waiting to be closed. Because FSEvents sometimes
//! re-sends a create in the same batch as the subsequent destroy, a
//! set of paths we believe "created" dedupes those pairs.
//!
//! The bindings are declared here; neither libc nor the pack's windows
//! shims cover CoreServices.

#![allow(non_upper_case_globals)]

use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::adapter::{die_event, status_event};
use crate::event::{EffectType, Event, PathType};
use crate::living::Living;
use crate::watch::EventHandler;

mod ffi {
    use libc::{c_char, c_double, c_int, c_long, c_uchar, c_uint, c_void};

    pub type CFRef = *const c_void;
    pub type CFStringRef = CFRef;
    pub type CFArrayRef = CFRef;
    pub type CFDictionaryRef = CFRef;
    pub type CFIndex = c_long;
    pub type CFTimeInterval = c_double;
    pub type CFStringEncoding = c_uint;
    pub type FSEventStreamRef = *mut c_void;
    pub type ConstFSEventStreamRef = *const c_void;
    pub type FSEventStreamEventId = u64;
    pub type FSEventStreamEventFlags = u32;
    pub type DispatchQueue = *mut c_void;
    pub type DispatchQueueAttr = *mut c_void;
    pub type DispatchQosClass = c_uint;

    pub const kCFStringEncodingUTF8: CFStringEncoding = 0x0800_0100;

    pub const kFSEventStreamEventIdSinceNow: FSEventStreamEventId = u64::MAX;

    pub const kFSEventStreamCreateFlagUseCFTypes: u32 = 0x0000_0001;
    pub const kFSEventStreamCreateFlagFileEvents: u32 = 0x0000_0010;
    pub const kFSEventStreamCreateFlagUseExtendedData: u32 = 0x0000_0040;

    pub const kFSEventStreamEventFlagItemCreated: u32 = 0x0000_0100;
    pub const kFSEventStreamEventFlagItemRemoved: u32 = 0x0000_0200;
    pub const kFSEventStreamEventFlagItemRenamed: u32 = 0x0000_0800;
    pub const kFSEventStreamEventFlagItemModified: u32 = 0x0000_1000;
    pub const kFSEventStreamEventFlagItemChangeOwner: u32 = 0x0000_4000;
    pub const kFSEventStreamEventFlagItemIsFile: u32 = 0x0001_0000;
    pub const kFSEventStreamEventFlagItemIsDir: u32 = 0x0002_0000;
    pub const kFSEventStreamEventFlagItemIsSymlink: u32 = 0x0004_0000;
    pub const kFSEventStreamEventFlagItemIsHardlink: u32 = 0x0010_0000;
    pub const kFSEventStreamEventFlagItemIsLastHardlink: u32 = 0x0020_0000;

    pub const QOS_CLASS_USER_INITIATED: DispatchQosClass = 0x19;

    #[repr(C)]
    pub struct FSEventStreamContext {
        pub version: CFIndex,
        pub info: *mut c_void,
        pub retain: Option<extern "C" fn(*const c_void) -> *const c_void>,
        pub release: Option<extern "C" fn(*const c_void)>,
        pub copy_description: Option<extern "C" fn(*const c_void) -> CFStringRef>,
    }

    pub type FSEventStreamCallback = extern "C" fn(
        stream: ConstFSEventStreamRef,
        info: *mut c_void,
        num_events: usize,
        event_paths: *mut c_void,
        event_flags: *const FSEventStreamEventFlags,
        event_ids: *const FSEventStreamEventId,
    );

    #[repr(C)]
    pub struct CFArrayCallBacks {
        version: CFIndex,
        retain: *const c_void,
        release: *const c_void,
        copy_description: *const c_void,
        equal: *const c_void,
    }

    #[link(name = "CoreFoundation", kind = "framework")]
    extern "C" {
        pub static kCFTypeArrayCallBacks: CFArrayCallBacks;

        pub fn CFStringCreateWithCString(
            alloc: CFRef,
            c_str: *const c_char,
            encoding: CFStringEncoding,
        ) -> CFStringRef;
        pub fn CFStringGetCStringPtr(
            string: CFStringRef,
            encoding: CFStringEncoding,
        ) -> *const c_char;
        pub fn CFStringGetCString(
            string: CFStringRef,
            buffer: *mut c_char,
            buffer_size: CFIndex,
            encoding: CFStringEncoding,
        ) -> c_uchar;
        pub fn CFArrayCreate(
            alloc: CFRef,
            values: *const *const c_void,
            num_values: CFIndex,
            callbacks: *const CFArrayCallBacks,
        ) -> CFArrayRef;
        pub fn CFArrayGetValueAtIndex(array: CFArrayRef, index: CFIndex) -> *const c_void;
        pub fn CFDictionaryGetValue(dict: CFDictionaryRef, key: *const c_void) -> *const c_void;
        pub fn CFRelease(cf: CFRef);
    }

    #[link(name = "CoreServices", kind = "framework")]
    extern "C" {
        pub static kFSEventStreamEventExtendedDataPathKey: CFStringRef;

        pub fn FSEventStreamCreate(
            allocator: CFRef,
            callback: FSEventStreamCallback,
            context: *const FSEventStreamContext,
            paths_to_watch: CFArrayRef,
            since_when: FSEventStreamEventId,
            latency: CFTimeInterval,
            flags: u32,
        ) -> FSEventStreamRef;
        pub fn FSEventStreamSetDispatchQueue(stream: FSEventStreamRef, queue: DispatchQueue);
        pub fn FSEventStreamStart(stream: FSEventStreamRef) -> c_uchar;
        pub fn FSEventStreamStop(stream: FSEventStreamRef);
        pub fn FSEventStreamInvalidate(stream: FSEventStreamRef);
        pub fn FSEventStreamRelease(stream: FSEventStreamRef);
    }

    // libdispatch lives in libSystem; no explicit link attribute needed.
    extern "C" {
        pub fn dispatch_queue_create(
            label: *const c_char,
            attr: DispatchQueueAttr,
        ) -> DispatchQueue;
        pub fn dispatch_queue_attr_make_with_qos_class(
            attr: DispatchQueueAttr,
            qos_class: DispatchQosClass,
            relative_priority: c_int,
        ) -> DispatchQueueAttr;
        pub fn dispatch_release(object: *mut c_void);
    }
}

const DELAY: Duration = Duration::from_millis(16);
const QUEUE_PRIORITY: libc::c_int = -10;

/// What the stream callback works with. Boxed for a stable address;
/// the raw handler pointer is only dereferenced between stream start
/// and invalidation, while the worker itself leaves the handler alone.
struct StreamState {
    handler: *mut dyn EventHandler,
    seen_created: HashSet<String>,
    root: PathBuf,
}

struct Stream {
    stream: ffi::FSEventStreamRef,
    queue: ffi::DispatchQueue,
}

fn cf_string(path: &Path) -> Option<ffi::CFStringRef> {
    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let string = unsafe {
        ffi::CFStringCreateWithCString(
            std::ptr::null(),
            c_path.as_ptr(),
            ffi::kCFStringEncodingUTF8,
        )
    };
    if string.is_null() {
        None
    } else {
        Some(string)
    }
}

/// Lifts the path string out of one extended-data dictionary. Most of
/// Darwin's API is `void*`-typed; the function names carry the types.
fn path_at(event_paths: *mut libc::c_void, index: usize) -> Option<String> {
    unsafe {
        let dict = ffi::CFArrayGetValueAtIndex(event_paths, index as ffi::CFIndex);
        if dict.is_null() {
            return None;
        }
        let string =
            ffi::CFDictionaryGetValue(dict, ffi::kFSEventStreamEventExtendedDataPathKey);
        if string.is_null() {
            return None;
        }
        let fast = ffi::CFStringGetCStringPtr(string, ffi::kCFStringEncodingUTF8);
        if !fast.is_null() {
            return Some(CStr::from_ptr(fast).to_string_lossy().into_owned());
        }
        // The fast path is allowed to fail for any string; copy out.
        let mut buf = [0 as libc::c_char; libc::PATH_MAX as usize];
        let copied = ffi::CFStringGetCString(
            string,
            buf.as_mut_ptr(),
            buf.len() as ffi::CFIndex,
            ffi::kCFStringEncodingUTF8,
        );
        if copied == 0 {
            return None;
        }
        Some(CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned())
    }
}

fn path_type_of(flags: u32) -> PathType {
    if flags & ffi::kFSEventStreamEventFlagItemIsFile != 0 {
        PathType::File
    } else if flags & ffi::kFSEventStreamEventFlagItemIsDir != 0 {
        PathType::Dir
    } else if flags & ffi::kFSEventStreamEventFlagItemIsSymlink != 0 {
        PathType::SymLink
    } else if flags
        & (ffi::kFSEventStreamEventFlagItemIsHardlink
            | ffi::kFSEventStreamEventFlagItemIsLastHardlink)
        != 0
    {
        PathType::HardLink
    } else {
        PathType::Other
    }
}

/// The stream callback. More than one thing might have happened to the
/// same path in one batch, which is why the flag tests are
/// non-exclusive.
extern "C" fn event_recv(
    _stream: ffi::ConstFSEventStreamRef,
    info: *mut libc::c_void,
    num_events: usize,
    event_paths: *mut libc::c_void,
    event_flags: *const ffi::FSEventStreamEventFlags,
    _event_ids: *const ffi::FSEventStreamEventId,
) {
    let state = unsafe { &mut *(info as *mut StreamState) };
    let handler = unsafe { &mut *state.handler };

    for index in 0..num_events {
        let path = match path_at(event_paths, index) {
            Some(path) => path,
            None => {
                handler.handle_event(status_event(format!(
                    "w/self/no_path@{}",
                    state.root.display()
                )));
                continue;
            }
        };
        let flags = unsafe { *event_flags.add(index) };
        let path_type = path_type_of(flags);

        if flags & ffi::kFSEventStreamEventFlagItemCreated != 0
            && state.seen_created.insert(path.clone())
        {
            handler.handle_event(Event::new(&*path, EffectType::Create, path_type));
        }
        if flags & ffi::kFSEventStreamEventFlagItemRemoved != 0
            && state.seen_created.remove(&path)
        {
            handler.handle_event(Event::new(&*path, EffectType::Destroy, path_type));
        }
        if flags & ffi::kFSEventStreamEventFlagItemModified != 0 {
            handler.handle_event(Event::new(&*path, EffectType::Modify, path_type));
        }
        if flags & ffi::kFSEventStreamEventFlagItemRenamed != 0 {
            handler.handle_event(Event::new(&*path, EffectType::Rename, path_type));
        }
        if flags & ffi::kFSEventStreamEventFlagItemChangeOwner != 0 {
            handler.handle_event(Event::new(&*path, EffectType::Owner, path_type));
        }
    }
}

/// Creates, schedules and starts the stream. The queue label does not
/// need to be unique; the state's address makes it so anyway.
fn open_stream(root: &Path, state: &mut StreamState) -> Option<Stream> {
    let path = cf_string(root)?;
    let paths = unsafe {
        ffi::CFArrayCreate(
            std::ptr::null(),
            &path as *const ffi::CFStringRef as *const *const libc::c_void,
            1,
            &ffi::kCFTypeArrayCallBacks,
        )
    };
    if paths.is_null() {
        unsafe { ffi::CFRelease(path) };
        return None;
    }

    let context = ffi::FSEventStreamContext {
        version: 0,
        info: state as *mut StreamState as *mut libc::c_void,
        retain: None,
        release: None,
        copy_description: None,
    };
    let stream = unsafe {
        ffi::FSEventStreamCreate(
            std::ptr::null(),
            event_recv,
            &context,
            paths,
            ffi::kFSEventStreamEventIdSinceNow,
            0.0,
            ffi::kFSEventStreamCreateFlagFileEvents
                | ffi::kFSEventStreamCreateFlagUseExtendedData
                | ffi::kFSEventStreamCreateFlagUseCFTypes,
        )
    };
    unsafe {
        ffi::CFRelease(paths);
        ffi::CFRelease(path);
    }
    if stream.is_null() {
        return None;
    }

    let label = CString::new(format!(
        "pathwatch.{:x}",
        state as *mut StreamState as usize
    ))
    .ok()?;
    let queue = unsafe {
        ffi::dispatch_queue_create(
            label.as_ptr(),
            ffi::dispatch_queue_attr_make_with_qos_class(
                std::ptr::null_mut(), // DISPATCH_QUEUE_SERIAL
                ffi::QOS_CLASS_USER_INITIATED,
                QUEUE_PRIORITY,
            ),
        )
    };
    if queue.is_null() {
        unsafe { ffi::FSEventStreamRelease(stream) };
        return None;
    }

    unsafe {
        ffi::FSEventStreamSetDispatchQueue(stream, queue);
        if ffi::FSEventStreamStart(stream) == 0 {
            ffi::FSEventStreamInvalidate(stream);
            ffi::FSEventStreamRelease(stream);
            ffi::dispatch_release(queue);
            return None;
        }
    }

    Some(Stream { stream, queue })
}

/// After this returns the queue no longer runs our callback, so the
/// stream state can be reclaimed.
fn close_stream(stream: Stream) {
    unsafe {
        ffi::FSEventStreamStop(stream.stream);
        ffi::FSEventStreamInvalidate(stream.stream);
        ffi::FSEventStreamRelease(stream.stream);
        ffi::dispatch_release(stream.queue);
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
    // The stream api itself accepts paths that don't exist yet; an
    // absent root is our error to report.
    if !root.exists() {
        handler.handle_event(status_event(format!(
            "e/self/sys_resource@{}",
            root.display()
        )));
        handler.handle_event(die_event(root, false));
        return false;
    }

    let mut state = Box::new(StreamState {
        handler: handler as *mut dyn EventHandler,
        seen_created: HashSet::new(),
        root: root.to_path_buf(),
    });

    match open_stream(root, &mut state) {
        Some(stream) => {
            while living.is_living() {
                thread::sleep(DELAY);
            }
            close_stream(stream);
            drop(state);
            handler.handle_event(die_event(root, true));
            true
        }
        None => {
            handler.handle_event(status_event(format!(
                "e/self/sys_resource@{}",
                root.display()
            )));
            handler.handle_event(die_event(root, false));
            false
        }
    }
}
