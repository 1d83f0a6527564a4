//! Adapter selection and dispatch.
//!
//! One adapter is chosen per open from the host OS, the kernel version
//! and the effective UID. The choice is pure: the same inputs always
//! yield the same adapter.

use std::path::Path;

use cfg_if::cfg_if;

use crate::event::{EffectType, Event, PathType};
use crate::living::Living;
use crate::watch::EventHandler;

cfg_if! {
    if #[cfg(linux_android)] {
        mod linux;
    } else if #[cfg(apple)] {
        mod darwin;
    } else if #[cfg(windows)] {
        mod windows;
    }
}

mod scan;

/// The available event sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(dead_code)] // only the host platform's variants are constructed
pub(crate) enum Adapter {
    /// Linux >= 5.9, effectively root.
    Fanotify,
    /// Linux >= 2.7, and Android.
    Inotify,
    /// macOS and iOS.
    FsEvents,
    /// Windows (`ReadDirectoryChangesW`).
    Rdcw,
    /// Anything else, or forced by the `force-scan` feature.
    Scan,
}

pub(crate) fn select() -> Adapter {
    cfg_if! {
        if #[cfg(feature = "force-scan")] {
            Adapter::Scan
        } else if #[cfg(android)] {
            Adapter::Inotify
        } else if #[cfg(linux)] {
            select_linux(kernel_version(), unsafe { libc::geteuid() } == 0)
        } else if #[cfg(apple)] {
            Adapter::FsEvents
        } else if #[cfg(windows)] {
            Adapter::Rdcw
        } else {
            Adapter::Scan
        }
    }
}

/// Runs the selected adapter's event loop to completion. Returns the
/// terminal success flag that `close` hands back to the caller.
pub(crate) fn watch(
    path: &Path,
    handler: &mut dyn EventHandler,
    living: &Living,
) -> bool {
    let adapter = select();
    log::debug!("watching {} with {:?}", path.display(), adapter);
    match adapter {
        #[cfg(linux)]
        Adapter::Fanotify => linux::fanotify::watch(path, handler, living),
        #[cfg(linux_android)]
        Adapter::Inotify => linux::inotify::watch(path, handler, living),
        #[cfg(apple)]
        Adapter::FsEvents => darwin::watch(path, handler, living),
        #[cfg(windows)]
        Adapter::Rdcw => windows::watch(path, handler, living),
        _ => scan::watch(path, handler, living),
    }
}

/// A watcher status event. `msg` is a sentinel string of the form
/// `<severity>/<origin>/<tag>[@<detail>]`.
pub(crate) fn status_event(msg: String) -> Event {
    Event::new(msg, EffectType::Other, PathType::Watcher)
}

/// The terminal status event every adapter delivers once, on every
/// exit path, right before its worker returns.
pub(crate) fn die_event(root: &Path, clean: bool) -> Event {
    let severity = if clean { 's' } else { 'e' };
    Event::new(
        format!("{severity}/self/die@{}", root.display()),
        EffectType::Destroy,
        PathType::Watcher,
    )
}

/// `fanotify` needs both a recent kernel and privilege; `inotify` is
/// fine anywhere above 2.7. Kernels too old for either (or an
/// unreadable `uname`) fall back to scanning.
#[cfg(linux)]
#[cfg_attr(feature = "force-scan", allow(dead_code))]
fn select_linux(kernel: Option<(u32, u32)>, is_root: bool) -> Adapter {
    match kernel {
        Some(version) if version >= (5, 9) && is_root => Adapter::Fanotify,
        Some(version) if version >= (2, 7) => Adapter::Inotify,
        _ => Adapter::Scan,
    }
}

#[cfg(linux)]
#[cfg_attr(feature = "force-scan", allow(dead_code))]
fn kernel_version() -> Option<(u32, u32)> {
    use std::ffi::CStr;
    use std::mem::MaybeUninit;

    let mut uts = MaybeUninit::<libc::utsname>::uninit();
    if unsafe { libc::uname(uts.as_mut_ptr()) } != 0 {
        return None;
    }
    let uts = unsafe { uts.assume_init() };
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
    parse_release(release.to_str().ok()?)
}

/// Lifts `(major, minor)` out of a release string like
/// `5.15.0-91-generic`.
#[cfg(linux)]
#[cfg_attr(feature = "force-scan", allow(dead_code))]
fn parse_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

#[cfg(all(test, linux))]
mod tests {
    use super::*;

    #[test]
    fn release_strings_parse() {
        assert_eq!(parse_release("5.15.0-91-generic"), Some((5, 15)));
        assert_eq!(parse_release("6.1.0"), Some((6, 1)));
        assert_eq!(parse_release("4.4.302+"), Some((4, 4)));
        assert_eq!(parse_release("mystery"), None);
    }

    #[test]
    fn linux_selection_is_pure() {
        for _ in 0..2 {
            assert_eq!(select_linux(Some((5, 9)), true), Adapter::Fanotify);
            assert_eq!(select_linux(Some((6, 2)), true), Adapter::Fanotify);
            assert_eq!(select_linux(Some((5, 9)), false), Adapter::Inotify);
            assert_eq!(select_linux(Some((5, 8)), true), Adapter::Inotify);
            assert_eq!(select_linux(Some((2, 7)), false), Adapter::Inotify);
            assert_eq!(select_linux(Some((2, 6)), false), Adapter::Scan);
            assert_eq!(select_linux(None, true), Adapter::Scan);
        }
    }

    #[test]
    fn select_never_picks_a_foreign_adapter() {
        let adapter = select();
        assert!(matches!(
            adapter,
            Adapter::Fanotify | Adapter::Inotify | Adapter::Scan
        ));
    }
}
