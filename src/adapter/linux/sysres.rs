//! Epoll plumbing and setup helpers shared by both Linux adapters.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use walkdir::WalkDir;

use crate::event::{EffectType, Event, PathType};
use crate::watch::EventHandler;

/// The delay, in milliseconds, while `epoll_wait` will sleep for until
/// we are woken up. We usually check if we're still alive at that
/// point. The close-side eventfd is registered too, so a close wakes
/// us earlier than the tick.
pub(crate) const WAKE_MS: libc::c_int = 16;

/// Number of events `epoll_wait` may hand back per wake. Low is fine;
/// events we "miss" are still waiting in the next call.
pub(crate) const WAIT_QUEUE_MAX: usize = 1;

pub(crate) fn cvt(res: libc::c_int) -> io::Result<libc::c_int> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

/// A level-triggered epoll set.
///
/// See [epoll(7)](https://man7.org/linux/man-pages/man7/epoll.7.html).
#[derive(Debug)]
pub(crate) struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Epoll {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Watches `fd` for readability. The fd itself is carried back in
    /// the event data on wake.
    pub fn add(&self, fd: RawFd) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: fd as u64,
        };
        cvt(unsafe {
            libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        })?;
        Ok(())
    }

    /// Waits for readiness; `Ok(0)` means the timeout elapsed. Retries
    /// on `EINTR`.
    pub fn wait(
        &self,
        events: &mut [libc::epoll_event],
        timeout_ms: libc::c_int,
    ) -> io::Result<usize> {
        loop {
            let count = unsafe {
                libc::epoll_wait(
                    self.fd.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    timeout_ms,
                )
            };
            if count >= 0 {
                return Ok(count as usize);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }
}

/// Applies `mark` to the root and, when the root is a directory, to
/// every directory below it. Follows symlinks and skips entries we
/// lack permissions for. A root that cannot be marked is an error; a
/// descendant that cannot be marked only costs us coverage of that
/// subtree, so it is reported as a `w/sys/not_watched` status event
/// and the walk goes on.
pub(crate) fn mark_tree<F>(
    root: &Path,
    handler: &mut dyn EventHandler,
    mut mark: F,
) -> io::Result<()>
where
    F: FnMut(&Path) -> io::Result<()>,
{
    mark(root)?;
    if root.is_dir() {
        let walk = WalkDir::new(root).min_depth(1).follow_links(true);
        for entry in walk.into_iter().filter_map(|entry| entry.ok()) {
            if !entry.file_type().is_dir() {
                continue;
            }
            if let Err(err) = mark(entry.path()) {
                log::warn!("could not watch {}: {err}", entry.path().display());
                handler.handle_event(Event::new(
                    format!(
                        "w/sys/not_watched@{}@{}",
                        root.display(),
                        entry.path().display()
                    ),
                    EffectType::Other,
                    PathType::Watcher,
                ));
            }
        }
    }
    Ok(())
}

/// Copies a `T` out of an event buffer. The kernel packs these records
/// with no more than 4-byte alignment, so go through an unaligned copy.
///
/// Callers must have bounds-checked `offset + size_of::<T>()`.
pub(crate) unsafe fn read_struct<T>(buf: &[u8], offset: usize) -> T {
    debug_assert!(offset + std::mem::size_of::<T>() <= buf.len());
    let mut out = std::mem::MaybeUninit::<T>::uninit();
    std::ptr::copy_nonoverlapping(
        buf.as_ptr().add(offset),
        out.as_mut_ptr().cast::<u8>(),
        std::mem::size_of::<T>(),
    );
    out.assume_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoll_times_out_with_nothing_registered() {
        let epoll = Epoll::new().expect("epoll_create1");
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; WAIT_QUEUE_MAX];
        let count = epoll.wait(&mut events, 0).expect("epoll_wait");
        assert_eq!(count, 0);
    }

    #[test]
    fn epoll_reports_a_readable_fd() {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let epoll = Epoll::new().expect("epoll_create1");
        epoll.add(fds[0]).expect("epoll_ctl");

        assert_eq!(unsafe { libc::write(fds[1], b"x".as_ptr().cast(), 1) }, 1);
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; WAIT_QUEUE_MAX];
        let count = epoll.wait(&mut events, 100).expect("epoll_wait");
        assert_eq!(count, 1);
        let event_u64 = events[0].u64;
        assert_eq!(event_u64, fds[0] as u64);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn read_struct_is_offset_exact() {
        let buf = [0u8, 0, 0, 0, 0x2a, 0, 0, 0, 7, 0, 0, 0];
        let value: u32 = unsafe { read_struct(&buf, 4) };
        assert_eq!(value, 0x2a);
        let value: u32 = unsafe { read_struct(&buf, 8) };
        assert_eq!(value, 7);
    }
}
