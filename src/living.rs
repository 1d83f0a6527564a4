//! The liveness flag shared between a watch handle and its worker.
//!
//! On all platforms this behaves like an atomic boolean. On Linux and
//! Android it also carries an eventfd which the adapters register in
//! epoll, so that `close` wakes the worker out of `epoll_wait` instead
//! of waiting for the next timeout tick.

use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(linux_android)]
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

#[derive(Debug)]
pub(crate) struct Living {
    alive: AtomicBool,
    #[cfg(linux_android)]
    wake_fd: Option<OwnedFd>,
}

impl Living {
    pub fn new() -> Living {
        Living {
            alive: AtomicBool::new(true),
            #[cfg(linux_android)]
            wake_fd: new_wake_fd(),
        }
    }

    pub fn is_living(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Asks the worker to wind down. Idempotent.
    pub fn end(&self) {
        self.alive.store(false, Ordering::Release);
        #[cfg(linux_android)]
        if let Some(fd) = &self.wake_fd {
            unsafe { libc::eventfd_write(fd.as_raw_fd(), 1) };
        }
    }

    /// An fd that becomes readable once [`end`](Living::end) is called.
    /// `None` if the eventfd could not be created; the worker then
    /// relies on its wait timeout alone.
    #[cfg(linux_android)]
    pub fn wake_fd(&self) -> Option<RawFd> {
        self.wake_fd.as_ref().map(|fd| fd.as_raw_fd())
    }
}

#[cfg(linux_android)]
fn new_wake_fd() -> Option<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd >= 0 {
        Some(unsafe { OwnedFd::from_raw_fd(fd) })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ends_once_and_stays_ended() {
        let living = Living::new();
        assert!(living.is_living());
        living.end();
        assert!(!living.is_living());
        living.end();
        assert!(!living.is_living());
    }

    #[cfg(linux_android)]
    #[test]
    fn wake_fd_becomes_readable_on_end() {
        let living = Living::new();
        let fd = living.wake_fd().expect("eventfd");
        let mut value: libc::eventfd_t = 0;
        // Nothing to read while alive.
        assert_eq!(unsafe { libc::eventfd_read(fd, &mut value) }, -1);
        living.end();
        assert_eq!(unsafe { libc::eventfd_read(fd, &mut value) }, 0);
        assert!(value > 0);
    }
}
