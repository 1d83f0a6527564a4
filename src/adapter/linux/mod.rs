//! The Linux adapters: `fanotify` for privileged processes on recent
//! kernels, `inotify` everywhere else (and on Android).

#[cfg(linux)]
pub(crate) mod fanotify;
pub(crate) mod inotify;
pub(crate) mod sysres;
