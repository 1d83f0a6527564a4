//! Helpers shared by the integration tests.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pathwatch::{Event, PathType};

pub type EventLog = Arc<Mutex<Vec<Event>>>;

/// A handler that appends everything it sees to a shared log.
pub fn recorder() -> (EventLog, impl FnMut(Event) + Send + 'static) {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    (log, move |event: Event| {
        sink.lock().expect("event log").push(event)
    })
}

/// Polls the log until `pred` holds or `timeout` elapses. Returns
/// whether it held.
pub fn wait_until<F>(log: &EventLog, timeout: Duration, pred: F) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let start = Instant::now();
    loop {
        if pred(&log.lock().expect("event log")) {
            return true;
        }
        if start.elapsed() > timeout {
            return pred(&log.lock().expect("event log"));
        }
        thread::sleep(Duration::from_millis(10));
    }
}

pub fn snapshot(log: &EventLog) -> Vec<Event> {
    log.lock().expect("event log").clone()
}

pub fn is_live(event: &Event, root: &Path) -> bool {
    event.path_type == PathType::Watcher
        && event.path_name.as_os_str()
            == format!("s/self/live@{}", root.display()).as_str()
}

pub fn is_die(event: &Event, root: &Path) -> bool {
    event.path_type == PathType::Watcher
        && (event.path_name.as_os_str()
            == format!("s/self/die@{}", root.display()).as_str()
            || event.path_name.as_os_str()
                == format!("e/self/die@{}", root.display()).as_str())
}

pub fn is_clean_die(event: &Event, root: &Path) -> bool {
    event.path_type == PathType::Watcher
        && event.path_name.as_os_str()
            == format!("s/self/die@{}", root.display()).as_str()
}

/// Real filesystem events, with the watcher status chatter filtered
/// out.
pub fn fs_events(events: &[Event]) -> Vec<Event> {
    events
        .iter()
        .filter(|event| event.path_type != PathType::Watcher)
        .cloned()
        .collect()
}

/// Whether this host can actually deliver events for the adapter the
/// selector will pick. Running as root on Linux routes to fanotify,
/// which additionally needs CAP_SYS_ADMIN; a root uid inside an
/// unprivileged container often lacks it. Tests that need event
/// delivery print a notice and return early when this is false.
pub fn native_events_available() -> bool {
    if cfg!(feature = "force-scan") {
        // The scan adapter needs no OS support at all.
        return true;
    }
    #[cfg(target_os = "linux")]
    {
        if unsafe { libc::geteuid() } == 0 {
            return fanotify_probe();
        }
    }
    true
}

#[cfg(target_os = "linux")]
fn fanotify_probe() -> bool {
    let fd = unsafe {
        libc::fanotify_init(
            libc::FAN_CLASS_NOTIF
                | libc::FAN_REPORT_DFID_NAME
                | libc::FAN_UNLIMITED_QUEUE
                | libc::FAN_UNLIMITED_MARKS,
            (libc::O_RDONLY | libc::O_NONBLOCK | libc::O_CLOEXEC) as libc::c_uint,
        )
    };
    if fd >= 0 {
        unsafe { libc::close(fd) };
        true
    } else {
        eprintln!(
            "fanotify is unavailable here ({})",
            std::io::Error::last_os_error()
        );
        false
    }
}
