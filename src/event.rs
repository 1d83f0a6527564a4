//! The event model shared by every adapter.
//!
//! An [`Event`] is either a single observed filesystem change or a status
//! message from the watcher itself. Status events carry a sentinel string
//! of the form `<severity>/<origin>/<tag>[@<detail>]` in [`Event::path_name`]
//! and are marked with [`PathType::Watcher`]; everything else is a real
//! filesystem path.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// What happened to a path at the moment of some affecting event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EffectType {
    Rename,
    Modify,
    Create,
    Destroy,
    /// Ownership changed. Only some platforms report this.
    Owner,
    /// Catch-all.
    Other,
}

/// The essential kinds of paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PathType {
    Dir,
    File,
    HardLink,
    SymLink,
    /// A status message from the watcher, not a filesystem path.
    Watcher,
    /// Catch-all.
    Other,
}

impl EffectType {
    pub fn as_str(self) -> &'static str {
        match self {
            EffectType::Rename => "rename",
            EffectType::Modify => "modify",
            EffectType::Create => "create",
            EffectType::Destroy => "destroy",
            EffectType::Owner => "owner",
            EffectType::Other => "other",
        }
    }
}

impl PathType {
    pub fn as_str(self) -> &'static str {
        match self {
            PathType::Dir => "dir",
            PathType::File => "file",
            PathType::HardLink => "hard_link",
            PathType::SymLink => "sym_link",
            PathType::Watcher => "watcher",
            PathType::Other => "other",
        }
    }
}

impl fmt::Display for EffectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.as_str())
    }
}

impl fmt::Display for PathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.as_str())
    }
}

/// A single filesystem event, or a watcher status message.
#[derive(Clone, Debug)]
pub struct Event {
    /// The path affected by this event. Always absolute for real
    /// filesystem events; a sentinel string for watcher status.
    pub path_name: PathBuf,
    pub effect_type: EffectType,
    pub path_type: PathType,
    /// Nanoseconds since the Unix epoch, captured at construction.
    pub effect_time: i64,
    /// The other half of a rename pair, when the platform reports both
    /// sides in one event.
    pub associated_path_name: Option<PathBuf>,
}

impl Event {
    pub fn new<P: Into<PathBuf>>(
        path_name: P,
        effect_type: EffectType,
        path_type: PathType,
    ) -> Event {
        Event {
            path_name: path_name.into(),
            effect_type,
            path_type,
            effect_time: now_nanos(),
            associated_path_name: None,
        }
    }

    /// Attaches the other half of a rename pair.
    pub fn associated<P: Into<PathBuf>>(mut self, path_name: P) -> Event {
        self.associated_path_name = Some(path_name.into());
        self
    }
}

/// A "strict" comparison over the path, effect, kind and time fields.
/// Keep in mind that this compares `effect_time`, which might not be
/// desirable.
impl PartialEq for Event {
    fn eq(&self, other: &Event) -> bool {
        self.path_name == other.path_name
            && self.effect_type == other.effect_type
            && self.path_type == other.path_type
            && self.effect_time == other.effect_time
    }
}

impl Eq for Event {}

/// Formats as a json object, without line breaks:
///
/// ```text
/// "1678046920675963000":{"where":"/some_file.txt","what":"create","kind":"file"}
/// ```
impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\":{{\"where\":{},\"what\":{},\"kind\":{}}}",
            self.effect_time,
            json_path(&self.path_name),
            self.effect_type,
            self.path_type
        )
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_nanos() as i64)
        .unwrap_or(0)
}

/// A json string literal for a path. Non-UTF-8 paths are rendered
/// lossily; the escape set covers quotes, backslashes and controls.
fn json_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');
    for c in raw.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32))
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_form() {
        let ev = Event::new("/some_file.txt", EffectType::Create, PathType::File);
        let expect = format!(
            "\"{}\":{{\"where\":\"/some_file.txt\",\"what\":\"create\",\"kind\":\"file\"}}",
            ev.effect_time
        );
        assert_eq!(ev.to_string(), expect);
    }

    #[test]
    fn json_escapes_specials() {
        let ev = Event::new("/with\"quote\\and\ttab", EffectType::Other, PathType::Other);
        let rendered = ev.to_string();
        assert!(rendered.contains("\\\"quote\\\\and\\ttab"));
    }

    #[test]
    fn enum_names_are_lowercase() {
        assert_eq!(EffectType::Destroy.as_str(), "destroy");
        assert_eq!(PathType::HardLink.as_str(), "hard_link");
        assert_eq!(PathType::SymLink.as_str(), "sym_link");
        assert_eq!(format!("{}", PathType::Watcher), "\"watcher\"");
    }

    #[test]
    fn eq_is_over_the_public_fields() {
        let a = Event::new("/a", EffectType::Rename, PathType::File);
        let mut b = a.clone();
        assert_eq!(a, b);
        // The rename pair's other side does not take part in equality.
        b.associated_path_name = Some("/b".into());
        assert_eq!(a, b);
        b.path_name = "/c".into();
        assert_ne!(a, b);
    }

    #[test]
    fn sentinel_events_are_watcher_typed() {
        let ev = Event::new("s/self/live@/tmp/w", EffectType::Create, PathType::Watcher);
        assert_eq!(ev.path_type, PathType::Watcher);
        assert!(ev.path_name.to_string_lossy().starts_with("s/self/live@"));
    }
}
