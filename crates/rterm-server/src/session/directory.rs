//! Working-directory bookkeeping for `cd` commands.
//!
//! Paths are resolved textually against the session's tracked directory,
//! then checked against the filesystem before the shell is told to move.

use std::path::{is_separator, Path, MAIN_SEPARATOR};

/// Reported when a `cd` target does not exist or is not a directory.
pub const PATH_NOT_FOUND_MESSAGE: &str = "Error: The system cannot find the path specified.";

/// Resolve a `cd` argument against `current`.
///
/// Rules, in order: empty → `home` (or the platform root), `..` → drop the
/// last segment, `.` → unchanged, absolute → verbatim, otherwise appended.
pub fn resolve(current: &str, arg: &str, home: Option<&Path>) -> String {
    if arg.is_empty() {
        return match home {
            Some(home) => display_form(&home.to_string_lossy()).to_string(),
            None => platform_root().to_string(),
        };
    }
    if arg == ".." {
        return parent(current).to_string();
    }
    if arg == "." {
        return current.to_string();
    }
    if is_absolute(arg) {
        return display_form(arg).to_string();
    }
    format!(
        "{}{MAIN_SEPARATOR}{}",
        strip_separators(current),
        strip_separators(arg)
    )
}

/// Trailing separators removed, then exactly one re-added.
pub fn normalize(path: &str) -> String {
    format!("{}{MAIN_SEPARATOR}", strip_separators(path))
}

/// Whether `path` names an existing directory.
pub fn is_directory(path: &str) -> bool {
    std::fs::metadata(normalize(path))
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Default working directory: the server's current directory.
pub fn current_dir_string() -> String {
    std::env::current_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| platform_root().to_string())
}

#[cfg(windows)]
fn platform_root() -> &'static str {
    "C:\\"
}

#[cfg(not(windows))]
fn platform_root() -> &'static str {
    "/"
}

fn is_absolute(path: &str) -> bool {
    // A leading separator is absolute for tracking purposes on every platform.
    Path::new(path).is_absolute() || path.starts_with(is_separator)
}

fn strip_separators(path: &str) -> &str {
    path.trim_end_matches(is_separator)
}

/// Trailing separators removed, except the one that makes a root (`/`,
/// `C:\`).
fn display_form(path: &str) -> &str {
    let stripped = strip_separators(path);
    if stripped.len() == path.len() {
        return path;
    }
    if stripped.is_empty() || stripped.ends_with(':') {
        // keep exactly one separator after the root
        let sep_len = path[stripped.len()..]
            .chars()
            .next()
            .map(char::len_utf8)
            .unwrap_or(0);
        return &path[..stripped.len() + sep_len];
    }
    stripped
}

fn parent(current: &str) -> &str {
    let trimmed = display_form(current);
    let stripped = strip_separators(trimmed);
    match stripped.rfind(is_separator) {
        None => trimmed,
        Some(idx) => {
            let head = &stripped[..idx];
            if head.is_empty() || head.ends_with(':') {
                &stripped[..=idx]
            } else {
                head
            }
        }
    }
}
