//! Session key construction
//!
//! A session is identified by its normalized absolute working directory plus
//! either the base name of its session file or the "new" sentinel for
//! sessions that have not written a transcript yet. Equivalent paths and
//! file references must always collide to the same key.

use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Sentinel used in place of a session-file name for brand-new sessions
pub const NEW_SESSION_SENTINEL: &str = "new";

/// Lookup key for a managed session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    /// Build a key from a normalized working directory and an optional
    /// session-file reference
    ///
    /// Only the base name of the session file participates in the key, so
    /// `abc.jsonl` and `/anywhere/abc.jsonl` refer to the same session.
    pub fn new(working_dir: &Path, session_file: Option<&str>) -> Self {
        let name = session_file
            .map(session_file_name)
            .unwrap_or_else(|| NEW_SESSION_SENTINEL.to_string());
        Self(format!("{}::{}", working_dir.display(), name))
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Extract the base name of a session-file reference
pub fn session_file_name(reference: &str) -> String {
    Path::new(reference)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| reference.to_string())
}

/// Resolve a working directory to a normalized absolute path
///
/// Relative paths are resolved against the bridge's current directory, and
/// `.` / `..` components are collapsed lexically. Symlinks are left alone;
/// consistency is what matters for key equality, not canonical identity.
pub fn normalize_working_dir(raw: &str) -> std::io::Result<PathBuf> {
    let path = Path::new(raw);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equivalent_paths_share_a_key() {
        let a = normalize_working_dir("/proj").unwrap();
        let b = normalize_working_dir("/proj/.").unwrap();
        let c = normalize_working_dir("/proj/sub/..").unwrap();
        assert_eq!(SessionKey::new(&a, None), SessionKey::new(&b, None));
        assert_eq!(SessionKey::new(&a, None), SessionKey::new(&c, None));
    }

    #[test]
    fn test_session_file_base_name() {
        let dir = normalize_working_dir("/proj").unwrap();
        let plain = SessionKey::new(&dir, Some("abc.jsonl"));
        let pathed = SessionKey::new(&dir, Some("/home/user/.pi/sessions/x/abc.jsonl"));
        assert_eq!(plain, pathed);
    }

    #[test]
    fn test_new_sentinel_differs_from_named() {
        let dir = normalize_working_dir("/proj").unwrap();
        assert_ne!(
            SessionKey::new(&dir, None),
            SessionKey::new(&dir, Some("abc.jsonl"))
        );
    }

    #[test]
    fn test_different_dirs_differ() {
        let a = normalize_working_dir("/proj-a").unwrap();
        let b = normalize_working_dir("/proj-b").unwrap();
        assert_ne!(SessionKey::new(&a, None), SessionKey::new(&b, None));
    }

    #[test]
    fn test_relative_dir_becomes_absolute() {
        let resolved = normalize_working_dir("some/dir").unwrap();
        assert!(resolved.is_absolute());
    }
}
