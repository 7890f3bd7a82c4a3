//! Session-log path resolution
//!
//! The bridge never reads or writes transcript content; it only needs to
//! resolve where the agent keeps the log for a given (working directory,
//! session file) pair so a resumed session can be pointed at it.

use std::path::{Path, PathBuf};

use crate::session::session_file_name;

/// Directory holding session logs for a working directory
///
/// Follows the agent's on-disk layout: one directory per project under
/// `~/.pi/sessions`, named by the project path with separators flattened.
pub fn sessions_dir(working_dir: &Path) -> PathBuf {
    let encoded = working_dir
        .to_string_lossy()
        .replace(['/', '\\'], "-");
    home_dir().join(".pi").join("sessions").join(encoded)
}

/// Absolute path of the session log for a session-file reference
pub fn session_log_path(working_dir: &Path, session_file: &str) -> PathBuf {
    sessions_dir(working_dir).join(session_file_name(session_file))
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sessions_dir_encodes_project_path() {
        let dir = sessions_dir(Path::new("/home/user/proj"));
        assert!(dir.ends_with(".pi/sessions/-home-user-proj"));
    }

    #[test]
    fn test_log_path_uses_base_name() {
        let direct = session_log_path(Path::new("/proj"), "abc.jsonl");
        let pathed = session_log_path(Path::new("/proj"), "/elsewhere/abc.jsonl");
        assert_eq!(direct, pathed);
        assert!(direct.ends_with("-proj/abc.jsonl"));
    }
}
