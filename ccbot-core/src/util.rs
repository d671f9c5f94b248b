//! Shared filesystem helpers used across modules.
//!
//! Crash-safe JSON writes (temp file + fsync + atomic rename) and the
//! transcript cwd probe shared by the session manager and monitor.

use std::io::Write;
use std::path::Path;

use serde::Serialize;

/// Write JSON to a file atomically.
///
/// Serializes into a temporary file in the same directory, fsyncs, then
/// renames over the target. Interrupting the process mid-write leaves the
/// previous file intact.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be created, the temp file
/// cannot be written, or the rename fails.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let content = serde_json::to_vec_pretty(data)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(&content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read the `cwd` field from the first JSONL entry that has one.
///
/// Used to associate bare transcript files (not covered by a session
/// index) with a project directory. Returns an empty string when the file
/// is unreadable or no entry carries a cwd.
pub fn read_cwd_from_jsonl(path: &Path) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::new();
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line)
            && let Some(cwd) = value.get("cwd").and_then(|c| c.as_str())
            && !cwd.is_empty()
        {
            return cwd.to_string();
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let data = serde_json::json!({"a": 1, "b": ["x", "y"]});

        atomic_write_json(&path, &data).unwrap();

        let loaded: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, data);
    }

    #[test]
    fn test_atomic_write_json_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deep").join("state.json");

        atomic_write_json(&path, &serde_json::json!({})).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_read_cwd_from_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(
            &path,
            "not json\n{\"type\":\"meta\"}\n{\"type\":\"user\",\"cwd\":\"/tmp/proj\"}\n",
        )
        .unwrap();

        assert_eq!(read_cwd_from_jsonl(&path), "/tmp/proj");
    }

    #[test]
    fn test_read_cwd_from_jsonl_missing_file() {
        assert_eq!(read_cwd_from_jsonl(Path::new("/nonexistent/x.jsonl")), "");
    }
}
