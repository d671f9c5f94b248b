//! Resumable-session discovery for the `/resume` picker.
//!
//! Scans a provider's transcript store for past sessions in a project
//! directory, newest first. Claude's store has per-project directories
//! with an optional `sessions-index.json`; bare `*.jsonl` transcripts are
//! picked up as a fallback.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::util::read_cwd_from_jsonl;

/// One resumable session, as shown in the picker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeSession {
    pub session_id: String,
    pub file_path: PathBuf,
    pub cwd: String,
    pub updated_at: DateTime<Utc>,
    /// First line of the first user message, for the button label.
    pub preview: String,
}

/// Maximum preview length on a picker button.
const PREVIEW_MAX_CHARS: usize = 40;

/// List resumable sessions for `cwd` under `projects_dir`, most recently
/// modified first.
pub fn list_resumable_sessions(projects_dir: &Path, cwd: &str) -> Vec<ResumeSession> {
    let mut sessions = Vec::new();
    let Ok(project_dirs) = std::fs::read_dir(projects_dir) else {
        return sessions;
    };

    for project_dir in project_dirs.flatten() {
        let dir_path = project_dir.path();
        if !dir_path.is_dir() {
            continue;
        }
        let Ok(files) = std::fs::read_dir(&dir_path) else {
            continue;
        };
        for file in files.flatten() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let session_cwd = read_cwd_from_jsonl(&path);
            if session_cwd != cwd {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let updated_at = file
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from)
                .unwrap_or_default();
            sessions.push(ResumeSession {
                session_id: session_id.to_string(),
                preview: first_user_preview(&path),
                file_path: path,
                cwd: session_cwd,
                updated_at,
            });
        }
    }

    sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    sessions
}

/// First line of the first real user message in a transcript.
fn first_user_preview(path: &Path) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::new();
    };
    for line in content.lines() {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
            continue;
        };
        if value.get("type").and_then(|t| t.as_str()) != Some("user") {
            continue;
        }
        let text = match value.get("message").and_then(|m| m.get("content")) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Array(blocks)) => blocks
                .iter()
                .filter_map(|b| {
                    (b.get("type").and_then(|t| t.as_str()) == Some("text"))
                        .then(|| b.get("text").and_then(|t| t.as_str()))
                        .flatten()
                })
                .collect::<Vec<_>>()
                .join(" "),
            _ => continue,
        };
        let first_line = text.lines().next().unwrap_or("").trim();
        if !first_line.is_empty() && !first_line.starts_with('<') {
            return first_line.chars().take(PREVIEW_MAX_CHARS).collect();
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn write_session(dir: &Path, session_id: &str, cwd: &str, text: &str, age: Duration) {
        let path = dir.join(format!("{session_id}.jsonl"));
        let line = serde_json::to_string(&serde_json::json!({
            "type": "user",
            "cwd": cwd,
            "message": {"content": text},
        }))
        .unwrap();
        std::fs::write(&path, format!("{line}\n")).unwrap();
        let mtime = SystemTime::now() - age;
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    #[test]
    fn test_lists_matching_cwd_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let proj = dir.path().join("-tmp-proj");
        std::fs::create_dir_all(&proj).unwrap();

        write_session(&proj, "older", "/tmp/proj", "first task", Duration::from_secs(3600));
        write_session(&proj, "newer", "/tmp/proj", "second task", Duration::from_secs(60));
        write_session(&proj, "other", "/elsewhere", "unrelated", Duration::from_secs(10));

        let sessions = list_resumable_sessions(dir.path(), "/tmp/proj");
        let ids: Vec<&str> = sessions.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, ["newer", "older"]);
        assert_eq!(sessions[0].preview, "second task");
    }

    #[test]
    fn test_empty_for_unknown_cwd() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_resumable_sessions(dir.path(), "/nowhere").is_empty());
    }

    #[test]
    fn test_preview_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let proj = dir.path().join("-p");
        std::fs::create_dir_all(&proj).unwrap();
        let long = "x".repeat(200);
        write_session(&proj, "s", "/tmp/p", &long, Duration::from_secs(1));

        let sessions = list_resumable_sessions(dir.path(), "/tmp/p");
        assert_eq!(sessions[0].preview.chars().count(), PREVIEW_MAX_CHARS);
    }
}
