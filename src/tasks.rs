//! File-backed task store.
//!
//! Tasks live under `<root>/<state>/` as `TASK-ID.md` or `TASK-ID-*.md`,
//! optionally one level down inside a feature folder. Frontmatter is YAML.

use chrono::Utc;
use glob::Pattern;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// State directories, in lookup order.
pub const STATE_DIRS: [&str; 5] = ["in_progress", "backlog", "blocked", "in_review", "completed"];

#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("Task {task_id} not found under {root}")]
    NotFound { task_id: String, root: PathBuf },

    #[error("Invalid frontmatter in {path}: {message}")]
    Frontmatter { path: PathBuf, message: String },

    #[error("Task store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub trait TaskStore {
    /// Move the task to the blocked state, recording why. Returns the new path.
    fn move_to_blocked(&self, task_id: &str, reason: &str) -> Result<PathBuf, TaskStoreError>;
}

pub struct FileTaskStore {
    root: PathBuf,
    dry_run: bool,
}

impl FileTaskStore {
    pub fn new(root: PathBuf, dry_run: bool) -> Self {
        Self { root, dry_run }
    }

    /// Locate a task file in any state directory.
    pub fn find(&self, task_id: &str) -> Option<PathBuf> {
        let root = Pattern::escape(&self.root.to_string_lossy());
        let id = Pattern::escape(task_id);
        for state in STATE_DIRS {
            let templates = [
                format!("{root}/{state}/{id}.md"),
                format!("{root}/{state}/{id}-*.md"),
                format!("{root}/{state}/*/{id}.md"),
                format!("{root}/{state}/*/{id}-*.md"),
            ];
            for pattern in templates {
                let Ok(paths) = glob::glob(&pattern) else {
                    continue;
                };
                if let Some(path) = paths.filter_map(|p| p.ok()).min() {
                    return Some(path);
                }
            }
        }
        None
    }
}

impl TaskStore for FileTaskStore {
    fn move_to_blocked(&self, task_id: &str, reason: &str) -> Result<PathBuf, TaskStoreError> {
        let current = self.find(task_id).ok_or_else(|| TaskStoreError::NotFound {
            task_id: task_id.to_string(),
            root: self.root.clone(),
        })?;
        let blocked_dir = self.root.join("blocked");
        let file_name = current.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        let target = blocked_dir.join(file_name);

        if self.dry_run {
            tracing::info!(task_id, target = %target.display(), "dry run: task not moved");
            return Ok(target);
        }

        let content = fs::read_to_string(&current).map_err(|source| TaskStoreError::Io {
            path: current.clone(),
            source,
        })?;
        let updated = mark_blocked(&content, reason).map_err(|message| {
            TaskStoreError::Frontmatter {
                path: current.clone(),
                message,
            }
        })?;

        fs::create_dir_all(&blocked_dir).map_err(|source| TaskStoreError::Io {
            path: blocked_dir.clone(),
            source,
        })?;
        fs::write(&target, updated).map_err(|source| TaskStoreError::Io {
            path: target.clone(),
            source,
        })?;
        if current != target {
            fs::remove_file(&current).map_err(|source| TaskStoreError::Io {
                path: current.clone(),
                source,
            })?;
        }
        tracing::info!(task_id, from = %current.display(), to = %target.display(), "task moved to blocked");
        Ok(target)
    }
}

/// Split `---\n<yaml>\n---\n<body>`; `None` when there is no frontmatter.
pub(crate) fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---\n").or_else(|| content.strip_prefix("---\r\n"))?;
    let (yaml, after) = match rest.strip_prefix("---") {
        // Empty block: the closing fence is the very next line.
        Some(after) => ("", after),
        None => {
            let end = rest.find("\n---")?;
            (&rest[..end], &rest[end + 4..])
        }
    };
    let body = after
        .strip_prefix("\r\n")
        .or_else(|| after.strip_prefix('\n'))
        .unwrap_or(after);
    Some((yaml, body))
}

/// Set `status: blocked`, `blocked_reason`, and `blocked_at` in the frontmatter.
fn mark_blocked(content: &str, reason: &str) -> Result<String, String> {
    let (mut meta, body) = match split_frontmatter(content) {
        Some((yaml, body)) if yaml.trim().is_empty() => (Mapping::new(), body),
        Some((yaml, body)) => match serde_yaml::from_str::<Value>(yaml).map_err(|e| e.to_string())? {
            Value::Mapping(map) => (map, body),
            _ => return Err("frontmatter is not a mapping".to_string()),
        },
        None => (Mapping::new(), content),
    };
    meta.insert("status".into(), "blocked".into());
    meta.insert("blocked_reason".into(), reason.into());
    meta.insert("blocked_at".into(), Utc::now().to_rfc3339().into());

    let yaml = serde_yaml::to_string(&meta).map_err(|e| e.to_string())?;
    Ok(format!("---\n{}---\n{}", yaml, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_task(root: &Path, rel: &str, content: &str) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn frontmatter(path: &Path) -> Mapping {
        let content = fs::read_to_string(path).unwrap();
        let (yaml, _) = split_frontmatter(&content).unwrap();
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_find_exact_and_descriptive_names() {
        let dir = tempdir().unwrap();
        write_task(dir.path(), "backlog/TASK-001.md", "x");
        write_task(dir.path(), "in_review/TASK-002-add-cache.md", "x");
        write_task(dir.path(), "in_progress/auth-feature/TASK-003-login.md", "x");
        let store = FileTaskStore::new(dir.path().to_path_buf(), false);

        assert!(store.find("TASK-001").unwrap().ends_with("backlog/TASK-001.md"));
        assert!(store.find("TASK-002").unwrap().ends_with("in_review/TASK-002-add-cache.md"));
        assert!(
            store
                .find("TASK-003")
                .unwrap()
                .ends_with("auth-feature/TASK-003-login.md")
        );
        assert!(store.find("TASK-004").is_none());
    }

    #[test]
    fn test_find_does_not_match_longer_ids() {
        let dir = tempdir().unwrap();
        write_task(dir.path(), "backlog/TASK-0010.md", "x");
        let store = FileTaskStore::new(dir.path().to_path_buf(), false);
        assert!(store.find("TASK-001").is_none());
    }

    #[test]
    fn test_move_to_blocked_updates_frontmatter() {
        let dir = tempdir().unwrap();
        let original = write_task(
            dir.path(),
            "in_progress/TASK-010-api.md",
            "---\nid: TASK-010\ntitle: Build API\nstatus: in_progress\n---\n# Build API\n\nBody.\n",
        );
        let store = FileTaskStore::new(dir.path().to_path_buf(), false);

        let moved = store
            .move_to_blocked("TASK-010", "Phase 3 gate violation")
            .unwrap();
        assert_eq!(moved, dir.path().join("blocked/TASK-010-api.md"));
        assert!(!original.exists());

        let meta = frontmatter(&moved);
        assert_eq!(meta.get("status").and_then(Value::as_str), Some("blocked"));
        assert_eq!(meta.get("title").and_then(Value::as_str), Some("Build API"));
        assert_eq!(
            meta.get("blocked_reason").and_then(Value::as_str),
            Some("Phase 3 gate violation")
        );
        assert!(meta.get("blocked_at").is_some());
        assert!(fs::read_to_string(&moved).unwrap().ends_with("# Build API\n\nBody.\n"));
    }

    #[test]
    fn test_move_adds_frontmatter_when_missing() {
        let dir = tempdir().unwrap();
        write_task(dir.path(), "backlog/TASK-011.md", "# Plain task\n");
        let store = FileTaskStore::new(dir.path().to_path_buf(), false);
        let moved = store.move_to_blocked("TASK-011", "blocked").unwrap();
        let content = fs::read_to_string(&moved).unwrap();
        assert!(content.starts_with("---\n"));
        assert!(content.ends_with("# Plain task\n"));
        assert_eq!(
            frontmatter(&moved).get("status").and_then(Value::as_str),
            Some("blocked")
        );
    }

    #[test]
    fn test_already_blocked_task_is_updated_in_place() {
        let dir = tempdir().unwrap();
        let path = write_task(dir.path(), "blocked/TASK-012.md", "---\nstatus: blocked\n---\n");
        let store = FileTaskStore::new(dir.path().to_path_buf(), false);
        let moved = store.move_to_blocked("TASK-012", "again").unwrap();
        assert_eq!(moved, path);
        assert!(path.exists());
        assert_eq!(
            frontmatter(&path).get("blocked_reason").and_then(Value::as_str),
            Some("again")
        );
    }

    #[test]
    fn test_split_empty_frontmatter() {
        assert_eq!(split_frontmatter("---\n---\n# Body\n"), Some(("", "# Body\n")));
        assert_eq!(split_frontmatter("---\r\n---\r\nx"), Some(("", "x")));
        assert_eq!(
            split_frontmatter("---\nid: T\n---\nx"),
            Some(("id: T", "x"))
        );
        assert_eq!(split_frontmatter("# no frontmatter\n"), None);
    }

    #[test]
    fn test_empty_frontmatter_is_filled_not_duplicated() {
        let dir = tempdir().unwrap();
        write_task(dir.path(), "in_progress/TASK-014.md", "---\n---\n# Body\n");
        let store = FileTaskStore::new(dir.path().to_path_buf(), false);
        let moved = store.move_to_blocked("TASK-014", "gate").unwrap();

        let content = fs::read_to_string(&moved).unwrap();
        assert!(content.starts_with("---\n"));
        assert_eq!(content.lines().filter(|l| *l == "---").count(), 2);
        assert!(content.ends_with("# Body\n"));
        assert_eq!(
            frontmatter(&moved).get("status").and_then(Value::as_str),
            Some("blocked")
        );
    }

    #[test]
    fn test_missing_task_is_not_found() {
        let dir = tempdir().unwrap();
        let store = FileTaskStore::new(dir.path().to_path_buf(), false);
        let err = store.move_to_blocked("TASK-404", "x").unwrap_err();
        assert!(matches!(err, TaskStoreError::NotFound { .. }));
    }

    #[test]
    fn test_dry_run_leaves_task_in_place() {
        let dir = tempdir().unwrap();
        let path = write_task(dir.path(), "backlog/TASK-013.md", "# t\n");
        let store = FileTaskStore::new(dir.path().to_path_buf(), true);
        let target = store.move_to_blocked("TASK-013", "x").unwrap();
        assert!(path.exists());
        assert!(!target.exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), "# t\n");
    }
}
