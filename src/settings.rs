//! Project settings read from `.phasegate/phasegate.toml`.
//!
//! Layered the usual way: file, then environment, then CLI flags (applied by
//! [`crate::config::OrchestrationConfig::build`]).
//!
//! # Settings File Format
//!
//! ```toml
//! [project]
//! name = "my-project"
//!
//! [defaults]
//! mode = "standard"
//! max_items = 50
//!
//! [bridge]
//! prefix = "phasegate"
//! operation = "workflow"
//!
//! [tasks]
//! root = "tasks"
//! ```

use crate::phase::WorkflowMode;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const SETTINGS_DIR: &str = ".phasegate";
pub const SETTINGS_FILE: &str = "phasegate.toml";

static FILE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("file token pattern is valid")
});

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSection {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsSection {
    #[serde(default)]
    pub mode: WorkflowMode,
    /// Upper bound on files scanned when loading task context
    #[serde(default = "default_max_items")]
    pub max_items: usize,
}

fn default_max_items() -> usize {
    50
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            mode: WorkflowMode::default(),
            max_items: default_max_items(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSection {
    /// Protocol files are named `.<prefix>-request.json` and so on
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Names the checkpoint file `.<prefix>-<operation>-state.json`
    #[serde(default = "default_operation")]
    pub operation: String,
}

fn default_prefix() -> String {
    "phasegate".to_string()
}

fn default_operation() -> String {
    "workflow".to_string()
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            operation: default_operation(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksSection {
    /// Task store root, relative to the working directory
    #[serde(default = "default_tasks_root")]
    pub root: PathBuf,
}

fn default_tasks_root() -> PathBuf {
    PathBuf::from("tasks")
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            root: default_tasks_root(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhasegateToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub tasks: TasksSection,
}

impl PhasegateToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse phasegate.toml")
    }

    /// Load from `<work_dir>/.phasegate/phasegate.toml`, or defaults when absent.
    pub fn load_or_default(work_dir: &Path) -> Result<Self> {
        let path = work_dir.join(SETTINGS_DIR).join(SETTINGS_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `PHASEGATE_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("PHASEGATE_MODE") {
            self.defaults.mode = mode
                .parse()
                .with_context(|| "Invalid PHASEGATE_MODE".to_string())?;
        }
        if let Some(max) = lookup("PHASEGATE_MAX_ITEMS") {
            self.defaults.max_items = max
                .trim()
                .parse()
                .with_context(|| format!("Invalid PHASEGATE_MAX_ITEMS '{}'", max))?;
        }
        if let Some(root) = lookup("PHASEGATE_TASKS_ROOT") {
            self.tasks.root = PathBuf::from(root);
        }
        Ok(())
    }

    /// Validate the settings and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.defaults.max_items == 0 {
            warnings.push("max_items is 0: task context will list no files".to_string());
        }
        if !FILE_TOKEN.is_match(&self.bridge.prefix) {
            warnings.push(format!(
                "Invalid bridge prefix '{}': use letters, digits, '-' or '_'",
                self.bridge.prefix
            ));
        }
        if !FILE_TOKEN.is_match(&self.bridge.operation) {
            warnings.push(format!(
                "Invalid bridge operation '{}': use letters, digits, '-' or '_'",
                self.bridge.operation
            ));
        }
        if self.tasks.root.is_absolute() {
            warnings.push(format!(
                "tasks.root '{}' is absolute; it is normally relative to the working directory",
                self.tasks.root.display()
            ));
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = PhasegateToml::default();
        assert_eq!(settings.defaults.mode, WorkflowMode::Standard);
        assert_eq!(settings.defaults.max_items, 50);
        assert_eq!(settings.bridge.prefix, "phasegate");
        assert_eq!(settings.bridge.operation, "workflow");
        assert_eq!(settings.tasks.root, PathBuf::from("tasks"));
        assert!(settings.validate().is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let content = r#"
[project]
name = "demo"

[defaults]
mode = "design-only"
max_items = 10

[bridge]
prefix = "acme"
operation = "enhance"

[tasks]
root = "work/tasks"
"#;
        let settings = PhasegateToml::parse(content).unwrap();
        assert_eq!(settings.project.name.as_deref(), Some("demo"));
        assert_eq!(settings.defaults.mode, WorkflowMode::DesignOnly);
        assert_eq!(settings.defaults.max_items, 10);
        assert_eq!(settings.bridge.prefix, "acme");
        assert_eq!(settings.bridge.operation, "enhance");
        assert_eq!(settings.tasks.root, PathBuf::from("work/tasks"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings = PhasegateToml::parse("[defaults]\nmode = \"micro\"\n").unwrap();
        assert_eq!(settings.defaults.mode, WorkflowMode::Micro);
        assert_eq!(settings.defaults.max_items, 50);
        assert_eq!(settings.bridge.prefix, "phasegate");
    }

    #[test]
    fn test_unknown_mode_in_file_is_rejected() {
        assert!(PhasegateToml::parse("[defaults]\nmode = \"turbo\"\n").is_err());
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let settings = PhasegateToml::load_or_default(dir.path()).unwrap();
        assert_eq!(settings.defaults.max_items, 50);
    }

    #[test]
    fn test_load_or_default_reads_file() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(SETTINGS_DIR)).unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_DIR).join(SETTINGS_FILE),
            "[defaults]\nmax_items = 7\n",
        )
        .unwrap();
        let settings = PhasegateToml::load_or_default(dir.path()).unwrap();
        assert_eq!(settings.defaults.max_items, 7);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut settings = PhasegateToml::parse("[defaults]\nmode = \"micro\"\n").unwrap();
        settings
            .apply_env_from(env(&[
                ("PHASEGATE_MODE", "implement_only"),
                ("PHASEGATE_MAX_ITEMS", "3"),
                ("PHASEGATE_TASKS_ROOT", "other"),
            ]))
            .unwrap();
        assert_eq!(settings.defaults.mode, WorkflowMode::ImplementOnly);
        assert_eq!(settings.defaults.max_items, 3);
        assert_eq!(settings.tasks.root, PathBuf::from("other"));
    }

    #[test]
    fn test_invalid_env_is_an_error() {
        let mut settings = PhasegateToml::default();
        assert!(settings.apply_env_from(env(&[("PHASEGATE_MAX_ITEMS", "lots")])).is_err());
        assert!(settings.apply_env_from(env(&[("PHASEGATE_MODE", "fast")])).is_err());
    }

    #[test]
    fn test_validate_flags_bad_values() {
        let mut settings = PhasegateToml::default();
        settings.defaults.max_items = 0;
        settings.bridge.prefix = "../evil".into();
        settings.bridge.operation = "a b".into();
        let warnings = settings.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings[1].contains("../evil"));
    }
}
