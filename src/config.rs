use crate::bridge::{DelegateBridge, ProtocolFiles, ResumeFlags};
use crate::errors::OrchestratorError;
use crate::phase::WorkflowMode;
use crate::settings::PhasegateToml;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

static TASK_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(TASK-[A-Za-z0-9]+(?:\.[0-9]+)*)").expect("task id pattern is valid")
});

/// Flags as given on the command line; `None` means "use the settings file".
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub source: PathBuf,
    pub output: Option<PathBuf>,
    pub mode: Option<String>,
    pub task_id: Option<String>,
    pub max_items: Option<usize>,
    pub dry_run: bool,
    pub resume: bool,
    pub skip_delegates: bool,
    pub skip_external_analysis: bool,
    pub verbose: bool,
}

/// Immutable configuration for one orchestrator run.
///
/// Paths are absolute. Built once per invocation by [`OrchestrationConfig::build`].
#[derive(Clone)]
pub struct OrchestrationConfig {
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub work_dir: PathBuf,
    pub task_id: Option<String>,
    pub mode: WorkflowMode,
    pub dry_run: bool,
    pub resume: bool,
    pub skip_delegates: bool,
    pub skip_external_analysis: bool,
    pub max_items: usize,
    pub verbose: bool,
    pub bridge_prefix: String,
    pub operation: String,
    pub tasks_root: PathBuf,
    bridge: Option<Arc<dyn DelegateBridge>>,
}

impl fmt::Debug for OrchestrationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestrationConfig")
            .field("source_path", &self.source_path)
            .field("output_path", &self.output_path)
            .field("work_dir", &self.work_dir)
            .field("task_id", &self.task_id)
            .field("mode", &self.mode)
            .field("dry_run", &self.dry_run)
            .field("resume", &self.resume)
            .field("skip_delegates", &self.skip_delegates)
            .field("skip_external_analysis", &self.skip_external_analysis)
            .field("max_items", &self.max_items)
            .field("injected_bridge", &self.bridge.is_some())
            .finish_non_exhaustive()
    }
}

impl OrchestrationConfig {
    /// Resolve CLI options against the settings file.
    pub fn build(
        work_dir: &Path,
        settings: &PhasegateToml,
        options: RunOptions,
    ) -> Result<Self, OrchestratorError> {
        let work_dir = work_dir.canonicalize().map_err(|e| {
            OrchestratorError::configuration(format!(
                "working directory {} is not accessible: {}",
                work_dir.display(),
                e
            ))
        })?;

        let source = absolutize(&work_dir, &options.source);
        let source_path = source.canonicalize().map_err(|_| {
            OrchestratorError::configuration(format!(
                "source path {} does not exist",
                source.display()
            ))
        })?;

        let mode = match options.mode.as_deref() {
            Some(raw) => raw
                .parse()
                .map_err(|e: anyhow::Error| OrchestratorError::configuration(e.to_string()))?,
            None => settings.defaults.mode,
        };

        let task_id = options.task_id.or_else(|| derive_task_id(&source_path));
        let output_path = match options.output {
            Some(out) => absolutize(&work_dir, &out),
            None => work_dir
                .join("phasegate-output")
                .join(task_id.clone().unwrap_or_else(|| source_stem(&source_path))),
        };
        if output_path == source_path || source_path.starts_with(&output_path) {
            return Err(OrchestratorError::configuration(format!(
                "output path {} would overwrite the source",
                output_path.display()
            )));
        }
        if work_dir.starts_with(&output_path) {
            return Err(OrchestratorError::configuration(format!(
                "output path {} would replace the working directory {}",
                output_path.display(),
                work_dir.display()
            )));
        }

        Ok(Self {
            source_path,
            output_path,
            task_id,
            mode,
            dry_run: options.dry_run,
            resume: options.resume,
            skip_delegates: options.skip_delegates,
            skip_external_analysis: options.skip_external_analysis,
            max_items: options.max_items.unwrap_or(settings.defaults.max_items),
            verbose: options.verbose,
            bridge_prefix: settings.bridge.prefix.clone(),
            operation: settings.bridge.operation.clone(),
            tasks_root: absolutize(&work_dir, &settings.tasks.root),
            work_dir,
            bridge: None,
        })
    }

    /// Use the given bridge instead of the file bridge.
    pub fn with_bridge(mut self, bridge: Arc<dyn DelegateBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn injected_bridge(&self) -> Option<Arc<dyn DelegateBridge>> {
        self.bridge.clone()
    }

    pub fn protocol_files(&self) -> ProtocolFiles {
        ProtocolFiles::new(&self.work_dir, &self.bridge_prefix, &self.operation)
    }

    pub fn resume_flags(&self) -> ResumeFlags {
        ResumeFlags {
            mode: self.mode,
            dry_run: self.dry_run,
            skip_delegates: self.skip_delegates,
            skip_external_analysis: self.skip_external_analysis,
            max_items: self.max_items,
            verbose: self.verbose,
        }
    }
}

/// `TASK-042-add-login.md` yields `TASK-042`.
pub fn derive_task_id(source: &Path) -> Option<String> {
    let stem = source.file_stem()?.to_string_lossy();
    TASK_ID.captures(&stem).map(|c| c[1].to_string())
}

fn source_stem(source: &Path) -> String {
    source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "task".to_string())
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn options(source: &str) -> RunOptions {
        RunOptions {
            source: PathBuf::from(source),
            ..RunOptions::default()
        }
    }

    #[test]
    fn test_derive_task_id() {
        assert_eq!(
            derive_task_id(Path::new("tasks/backlog/TASK-042-add-login.md")).as_deref(),
            Some("TASK-042")
        );
        assert_eq!(
            derive_task_id(Path::new("TASK-1.2.md")).as_deref(),
            Some("TASK-1.2")
        );
        assert_eq!(derive_task_id(Path::new("notes.md")), None);
    }

    #[test]
    fn test_build_resolves_paths_and_defaults() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("TASK-007-cache.md"), "# Cache").unwrap();

        let config = OrchestrationConfig::build(
            dir.path(),
            &PhasegateToml::default(),
            options("TASK-007-cache.md"),
        )
        .unwrap();

        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.work_dir, root);
        assert_eq!(config.source_path, root.join("TASK-007-cache.md"));
        assert_eq!(config.task_id.as_deref(), Some("TASK-007"));
        assert_eq!(config.output_path, root.join("phasegate-output/TASK-007"));
        assert_eq!(config.tasks_root, root.join("tasks"));
        assert_eq!(config.mode, WorkflowMode::Standard);
        assert_eq!(config.max_items, 50);
        assert_eq!(
            config.protocol_files().checkpoint(),
            root.join(".phasegate-workflow-state.json")
        );
    }

    #[test]
    fn test_cli_flags_override_settings() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("plan.md"), "x").unwrap();
        let settings = PhasegateToml::parse("[defaults]\nmode = \"micro\"\nmax_items = 5\n").unwrap();

        let mut opts = options("plan.md");
        opts.mode = Some("design-only".into());
        opts.max_items = Some(9);
        opts.task_id = Some("TASK-900".into());
        let config = OrchestrationConfig::build(dir.path(), &settings, opts).unwrap();
        assert_eq!(config.mode, WorkflowMode::DesignOnly);
        assert_eq!(config.max_items, 9);
        assert_eq!(config.task_id.as_deref(), Some("TASK-900"));

        let config = OrchestrationConfig::build(dir.path(), &settings, options("plan.md")).unwrap();
        assert_eq!(config.mode, WorkflowMode::Micro);
        assert_eq!(config.max_items, 5);
        assert_eq!(config.task_id, None);
    }

    #[test]
    fn test_missing_source_is_configuration_error() {
        let dir = tempdir().unwrap();
        let err = OrchestrationConfig::build(
            dir.path(),
            &PhasegateToml::default(),
            options("nope.md"),
        )
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::Configuration(_)));
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_invalid_mode_is_configuration_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.md"), "x").unwrap();
        let mut opts = options("a.md");
        opts.mode = Some("turbo".into());
        let err =
            OrchestrationConfig::build(dir.path(), &PhasegateToml::default(), opts).unwrap_err();
        assert_eq!(err.exit_code(), crate::errors::exit_codes::CONFIGURATION);
    }

    #[test]
    fn test_output_cannot_contain_source() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/a.md"), "x").unwrap();
        let mut opts = options("src/a.md");
        opts.output = Some(PathBuf::from("src"));
        let err =
            OrchestrationConfig::build(dir.path(), &PhasegateToml::default(), opts).unwrap_err();
        assert!(err.to_string().contains("overwrite the source"));
    }

    #[test]
    fn test_output_cannot_be_the_working_directory() {
        let work = tempdir().unwrap();
        let elsewhere = tempdir().unwrap();
        let source = elsewhere.path().join("TASK-008.md");
        fs::write(&source, "x").unwrap();
        let mut opts = options(source.to_str().unwrap());
        opts.output = Some(PathBuf::from("."));
        let err =
            OrchestrationConfig::build(work.path(), &PhasegateToml::default(), opts).unwrap_err();
        assert_eq!(err.exit_code(), crate::errors::exit_codes::CONFIGURATION);
        assert!(err.to_string().contains("would replace the working directory"));
    }
}
