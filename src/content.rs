//! Content collaborator: task context, delegate payloads, local fallbacks.
//!
//! The orchestrator treats everything here as opaque text and only calls it
//! through [`ContentGenerator`].

use crate::orchestrator::state::PartialState;
use crate::phase::PhaseId;
use crate::tasks::split_frontmatter;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use walkdir::WalkDir;

static FILE_MENTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9_./-]+\.(?:rs|py|ts|tsx|js|go|java|kt|rb|cs|md|toml|json|ya?ml|sql)\b")
        .expect("file mention pattern is valid")
});

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#\s+(.+)$").expect("heading pattern is valid"));

const SKIP_DIRS: &[&str] = &["target", "node_modules", "__pycache__"];

const ADVANCED_PATTERNS: &[&str] = &["saga", "cqrs", "event sourcing", "mediator", "event-driven"];
const MODERATE_PATTERNS: &[&str] = &["strategy", "observer", "decorator", "command", "adapter"];

const RISK_CATEGORIES: &[(&str, &[&str])] = &[
    (
        "security",
        &["auth", "encryption", "permission", "security", "password", "token", "oauth"],
    ),
    ("data_integrity", &["schema", "migration", "database", "sql"]),
    (
        "external_integration",
        &["api", "third-party", "integration", "external", "webhook"],
    ),
    ("performance", &["optimization", "caching", "scaling", "performance"]),
];

/// Everything the pipeline knows about the task before any delegate runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// True when the file listing stopped at `max_items`
    #[serde(default)]
    pub truncated: bool,
}

impl TaskContext {
    pub fn render(&self) -> String {
        let mut out = String::new();
        match &self.task_id {
            Some(id) => out.push_str(&format!("# {}: {}\n\n", id, self.title)),
            None => out.push_str(&format!("# {}\n\n", self.title)),
        }
        out.push_str(self.description.trim_end());
        out.push('\n');
        if !self.files.is_empty() {
            out.push_str("\n## Files\n\n");
            for file in &self.files {
                out.push_str(&format!("- {}\n", file.display()));
            }
            if self.truncated {
                out.push_str("- ... (listing truncated)\n");
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewMode {
    AutoProceed,
    QuickOptional,
    FullRequired,
}

impl ReviewMode {
    pub fn for_score(score: u8) -> Self {
        match score {
            0..=3 => ReviewMode::AutoProceed,
            4..=6 => ReviewMode::QuickOptional,
            _ => ReviewMode::FullRequired,
        }
    }
}

impl fmt::Display for ReviewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewMode::AutoProceed => write!(f, "auto-proceed"),
            ReviewMode::QuickOptional => write!(f, "optional review"),
            ReviewMode::FullRequired => write!(f, "review required"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactorScore {
    pub name: &'static str,
    pub score: u8,
    pub max_score: u8,
    pub justification: String,
}

/// Locally computed complexity, used when no delegate score is available.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplexityAssessment {
    pub score: u8,
    pub review: ReviewMode,
    pub factors: Vec<FactorScore>,
}

impl ComplexityAssessment {
    pub fn render(&self) -> String {
        let mut out = format!(
            "Complexity score: {}/10 ({})\n\n",
            self.score, self.review
        );
        for f in &self.factors {
            out.push_str(&format!(
                "- {}: {}/{} - {}\n",
                f.name, f.score, f.max_score, f.justification
            ));
        }
        out
    }
}

/// Builds the text that flows through the pipeline.
pub trait ContentGenerator: Send + Sync {
    /// Load the task context from a task file or a directory.
    fn load_context(&self, source: &Path, task_id: Option<&str>, max_items: usize)
    -> Result<TaskContext>;

    /// The payload sent to a phase's delegate.
    fn build_payload(&self, phase: PhaseId, depends_on: &[PhaseId], state: &PartialState) -> String;

    /// Local substitute for a degradable phase's output.
    fn fallback(&self, phase: PhaseId, state: &PartialState) -> String;

    /// Local complexity heuristic.
    fn assess_complexity(&self, state: &PartialState) -> ComplexityAssessment;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownContent;

impl ContentGenerator for MarkdownContent {
    fn load_context(
        &self,
        source: &Path,
        task_id: Option<&str>,
        max_items: usize,
    ) -> Result<TaskContext> {
        if source.is_dir() {
            return load_directory(source, task_id, max_items);
        }
        let raw = fs::read_to_string(source)
            .with_context(|| format!("Failed to read task file: {}", source.display()))?;
        let (meta, body) = match split_frontmatter(&raw) {
            Some((yaml, body)) => (
                serde_yaml::from_str::<serde_yaml::Value>(yaml)
                    .with_context(|| format!("Invalid frontmatter in {}", source.display()))?,
                body,
            ),
            None => (serde_yaml::Value::Null, raw.as_str()),
        };
        let meta_str = |key: &str| meta.get(key).and_then(|v| v.as_str()).map(str::to_string);

        let title = meta_str("title")
            .or_else(|| HEADING.captures(body).map(|c| c[1].trim().to_string()))
            .unwrap_or_else(|| stem(source));
        Ok(TaskContext {
            task_id: task_id.map(str::to_string).or_else(|| meta_str("id")),
            title,
            description: body.trim().to_string(),
            files: vec![source.to_path_buf()],
            truncated: false,
        })
    }

    fn build_payload(&self, phase: PhaseId, depends_on: &[PhaseId], state: &PartialState) -> String {
        let mut out = format!("# Phase {}: {}\n\n", phase, phase.description());
        if let Some(delegate) = phase.expected_delegate() {
            out.push_str(&format!("Delegate: {}\n\n", delegate));
        }
        if let Some(context) = &state.context {
            out.push_str("## Task\n\n");
            out.push_str(&context.render());
            out.push('\n');
        }
        let deps = state.dependencies(depends_on);
        if !deps.is_empty() {
            out.push_str("## Inputs from earlier phases\n\n");
            for (dep, artifact) in deps {
                out.push_str(&format!("### Phase {} ({})\n\n", dep, dep.description()));
                out.push_str(artifact.content.trim_end());
                out.push_str("\n\n");
            }
        }
        if phase == PhaseId::Implementation
            && let Some(score) = state.complexity_score
        {
            out.push_str(&format!(
                "Complexity score: {}/10 ({})\n",
                score,
                ReviewMode::for_score(score)
            ));
        }
        out
    }

    fn fallback(&self, phase: PhaseId, state: &PartialState) -> String {
        match phase {
            PhaseId::PatternSuggestions => {
                "No pattern suggestions available; proceeding with the plan as written.\n"
                    .to_string()
            }
            PhaseId::ComplexityEvaluation => self.assess_complexity(state).render(),
            other => format!(
                "Phase {} ({}) produced no delegate output.\n",
                other,
                other.description()
            ),
        }
    }

    fn assess_complexity(&self, state: &PartialState) -> ComplexityAssessment {
        let plan = artifact_text(state, PhaseId::Planning);
        let patterns = artifact_text(state, PhaseId::PatternSuggestions);
        let description = state
            .context
            .as_ref()
            .map(|c| c.description.as_str())
            .unwrap_or_default();

        let mut files: BTreeSet<&str> = FILE_MENTION.find_iter(plan).map(|m| m.as_str()).collect();
        if files.is_empty() {
            files = FILE_MENTION.find_iter(description).map(|m| m.as_str()).collect();
        }
        let factors = vec![
            file_factor(files.len()),
            pattern_factor(&patterns.to_lowercase()),
            risk_factor(&format!("{}\n{}", description, plan).to_lowercase()),
        ];
        let score = factors.iter().map(|f| f.score).sum::<u8>().min(10);
        ComplexityAssessment {
            score,
            review: ReviewMode::for_score(score),
            factors,
        }
    }
}

/// Decode a response payload into artifact text.
///
/// Workers may send plain text, a JSON string, or a JSON object with a
/// `content` field.
pub fn decode_payload(payload: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(serde_json::Value::Object(map)) => match map.get("content") {
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => payload.to_string(),
        },
        _ => payload.to_string(),
    }
}

/// Extract a 0..=10 complexity score from a delegate payload.
pub fn parse_complexity(payload: &str) -> Option<u8> {
    let value: serde_json::Value = serde_json::from_str(payload.trim()).ok()?;
    let score = match &value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::Object(map) => map
            .get("score")
            .or_else(|| map.get("total_score"))
            .and_then(|v| v.as_u64()),
        _ => None,
    }?;
    u8::try_from(score).ok().filter(|s| *s <= 10)
}

fn artifact_text(state: &PartialState, phase: PhaseId) -> &str {
    state
        .artifact(phase)
        .map(|a| a.content.as_str())
        .unwrap_or_default()
}

fn file_factor(count: usize) -> FactorScore {
    let (score, justification) = match count {
        0..=2 => (0, format!("Simple change ({} files)", count)),
        3..=5 => (1, format!("Moderate change ({} files)", count)),
        6..=8 => (2, format!("Complex change ({} files)", count)),
        _ => (3, format!("Very complex change ({} files)", count)),
    };
    FactorScore {
        name: "file_complexity",
        score,
        max_score: 3,
        justification,
    }
}

fn pattern_factor(text: &str) -> FactorScore {
    let (score, justification) = if ADVANCED_PATTERNS.iter().any(|p| text.contains(p)) {
        (2, "Advanced patterns suggested")
    } else if MODERATE_PATTERNS.iter().any(|p| text.contains(p)) {
        (1, "Moderate patterns suggested")
    } else {
        (0, "No specific patterns")
    };
    FactorScore {
        name: "pattern_familiarity",
        score,
        max_score: 2,
        justification: justification.to_string(),
    }
}

fn risk_factor(text: &str) -> FactorScore {
    let categories: Vec<&str> = RISK_CATEGORIES
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| text.contains(k)))
        .map(|(name, _)| *name)
        .collect();
    let score = match categories.len() {
        0 => 0,
        1 | 2 => 1,
        3 => 2,
        _ => 3,
    };
    let justification = if categories.is_empty() {
        "No significant risk indicators".to_string()
    } else {
        format!("Risk categories: {}", categories.join(", "))
    };
    FactorScore {
        name: "risk_level",
        score,
        max_score: 3,
        justification,
    }
}

fn load_directory(dir: &Path, task_id: Option<&str>, max_items: usize) -> Result<TaskContext> {
    let mut files = Vec::new();
    let mut truncated = false;
    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            e.depth() == 0 || !(name.starts_with('.') || SKIP_DIRS.contains(&name.as_ref()))
        });
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to scan {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if files.len() >= max_items {
            truncated = true;
            break;
        }
        files.push(entry.path().strip_prefix(dir).unwrap_or(entry.path()).to_path_buf());
    }
    tracing::debug!(dir = %dir.display(), files = files.len(), truncated, "scanned task directory");

    let readme = dir.join("README.md");
    let description = if readme.is_file() {
        fs::read_to_string(&readme)
            .with_context(|| format!("Failed to read {}", readme.display()))?
    } else {
        format!("Task directory {} ({} files).", dir.display(), files.len())
    };
    Ok(TaskContext {
        task_id: task_id.map(str::to_string),
        title: stem(dir),
        description,
        files,
        truncated,
    })
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "task".to_string())
}
