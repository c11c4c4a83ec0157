//! CLI command implementations.
//!
//! | Module   | Commands handled                              |
//! |----------|-----------------------------------------------|
//! | `run`    | `Run`                                         |
//! | `bridge` | `Bridge Status`, `Bridge Respond`, `Bridge Clear` |
//!
//! Commands return the process exit code; `main` is the only place that exits.

pub mod bridge;
pub mod run;

pub use bridge::{Reply, cmd_bridge_clear, cmd_bridge_respond, cmd_bridge_status};
pub use run::cmd_run;

use anyhow::Result;
use phasegate::settings::PhasegateToml;
use std::path::Path;

/// Settings file plus `PHASEGATE_*` overrides, with validation warnings logged.
fn load_settings(work_dir: &Path) -> Result<PhasegateToml> {
    let mut settings = PhasegateToml::load_or_default(work_dir)?;
    settings.apply_env()?;
    for warning in settings.validate() {
        tracing::warn!("{}", warning);
    }
    Ok(settings)
}
