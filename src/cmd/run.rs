//! Pipeline execution: `phasegate run`.

use anyhow::Result;
use phasegate::config::{OrchestrationConfig, RunOptions};
use phasegate::errors::exit_codes;
use phasegate::orchestrator::Orchestrator;
use phasegate::ui::icons::CROSS;
use phasegate::ui::render_outcome;
use std::path::Path;

use super::super::{Cli, RunArgs};
use super::load_settings;

pub fn cmd_run(cli: &Cli, work_dir: &Path, args: &RunArgs) -> Result<i32> {
    let settings = match load_settings(work_dir) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}Configuration error: {:#}", CROSS, e);
            return Ok(exit_codes::CONFIGURATION);
        }
    };

    let options = RunOptions {
        source: args.source.clone(),
        output: args.output.clone(),
        mode: args.mode.clone(),
        task_id: args.task_id.clone(),
        max_items: args.max_items,
        dry_run: args.dry_run,
        resume: args.resume,
        skip_delegates: args.skip_delegates,
        skip_external_analysis: args.skip_external_analysis,
        verbose: cli.verbose,
    };
    let config = match OrchestrationConfig::build(work_dir, &settings, options) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}{}", CROSS, e);
            return Ok(e.exit_code());
        }
    };
    tracing::debug!(?config, "resolved run configuration");

    let outcome = Orchestrator::new(config).run();
    print!("{}", render_outcome(&outcome));
    Ok(outcome.exit_code())
}
