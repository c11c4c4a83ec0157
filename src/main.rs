use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use phasegate::errors::exit_codes;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "phasegate")]
#[command(version, about = "Gated phase pipeline with checkpoint/resume for external delegates")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding the protocol files and settings (defaults to cwd)
    #[arg(long, global = true)]
    pub work_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the phase pipeline for a task file or directory
    Run(RunArgs),
    /// Inspect or answer the delegate request slot
    Bridge {
        #[command(subcommand)]
        command: BridgeCommands,
    },
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Task file or directory
    pub source: PathBuf,

    /// Output directory (defaults to phasegate-output/<task>)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Workflow mode: standard, micro, design-only, implement-only
    #[arg(short, long)]
    pub mode: Option<String>,

    /// Continue a suspended run from its checkpoint
    #[arg(long)]
    pub resume: bool,

    /// Run every phase without writing any file
    #[arg(long)]
    pub dry_run: bool,

    /// Do not call delegates; gated phases will fail their gate
    #[arg(long)]
    pub skip_delegates: bool,

    /// Use local fallbacks for optional analysis phases
    #[arg(long)]
    pub skip_external_analysis: bool,

    /// Maximum number of files included in the task context
    #[arg(long)]
    pub max_items: Option<usize>,

    /// Task id (derived from a TASK-XXX file name when omitted)
    #[arg(long)]
    pub task_id: Option<String>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum BridgeCommands {
    /// Show the request/response slot and any checkpoint
    Status,
    /// Write a response for the outstanding request
    Respond {
        /// Response payload text
        #[arg(long, conflicts_with_all = ["payload_file", "error"])]
        payload: Option<String>,

        /// Read the response payload from a file
        #[arg(long, conflicts_with = "error")]
        payload_file: Option<PathBuf>,

        /// Report a delegate failure of this kind instead of a payload
        #[arg(long, requires = "message")]
        error: Option<String>,

        /// Failure message (with --error)
        #[arg(long, requires = "error")]
        message: Option<String>,

        /// Seconds the delegate took
        #[arg(long)]
        duration: Option<f64>,
    },
    /// Delete the request and response files
    Clear {
        /// Also discard the checkpoint of a suspended run
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    phasegate::logging::init(cli.verbose);

    let code = match dispatch(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}Error: {:#}", phasegate::ui::icons::CROSS, e);
            exit_codes::FAILURE
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: &Cli) -> Result<i32> {
    let work_dir = match cli.work_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run(args) => cmd::cmd_run(cli, &work_dir, args),
        Commands::Bridge { command } => match command {
            BridgeCommands::Status => cmd::cmd_bridge_status(&work_dir),
            BridgeCommands::Respond {
                payload,
                payload_file,
                error,
                message,
                duration,
            } => {
                let reply = match (error, message) {
                    (Some(kind), Some(message)) => cmd::Reply::Error {
                        kind: kind.clone(),
                        message: message.clone(),
                    },
                    _ => cmd::Reply::Payload {
                        text: payload.clone(),
                        file: payload_file.clone(),
                    },
                };
                cmd::cmd_bridge_respond(&work_dir, reply, *duration)
            }
            BridgeCommands::Clear { force } => cmd::cmd_bridge_clear(&work_dir, *force),
        },
    }
}
