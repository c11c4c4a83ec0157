//! Request/response slot commands: `phasegate bridge status|respond|clear`.

use anyhow::{Context, Result};
use console::style;
use phasegate::bridge::{
    BridgeResponse, BridgeSlot, CheckpointStore, DelegateBridge, DirLock, FileBridge,
    ProtocolFiles,
};
use phasegate::errors::exit_codes;
use phasegate::settings::PhasegateToml;
use phasegate::ui::icons::{CHECK, CROSS};
use phasegate::ui::render_ledger;
use std::path::{Path, PathBuf};

use super::load_settings;

/// What `bridge respond` writes.
pub enum Reply {
    Payload {
        text: Option<String>,
        file: Option<PathBuf>,
    },
    Error {
        kind: String,
        message: String,
    },
}

fn protocol_files(work_dir: &Path, settings: &PhasegateToml) -> ProtocolFiles {
    ProtocolFiles::new(work_dir, &settings.bridge.prefix, &settings.bridge.operation)
}

pub fn cmd_bridge_status(work_dir: &Path) -> Result<i32> {
    let settings = load_settings(work_dir)?;
    let files = protocol_files(work_dir, &settings);
    let bridge = FileBridge::new(files.clone(), false);

    println!();
    match bridge.slot() {
        Ok(BridgeSlot::Empty) => println!("Slot: {}", style("empty").dim()),
        Ok(BridgeSlot::Pending(request)) => {
            println!("Slot: {}", style("awaiting external worker").yellow());
            println!("  request id: {}", request.request_id);
            println!("  phase:      {} ({})", request.phase, request.phase.description());
            println!("  delegate:   {}", request.delegate);
            println!("  created:    {}", request.created_at.to_rfc3339());
            println!("  file:       {}", files.request().display());
        }
        Ok(BridgeSlot::Ready(response)) => {
            println!("Slot: {}", style("response ready").green());
            println!("  request id: {}", response.request_id);
            println!("  status:     {:?}", response.status);
            println!("  file:       {}", files.response().display());
        }
        Err(e) => {
            eprintln!("{}{}", CROSS, e);
            return Ok(exit_codes::STATE_CORRUPTION);
        }
    }

    let checkpoints = CheckpointStore::new(files.checkpoint(), false);
    match checkpoints.load() {
        Ok(None) => println!("Checkpoint: {}", style("none").dim()),
        Ok(Some(checkpoint)) => {
            println!("Checkpoint: {}", checkpoints.path().display());
            println!("  run id:     {}", checkpoint.run_id);
            println!("  source:     {}", checkpoint.source_path.display());
            println!("  mode:       {}", checkpoint.flags.mode);
            println!(
                "  suspended:  phase {} ({})",
                checkpoint.suspended_phase,
                checkpoint.suspended_phase.description()
            );
            println!("  saved:      {}", checkpoint.created_at.to_rfc3339());
            if !checkpoint.ledger.records().is_empty() {
                println!("  invocations:");
                print!("{}", render_ledger(&checkpoint.ledger));
            }
        }
        Err(e) => {
            eprintln!("{}{}", CROSS, e);
            return Ok(exit_codes::STATE_CORRUPTION);
        }
    }
    println!();
    Ok(exit_codes::SUCCESS)
}

pub fn cmd_bridge_respond(work_dir: &Path, reply: Reply, duration: Option<f64>) -> Result<i32> {
    let settings = load_settings(work_dir)?;
    let bridge = FileBridge::new(protocol_files(work_dir, &settings), false);

    let request = match bridge.slot() {
        Ok(BridgeSlot::Pending(request)) => request,
        Ok(BridgeSlot::Ready(response)) => {
            eprintln!(
                "{}A response for request {} is already waiting; resume the run or clear the slot",
                CROSS, response.request_id
            );
            return Ok(exit_codes::CONFIGURATION);
        }
        Ok(BridgeSlot::Empty) => {
            eprintln!("{}No outstanding delegate request in {}", CROSS, work_dir.display());
            return Ok(exit_codes::CONFIGURATION);
        }
        Err(e) => {
            eprintln!("{}{}", CROSS, e);
            return Ok(exit_codes::STATE_CORRUPTION);
        }
    };

    let mut response = match reply {
        Reply::Error { kind, message } => BridgeResponse::error(&request.request_id, &kind, &message),
        Reply::Payload { text: Some(text), .. } => BridgeResponse::success(&request.request_id, text),
        Reply::Payload {
            file: Some(path), ..
        } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read payload file: {}", path.display()))?;
            BridgeResponse::success(&request.request_id, text)
        }
        Reply::Payload { .. } => {
            eprintln!("{}Provide --payload or --payload-file (or --error with --message)", CROSS);
            return Ok(exit_codes::CONFIGURATION);
        }
    };
    if let Some(seconds) = duration {
        response = response.with_duration(seconds);
    }

    let path = bridge.respond(&response)?;
    println!(
        "{}Response for phase {} ({}) written to {}",
        CHECK,
        request.phase,
        request.delegate,
        path.display()
    );
    Ok(exit_codes::SUCCESS)
}

pub fn cmd_bridge_clear(work_dir: &Path, force: bool) -> Result<i32> {
    let settings = load_settings(work_dir)?;
    let files = protocol_files(work_dir, &settings);
    let _lock = match DirLock::acquire(&files.lock()) {
        Ok(lock) => lock,
        Err(e) => {
            eprintln!("{}{}", CROSS, e);
            return Ok(e.exit_code());
        }
    };

    let checkpoints = CheckpointStore::new(files.checkpoint(), false);
    if checkpoints.exists() && !force {
        eprintln!(
            "{}A suspended run is checkpointed at {}; pass --force to discard it too",
            CROSS,
            checkpoints.path().display()
        );
        return Ok(exit_codes::CONFIGURATION);
    }

    FileBridge::new(files, false).clear()?;
    if force {
        checkpoints.remove()?;
    }
    println!("{}Bridge files cleared", CHECK);
    Ok(exit_codes::SUCCESS)
}
