//! phasegate: a gated phase pipeline whose delegate calls suspend the process
//! and resume from a checkpoint once an external worker has answered.

pub mod bridge;
pub mod config;
pub mod content;
pub mod errors;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod settings;
pub mod tasks;
pub mod ui;
