//! Shared UI icons.
//!
//! Each icon has a plain-text fallback for terminals without emoji support.

use console::Emoji;

// Outcome indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static BLOCKER: Emoji<'_, '_> = Emoji("🚧 ", "[BLOCK]");
pub static WAITING: Emoji<'_, '_> = Emoji("⏸️  ", "[WAIT]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");

// Artifact indicators
pub static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");
pub static FILE_NEW: Emoji<'_, '_> = Emoji("📄 ", "+");
pub static PROGRESS: Emoji<'_, '_> = Emoji("📊 ", "[PROG]");
