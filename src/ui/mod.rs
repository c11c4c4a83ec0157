pub mod icons;
pub mod report;

pub use report::{render_ledger, render_outcome};
