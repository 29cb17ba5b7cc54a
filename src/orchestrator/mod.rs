pub mod report;
pub mod runner;

pub use report::{Disposition, PhaseFileOutcome, RunReport, UnitFailure};
pub use runner::{Orchestrator, RunOptions, ensure_dependencies};
