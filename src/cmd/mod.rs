//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled           |
//! |------------|----------------------------|
//! | `project`  | `Init`                     |
//! | `run`      | `Run`                      |
//! | `status`   | `Status`, `Log`            |
//! | `config`   | `Validate`                 |
//! | `backups`  | `Backups`                  |
//! | `report`   | `Report` (executable side) |

pub mod backups;
pub mod config;
pub mod project;
pub mod report;
pub mod run;
pub mod status;

pub use backups::cmd_backups;
pub use config::cmd_validate;
pub use project::cmd_init;
pub use report::cmd_report;
pub use run::cmd_run;
pub use status::{cmd_log, cmd_status};
