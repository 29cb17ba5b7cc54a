//! stagehand: a crash-safe, resumable orchestrator for multi-phase narration
//! pipelines.
//!
//! | Module            | Concern                                              |
//! |-------------------|------------------------------------------------------|
//! | `state`           | Persisted state document, lock, backups, tx log      |
//! | `resolver`        | Skip decisions and input hashing                     |
//! | `classifier`      | Which units of a file need re-dispatch               |
//! | `fallback`        | Engine configurations and the fallback policy        |
//! | `workers`         | Worker pool sizing                                   |
//! | `phase`           | Phase definitions and dependency ordering            |
//! | `invoke`          | Running phase executables                            |
//! | `orchestrator`    | The run loop and its report                          |
//! | `pipeline_config` | `pipeline.toml` and its env/CLI layers               |

pub mod classifier;
pub mod errors;
pub mod fallback;
pub mod hashing;
pub mod invoke;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod pipeline_config;
pub mod resolver;
pub mod state;
pub mod workers;
