//! Stress harness for the uthread runtime.
//!
//! - [`rng`]: seeded xorshift source of injected yields.
//! - [`scenarios`]: randomized and exhaustive scheduling scenarios.
//! - [`structured_log`]: JSONL records for scenario outcomes and trace events.

pub mod rng;
pub mod scenarios;
pub mod structured_log;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("runtime error: {0}")]
    Runtime(#[from] uthread_core::ThreadError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),
}
