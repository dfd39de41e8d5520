// src/lib.rs
//
// =============================================================================
// KILN: LIBRARY ROOT
// =============================================================================
//
// Batch compute framework for reproducible data pipelines: submissions
// resolve to content-addressed jobs, jobs run a method across parallel
// slices, and produce columnar datasets other jobs can chain on. An
// append-only provenance log (urd) records named build results with
// their dependency closure.

// 1. Declare Modules
pub mod config;
pub mod core;
pub mod database;
pub mod dataset;
pub mod error;
pub mod launch;
pub mod logs;
pub mod methods;
pub mod options;
pub mod resolver;
pub mod server;
pub mod setupfile;
pub mod standard;
pub mod urd;
pub mod workdir;

// 2. Re-exports (The Public API)
pub use crate::config::{load_config, Config};
pub use crate::core::{
    DatasetId, JobId, MethodSpec, OptionSpec, Outcome, SubmitRequest, SubmitResponse, Value,
};
pub use crate::dataset::{Dataset, WorkdirSet};
pub use crate::error::{KilnError, Result};
pub use crate::launch::{JobContext, MethodRuntime, SliceContext};
pub use crate::methods::MethodRegistry;
pub use crate::server::Server;
pub use crate::urd::UrdLog;
