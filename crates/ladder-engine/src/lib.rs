//! # ladder-engine
//! The tier cascade: unlock requests, fee routing, holding-funded
//! auto-unlocks, and the reconciliation journal.
//!
//! - [`engine::CascadeEngine`]: entry points and the work queue
//! - [`config::EngineConfig`]: engine settings, file and environment loading
//! - [`routing`]: fee routing decisions and external delivery
//! - [`logging::init_logging`]: tracing subscriber setup

pub mod config;
pub mod engine;
pub mod error;
pub mod locks;
pub mod logging;
pub mod report;
pub mod retry;
pub mod routing;

pub use crate::config::EngineConfig;
pub use engine::{CascadeEngine, CascadeStep};
pub use error::CascadeError;
pub use report::{CascadeReport, StepOutcome};
