//! Verification and reconciliation core for election result submissions.
//!
//! Submissions flow through duplicate detection into a verification state
//! machine; every state change is turned into stored notifications and live
//! pushes. Independently, internal results are reconciled against official
//! (MEC) figures on demand or by the scheduled sweep.

pub mod config;
pub mod db;
pub mod duplicates;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod notifications;
pub mod reconciliation;
pub mod tasks;
pub mod verification;

pub use config::Config;
pub use engine::{CompareFilter, Engine};
pub use errors::{EngineError, EngineResult};
