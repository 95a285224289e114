//! Bundle Engine Library
//!
//! Plans, schedules, times, retries and monitors one ledger submission per
//! account for a batch ("bundle") of accounts sharing a transaction
//! template.
//!
//! ## Modules
//!
//! - **planner**: windowed execution plans with market-aware fees
//! - **queue**: durable and in-process task queues with failover
//! - **scheduler**: worker pools, coordination, pause/resume/cancel
//! - **orchestrator**: the public launch and control surface
//! - **ports**: persistence, ledger and notification collaborators

pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod observability;
pub mod orchestrator;
pub mod planner;
pub mod ports;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod sequence;
pub mod simulation;
pub mod structured_logging;
pub mod types;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types
pub use config::EngineConfig;
pub use errors::{EngineError, EngineResult, TaskError};
pub use events::EngineEvent;
pub use orchestrator::{BundleOrchestrator, LaunchRequest};
pub use types::{
    Account, AccountHealth, Bundle, BundleId, BundleStatus, BundleTask, ProcessorKind, Progress,
    TaskId, TaskStatus, TransactionKind, TransactionTemplate,
};
