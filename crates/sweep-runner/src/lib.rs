//! Enumerate {environment file x checkpoint} work items and dispatch each one
//! to an external experiment runner.

pub mod config;
pub mod dispatch;
pub mod env_file;
pub mod error;
pub mod executor;
pub mod expand;
pub mod invocation;

pub use config::{DiscoveryConfig, ExecutorKind, SchedulerConfig, SweepConfig};
pub use dispatch::{
    CancelFlag, DispatchOptions, Dispatcher, OutcomeStatus, OutcomeSummary, RunOutcome,
    INVOCATION_RECORD,
};
pub use env_file::{load, EnvironmentConfig, OPTIONAL_FIELDS, REQUIRED_FIELDS};
pub use error::{Result, SweepError};
pub use executor::{
    Disposition, DryRunExecutor, Executor, LocalProcessExecutor, RunnerExit, SchedulerExecutor,
};
pub use expand::{compare_checkpoints, expand, list_checkpoints, WorkItem};
pub use invocation::{build, Invocation, RunnerCommand};
