//! Build lifecycle: per-engine state machine, runner backends and the
//! executor that runs build stages.
//!
//! # Components
//!
//! - [`BuildJobService`]: start, cancel and advance builds under the engine's
//!   writer lock
//! - [`BuildJobRunner`]: pluggable job backend, looked up through
//!   [`RunnerRegistry`] by [`RunnerType`]
//! - [`BuildJobExecutor`]: runs a [`BuildJob`] stage and resolves how it ended
//! - [`LocalQueueRunner`] / [`LocalWorker`]: in-process runner backend

pub mod job;
pub mod local;
pub mod model;
pub mod runner;
pub mod service;

pub use job::{BuildJob, BuildJobContext, BuildJobExecutor, JobCompletionStatus, JobOutcome};
pub use local::{LocalQueueRunner, LocalWorker, QueuedJob, QueuedJobStatus};
pub use model::{Build, BuildJobState, BuildStage, Engine, RunnerType};
pub use runner::{BuildJobRunner, JobDefinition, RunnerRegistry};
pub use service::{BuildJobService, StartBuild};
