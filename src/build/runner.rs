use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::build::model::{BuildStage, RunnerType};
use crate::error::{CoordError, Result};

/// Everything a runner needs to execute one stage of a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub engine_type: String,
    pub engine_id: String,
    pub build_id: String,
    pub stage: BuildStage,
    pub data: Option<serde_json::Value>,
    pub options: Option<String>,
    /// Set when this stage was handed off from an earlier stage of the same
    /// build, so the build has already been reported as started.
    pub continuation: bool,
}

/// A backend that runs build jobs: an in-process queue, a remote cluster
/// scheduler, and so on.
#[async_trait]
pub trait BuildJobRunner: Send + Sync {
    fn runner_type(&self) -> RunnerType;

    async fn create_engine(&self, engine_id: &str, name: Option<&str>) -> Result<()>;

    async fn delete_engine(&self, engine_id: &str) -> Result<()>;

    /// Register the job without making it runnable. Returns the job id.
    async fn create_job(&self, definition: JobDefinition) -> Result<String>;

    /// Make a created job runnable.
    async fn enqueue_job(&self, job_id: &str, engine_type: &str) -> Result<()>;

    /// Dequeue a job that has not started, or signal a running one to stop.
    /// Returns whether a job was found.
    async fn stop_job(&self, job_id: &str) -> Result<bool>;

    async fn delete_job(&self, job_id: &str) -> Result<bool>;
}

/// Runner lookup table, resolved once at startup.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<RunnerType, Arc<dyn BuildJobRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runner(mut self, runner: Arc<dyn BuildJobRunner>) -> Self {
        self.register(runner);
        self
    }

    /// Register a runner, replacing any earlier one of the same type.
    pub fn register(&mut self, runner: Arc<dyn BuildJobRunner>) {
        self.runners.insert(runner.runner_type(), runner);
    }

    pub fn get(&self, runner_type: RunnerType) -> Result<&Arc<dyn BuildJobRunner>> {
        self.runners
            .get(&runner_type)
            .ok_or(CoordError::RunnerNotRegistered(runner_type))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn BuildJobRunner>> {
        self.runners.values()
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}
