use serde::{Deserialize, Serialize};

use crate::store::Entity;

/// Which runner backend executes a build stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunnerType {
    /// Lightweight in-process queue, used for preprocessing.
    Cpu,
    /// Accelerator-backed queue, used for training.
    Gpu,
}

impl std::fmt::Display for RunnerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerType::Cpu => write!(f, "cpu"),
            RunnerType::Gpu => write!(f, "gpu"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildStage {
    Preprocess,
    Train,
    Postprocess,
}

impl std::fmt::Display for BuildStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStage::Preprocess => write!(f, "preprocess"),
            BuildStage::Train => write!(f, "train"),
            BuildStage::Postprocess => write!(f, "postprocess"),
        }
    }
}

/// Lifecycle state of an engine's current build. `None` is only ever
/// reported, never stored: it is what an absent `current_build` means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildJobState {
    None,
    Pending,
    Active,
    Canceling,
}

impl std::fmt::Display for BuildJobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildJobState::None => write!(f, "none"),
            BuildJobState::Pending => write!(f, "pending"),
            BuildJobState::Active => write!(f, "active"),
            BuildJobState::Canceling => write!(f, "canceling"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub build_id: String,
    pub job_id: String,
    pub runner_type: RunnerType,
    pub stage: BuildStage,
    pub job_state: BuildJobState,
    /// Stage input, kept so the job can be recreated after a host restart.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    pub options: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Engine {
    pub id: String,
    pub engine_type: String,
    pub name: Option<String>,
    pub current_build: Option<Build>,
    /// Advances once per successfully finished build.
    pub build_revision: u64,
}

impl Entity for Engine {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Engine {
    pub fn new(id: impl Into<String>, engine_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            engine_type: engine_type.into(),
            name: None,
            current_build: None,
            build_revision: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn job_state(&self) -> BuildJobState {
        self.current_build
            .as_ref()
            .map_or(BuildJobState::None, |b| b.job_state)
    }

    pub fn is_building(&self, build_id: &str) -> bool {
        self.current_build
            .as_ref()
            .is_some_and(|b| b.build_id == build_id)
    }
}
