use thiserror::Error;

use crate::build::RunnerType;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("Engine not found: {0}")]
    EngineNotFound(String),

    #[error("Engine {engine_id} already has a build in progress")]
    BuildInProgress { engine_id: String },

    #[error("No runner registered for {0}")]
    RunnerNotRegistered(RunnerType),

    #[error("Runner error: {0}")]
    Runner(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("RPC error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoordError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;
