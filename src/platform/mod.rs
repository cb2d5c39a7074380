//! Build lifecycle notifications for the external system of record.
//!
//! Build code reports through [`PlatformService`]. The production
//! implementation, [`OutboxPlatformService`], never calls the platform
//! directly: it writes each notification to the `platform` outbox, grouped by
//! engine, and [`PlatformOutboxHandler`] later replays it against a
//! [`PlatformApi`].

pub mod handler;
pub mod outbox;

use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CoordError, Result};

pub use handler::{LoggingPlatformApi, PlatformApi, PlatformOutboxHandler};
pub use outbox::OutboxPlatformService;

/// Outbox name used for platform notifications.
pub const PLATFORM_OUTBOX: &str = "platform";

#[async_trait]
pub trait PlatformService: Send + Sync {
    async fn build_started(&self, engine_id: &str, build_id: &str) -> Result<()>;

    async fn build_completed(
        &self,
        engine_id: &str,
        build_id: &str,
        corpus_size: u64,
        confidence: f64,
    ) -> Result<()>;

    async fn build_canceled(&self, engine_id: &str, build_id: &str) -> Result<()>;

    async fn build_faulted(&self, engine_id: &str, build_id: &str, message: &str) -> Result<()>;

    async fn build_restarting(&self, engine_id: &str, build_id: &str) -> Result<()>;

    async fn insert_results(&self, engine_id: &str, results: Vec<BuildResult>) -> Result<()>;

    async fn increment_corpus_size(&self, engine_id: &str, count: u64) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformMethod {
    BuildStarted,
    BuildCompleted,
    BuildCanceled,
    BuildFaulted,
    BuildRestarting,
    InsertResults,
    IncrementCorpusSize,
}

impl PlatformMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformMethod::BuildStarted => "BuildStarted",
            PlatformMethod::BuildCompleted => "BuildCompleted",
            PlatformMethod::BuildCanceled => "BuildCanceled",
            PlatformMethod::BuildFaulted => "BuildFaulted",
            PlatformMethod::BuildRestarting => "BuildRestarting",
            PlatformMethod::InsertResults => "InsertResults",
            PlatformMethod::IncrementCorpusSize => "IncrementCorpusSize",
        }
    }
}

impl std::fmt::Display for PlatformMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformMethod {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "BuildStarted" => Ok(PlatformMethod::BuildStarted),
            "BuildCompleted" => Ok(PlatformMethod::BuildCompleted),
            "BuildCanceled" => Ok(PlatformMethod::BuildCanceled),
            "BuildFaulted" => Ok(PlatformMethod::BuildFaulted),
            "BuildRestarting" => Ok(PlatformMethod::BuildRestarting),
            "InsertResults" => Ok(PlatformMethod::InsertResults),
            "IncrementCorpusSize" => Ok(PlatformMethod::IncrementCorpusSize),
            other => Err(CoordError::Internal(format!(
                "unknown platform method: {}",
                other
            ))),
        }
    }
}

/// Request for the build-status calls that carry only the build id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub build_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildCompletedRequest {
    pub build_id: String,
    pub corpus_size: u64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildFaultedRequest {
    pub build_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementCorpusSizeRequest {
    pub engine_id: String,
    pub count: u64,
}

/// One output row produced by a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    pub corpus_id: String,
    pub text_id: String,
    #[serde(default)]
    pub refs: Vec<String>,
    pub translation: String,
}
