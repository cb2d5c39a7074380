//! A two-stage demo pipeline: preprocessing on the CPU queue hands off to
//! training on the GPU queue. Used by the `simulate` command.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::build::{BuildJob, BuildJobContext, BuildStage, JobOutcome, RunnerType};
use crate::error::{CoordError, Result};
use crate::platform::BuildResult;

async fn step(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(CoordError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedPreprocessJob {
    pub steps: u32,
    pub step_delay: Duration,
    pub rows: u64,
}

impl Default for SimulatedPreprocessJob {
    fn default() -> Self {
        Self {
            steps: 3,
            step_delay: Duration::from_millis(100),
            rows: 5,
        }
    }
}

#[async_trait]
impl BuildJob for SimulatedPreprocessJob {
    fn stage(&self) -> BuildStage {
        BuildStage::Preprocess
    }

    async fn do_work(&self, ctx: &BuildJobContext, cancel: &CancellationToken) -> Result<JobOutcome> {
        for _ in 0..self.steps {
            step(cancel, self.step_delay).await?;
        }

        let results = (0..self.rows)
            .map(|i| BuildResult {
                corpus_id: "corpus1".to_string(),
                text_id: format!("text{}", i),
                refs: vec![format!("{}:{}", ctx.build_id, i)],
                translation: format!("row {}", i),
            })
            .collect();
        ctx.platform.insert_results(&ctx.engine_id, results).await?;
        ctx.platform
            .increment_corpus_size(&ctx.engine_id, self.rows)
            .await?;

        tracing::debug!(build_id = %ctx.build_id, rows = self.rows, "Preprocessing done");
        Ok(JobOutcome::Handoff {
            runner_type: RunnerType::Gpu,
            stage: BuildStage::Train,
            data: Some(json!({ "rows": self.rows })),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedTrainJob {
    pub steps: u32,
    pub step_delay: Duration,
}

impl Default for SimulatedTrainJob {
    fn default() -> Self {
        Self {
            steps: 5,
            step_delay: Duration::from_millis(100),
        }
    }
}

#[async_trait]
impl BuildJob for SimulatedTrainJob {
    fn stage(&self) -> BuildStage {
        BuildStage::Train
    }

    async fn do_work(&self, ctx: &BuildJobContext, cancel: &CancellationToken) -> Result<JobOutcome> {
        for _ in 0..self.steps {
            step(cancel, self.step_delay).await?;
        }
        let corpus_size = ctx
            .data
            .as_ref()
            .and_then(|d| d.get("rows"))
            .and_then(|r| r.as_u64())
            .unwrap_or(0);
        Ok(JobOutcome::Completed {
            corpus_size,
            confidence: 0.9,
        })
    }
}
