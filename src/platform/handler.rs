use std::sync::Arc;

use async_trait::async_trait;
use tonic::Status;

use crate::error::{CoordError, Result};
use crate::outbox::{OutboxMessage, OutboxMessageHandler};
use crate::platform::{
    BuildCompletedRequest, BuildFaultedRequest, BuildRequest, BuildResult,
    IncrementCorpusSizeRequest, PlatformMethod, PLATFORM_OUTBOX,
};

/// Client for the external platform. Failures are gRPC statuses so the
/// outbox can tell transient from permanent errors.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn build_started(&self, request: BuildRequest) -> std::result::Result<(), Status>;

    async fn build_completed(
        &self,
        request: BuildCompletedRequest,
    ) -> std::result::Result<(), Status>;

    async fn build_canceled(&self, request: BuildRequest) -> std::result::Result<(), Status>;

    async fn build_faulted(&self, request: BuildFaultedRequest)
        -> std::result::Result<(), Status>;

    async fn build_restarting(&self, request: BuildRequest) -> std::result::Result<(), Status>;

    async fn insert_results(
        &self,
        engine_id: &str,
        results: Vec<BuildResult>,
    ) -> std::result::Result<(), Status>;

    async fn increment_corpus_size(
        &self,
        request: IncrementCorpusSizeRequest,
    ) -> std::result::Result<(), Status>;
}

/// Replays platform outbox messages against a [`PlatformApi`].
pub struct PlatformOutboxHandler {
    api: Arc<dyn PlatformApi>,
}

impl PlatformOutboxHandler {
    pub fn new(api: Arc<dyn PlatformApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl OutboxMessageHandler for PlatformOutboxHandler {
    fn name(&self) -> &str {
        PLATFORM_OUTBOX
    }

    async fn send_message(&self, message: &OutboxMessage, content: Option<&str>) -> Result<()> {
        let method: PlatformMethod = message.method.parse()?;
        let content = content.ok_or_else(|| {
            CoordError::Internal(format!("platform message {} has no content", message.id))
        })?;

        match method {
            PlatformMethod::BuildStarted => {
                self.api.build_started(serde_json::from_str(content)?).await?
            }
            PlatformMethod::BuildCompleted => {
                self.api
                    .build_completed(serde_json::from_str(content)?)
                    .await?
            }
            PlatformMethod::BuildCanceled => {
                self.api.build_canceled(serde_json::from_str(content)?).await?
            }
            PlatformMethod::BuildFaulted => {
                self.api.build_faulted(serde_json::from_str(content)?).await?
            }
            PlatformMethod::BuildRestarting => {
                self.api
                    .build_restarting(serde_json::from_str(content)?)
                    .await?
            }
            PlatformMethod::InsertResults => {
                let results: Vec<BuildResult> = serde_json::from_str(content)?;
                self.api.insert_results(&message.group_id, results).await?
            }
            PlatformMethod::IncrementCorpusSize => {
                self.api
                    .increment_corpus_size(serde_json::from_str(content)?)
                    .await?
            }
        }
        Ok(())
    }
}

/// Platform endpoint that only logs what it receives.
#[derive(Debug, Clone, Default)]
pub struct LoggingPlatformApi;

#[async_trait]
impl PlatformApi for LoggingPlatformApi {
    async fn build_started(&self, request: BuildRequest) -> std::result::Result<(), Status> {
        tracing::info!(build_id = %request.build_id, "Platform: build started");
        Ok(())
    }

    async fn build_completed(
        &self,
        request: BuildCompletedRequest,
    ) -> std::result::Result<(), Status> {
        tracing::info!(
            build_id = %request.build_id,
            corpus_size = request.corpus_size,
            confidence = request.confidence,
            "Platform: build completed"
        );
        Ok(())
    }

    async fn build_canceled(&self, request: BuildRequest) -> std::result::Result<(), Status> {
        tracing::info!(build_id = %request.build_id, "Platform: build canceled");
        Ok(())
    }

    async fn build_faulted(
        &self,
        request: BuildFaultedRequest,
    ) -> std::result::Result<(), Status> {
        tracing::info!(build_id = %request.build_id, message = %request.message, "Platform: build faulted");
        Ok(())
    }

    async fn build_restarting(&self, request: BuildRequest) -> std::result::Result<(), Status> {
        tracing::info!(build_id = %request.build_id, "Platform: build restarting");
        Ok(())
    }

    async fn insert_results(
        &self,
        engine_id: &str,
        results: Vec<BuildResult>,
    ) -> std::result::Result<(), Status> {
        tracing::info!(engine_id, count = results.len(), "Platform: results inserted");
        Ok(())
    }

    async fn increment_corpus_size(
        &self,
        request: IncrementCorpusSizeRequest,
    ) -> std::result::Result<(), Status> {
        tracing::info!(engine_id = %request.engine_id, count = request.count, "Platform: corpus size incremented");
        Ok(())
    }
}
