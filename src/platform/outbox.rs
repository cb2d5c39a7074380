use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::outbox::Outbox;
use crate::platform::{
    BuildCompletedRequest, BuildFaultedRequest, BuildRequest, BuildResult,
    IncrementCorpusSizeRequest, PlatformMethod, PlatformService, PLATFORM_OUTBOX,
};

/// [`PlatformService`] that queues every notification on the platform
/// outbox. All notifications for one engine share a group, so the platform
/// sees them in the order they were raised.
#[derive(Clone)]
pub struct OutboxPlatformService {
    outbox: Outbox,
}

impl OutboxPlatformService {
    pub fn new(outbox: Outbox) -> Self {
        Self { outbox }
    }

    async fn enqueue<R: Serialize + Sync>(
        &self,
        method: PlatformMethod,
        engine_id: &str,
        request: &R,
    ) -> Result<()> {
        let content = serde_json::to_string(request)?;
        self.outbox
            .enqueue_message(PLATFORM_OUTBOX, method.as_str(), engine_id, Some(content))
            .await?;
        Ok(())
    }
}

fn build(build_id: &str) -> BuildRequest {
    BuildRequest {
        build_id: build_id.to_string(),
    }
}

#[async_trait]
impl PlatformService for OutboxPlatformService {
    async fn build_started(&self, engine_id: &str, build_id: &str) -> Result<()> {
        self.enqueue(PlatformMethod::BuildStarted, engine_id, &build(build_id))
            .await
    }

    async fn build_completed(
        &self,
        engine_id: &str,
        build_id: &str,
        corpus_size: u64,
        confidence: f64,
    ) -> Result<()> {
        let request = BuildCompletedRequest {
            build_id: build_id.to_string(),
            corpus_size,
            confidence,
        };
        self.enqueue(PlatformMethod::BuildCompleted, engine_id, &request)
            .await
    }

    async fn build_canceled(&self, engine_id: &str, build_id: &str) -> Result<()> {
        self.enqueue(PlatformMethod::BuildCanceled, engine_id, &build(build_id))
            .await
    }

    async fn build_faulted(&self, engine_id: &str, build_id: &str, message: &str) -> Result<()> {
        let request = BuildFaultedRequest {
            build_id: build_id.to_string(),
            message: message.to_string(),
        };
        self.enqueue(PlatformMethod::BuildFaulted, engine_id, &request)
            .await
    }

    async fn build_restarting(&self, engine_id: &str, build_id: &str) -> Result<()> {
        self.enqueue(PlatformMethod::BuildRestarting, engine_id, &build(build_id))
            .await
    }

    /// Results always travel as a JSON array; large arrays end up in blob
    /// storage through the outbox size limit.
    async fn insert_results(&self, engine_id: &str, results: Vec<BuildResult>) -> Result<()> {
        self.enqueue(PlatformMethod::InsertResults, engine_id, &results)
            .await
    }

    async fn increment_corpus_size(&self, engine_id: &str, count: u64) -> Result<()> {
        let request = IncrementCorpusSizeRequest {
            engine_id: engine_id.to_string(),
            count,
        };
        self.enqueue(PlatformMethod::IncrementCorpusSize, engine_id, &request)
            .await
    }
}
