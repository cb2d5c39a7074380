use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::build::model::{BuildJobState, BuildStage, Engine, RunnerType};
use crate::build::runner::JobDefinition;
use crate::build::service::{BuildJobService, StartBuild};
use crate::error::{CoordError, Result};
use crate::platform::PlatformService;
use crate::store::{Repository, SharedFilter};

/// How a job run ended, as seen by [`BuildJob::cleanup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCompletionStatus {
    Completed,
    Faulted,
    Canceled,
    Restarting,
}

impl std::fmt::Display for JobCompletionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobCompletionStatus::Completed => write!(f, "completed"),
            JobCompletionStatus::Faulted => write!(f, "faulted"),
            JobCompletionStatus::Canceled => write!(f, "canceled"),
            JobCompletionStatus::Restarting => write!(f, "restarting"),
        }
    }
}

/// What a stage produced.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The build is done.
    Completed { corpus_size: u64, confidence: f64 },
    /// Continue the same build with another stage, possibly on another runner.
    Handoff {
        runner_type: RunnerType,
        stage: BuildStage,
        data: Option<serde_json::Value>,
    },
}

/// What a running stage knows about its build.
#[derive(Clone)]
pub struct BuildJobContext {
    pub job_id: String,
    pub engine_id: String,
    pub engine_type: String,
    pub build_id: String,
    pub stage: BuildStage,
    pub data: Option<serde_json::Value>,
    pub options: Option<String>,
    pub platform: Arc<dyn PlatformService>,
}

/// The work of one build stage.
#[async_trait]
pub trait BuildJob: Send + Sync {
    fn stage(&self) -> BuildStage;

    /// Do the work. Must return `Err(CoordError::Cancelled)` promptly once
    /// `cancel` fires.
    async fn do_work(&self, ctx: &BuildJobContext, cancel: &CancellationToken)
        -> Result<JobOutcome>;

    /// Compensation after the run, whatever the outcome.
    async fn cleanup(&self, _ctx: &BuildJobContext, _status: JobCompletionStatus) -> Result<()> {
        Ok(())
    }
}

/// Runs build stages on behalf of a runner and drives the build state
/// machine around them.
pub struct BuildJobExecutor {
    engines: Arc<dyn Repository<Engine>>,
    service: Arc<BuildJobService>,
    platform: Arc<dyn PlatformService>,
    jobs: HashMap<BuildStage, Arc<dyn BuildJob>>,
}

impl BuildJobExecutor {
    pub fn new(
        engines: Arc<dyn Repository<Engine>>,
        service: Arc<BuildJobService>,
        platform: Arc<dyn PlatformService>,
    ) -> Self {
        Self {
            engines,
            service,
            platform,
            jobs: HashMap::new(),
        }
    }

    pub fn with_job(mut self, job: Arc<dyn BuildJob>) -> Self {
        self.register(job);
        self
    }

    pub fn register(&mut self, job: Arc<dyn BuildJob>) {
        self.jobs.insert(job.stage(), job);
    }

    /// Run one queued job to completion.
    ///
    /// `stop` is the runner's handle on this job: it fires on host shutdown
    /// or when the runner is asked to stop the job. Which of the two it was
    /// is decided afterwards from the persisted build state.
    pub async fn run(
        &self,
        job_id: &str,
        definition: &JobDefinition,
        stop: &CancellationToken,
    ) -> Result<JobCompletionStatus> {
        let job = self.jobs.get(&definition.stage).cloned().ok_or_else(|| {
            CoordError::Internal(format!("no build job registered for stage {}", definition.stage))
        })?;
        let ctx = BuildJobContext {
            job_id: job_id.to_string(),
            engine_id: definition.engine_id.clone(),
            engine_type: definition.engine_type.clone(),
            build_id: definition.build_id.clone(),
            stage: definition.stage,
            data: definition.data.clone(),
            options: definition.options.clone(),
            platform: self.platform.clone(),
        };

        let result = self.execute(job.as_ref(), &ctx, definition, stop).await;
        let status = match &result {
            Ok(status) => *status,
            Err(_) => JobCompletionStatus::Faulted,
        };
        if let Err(e) = job.cleanup(&ctx, status).await {
            tracing::warn!(build_id = %ctx.build_id, stage = %ctx.stage, error = %e, "Build job cleanup failed");
        }
        result
    }

    async fn execute(
        &self,
        job: &dyn BuildJob,
        ctx: &BuildJobContext,
        definition: &JobDefinition,
        stop: &CancellationToken,
    ) -> Result<JobCompletionStatus> {
        if !self
            .service
            .build_job_started(&ctx.engine_id, &ctx.build_id)
            .await?
        {
            tracing::info!(build_id = %ctx.build_id, "Build canceled before it started");
            return Ok(JobCompletionStatus::Canceled);
        }
        if !definition.continuation {
            self.platform
                .build_started(&ctx.engine_id, &ctx.build_id)
                .await?;
        }
        tracing::info!(
            engine_id = %ctx.engine_id,
            build_id = %ctx.build_id,
            stage = %ctx.stage,
            "Build stage running"
        );

        let cancel = stop.child_token();
        let watcher = tokio::spawn(watch_for_cancel(
            self.engines.clone(),
            ctx.engine_id.clone(),
            ctx.job_id.clone(),
            cancel.clone(),
        ));
        let outcome = job.do_work(ctx, &cancel).await;
        watcher.abort();

        match outcome {
            Ok(JobOutcome::Completed {
                corpus_size,
                confidence,
            }) => {
                self.platform
                    .build_completed(&ctx.engine_id, &ctx.build_id, corpus_size, confidence)
                    .await?;
                self.service
                    .build_job_finished(&ctx.engine_id, &ctx.build_id, true)
                    .await?;
                tracing::info!(build_id = %ctx.build_id, corpus_size, confidence, "Build completed");
                Ok(JobCompletionStatus::Completed)
            }
            Ok(JobOutcome::Handoff {
                runner_type,
                stage,
                data,
            }) => {
                let mut next = StartBuild::new(
                    runner_type,
                    ctx.engine_type.clone(),
                    ctx.engine_id.clone(),
                    ctx.build_id.clone(),
                    stage,
                );
                next.data = data;
                next.options = ctx.options.clone();
                match self.service.start_build_job(next).await {
                    Ok(()) => {
                        tracing::info!(build_id = %ctx.build_id, from = %ctx.stage, to = %stage, "Build handed off");
                        Ok(JobCompletionStatus::Completed)
                    }
                    // Only a cancel can slip in between: the build is ours.
                    Err(CoordError::BuildInProgress { .. }) => self.on_cancelled(ctx).await,
                    Err(e) => self.on_faulted(ctx, e).await,
                }
            }
            Err(e) if e.is_cancelled() => self.on_cancelled(ctx).await,
            Err(e) => self.on_faulted(ctx, e).await,
        }
    }

    /// Decide from the store whether a cancelled run was an API cancel or an
    /// interrupted one (host shutdown).
    ///
    /// The read, the platform event and the transition happen under one hold
    /// of the engine lock, so a cancel cannot land between the decision and
    /// the transition it picks.
    async fn on_cancelled(&self, ctx: &BuildJobContext) -> Result<JobCompletionStatus> {
        self.service
            .engine_lock(&ctx.engine_id)
            .with_writer_lock(None, &CancellationToken::new(), || async {
                let state = self
                    .engines
                    .get(&|e: &Engine| {
                        e.id == ctx.engine_id
                            && e.current_build
                                .as_ref()
                                .is_some_and(|b| b.build_id == ctx.build_id && b.job_id == ctx.job_id)
                    })
                    .await?
                    .map(|e| e.job_state());

                match state {
                    Some(BuildJobState::Canceling) => {
                        self.platform
                            .build_canceled(&ctx.engine_id, &ctx.build_id)
                            .await?;
                        self.service
                            .build_job_finished_locked(&ctx.engine_id, &ctx.build_id, false)
                            .await?;
                        tracing::info!(build_id = %ctx.build_id, "Build canceled");
                        Ok(JobCompletionStatus::Canceled)
                    }
                    Some(BuildJobState::Active) => {
                        self.platform
                            .build_restarting(&ctx.engine_id, &ctx.build_id)
                            .await?;
                        self.service
                            .build_job_restarting_locked(&ctx.engine_id, &ctx.build_id)
                            .await?;
                        tracing::info!(build_id = %ctx.build_id, "Build interrupted; will restart");
                        Ok(JobCompletionStatus::Restarting)
                    }
                    _ => {
                        tracing::info!(build_id = %ctx.build_id, "Build no longer ours; treating as canceled");
                        Ok(JobCompletionStatus::Canceled)
                    }
                }
            })
            .await
    }

    async fn on_faulted(&self, ctx: &BuildJobContext, error: CoordError) -> Result<JobCompletionStatus> {
        let message = error.to_string();
        self.service
            .engine_lock(&ctx.engine_id)
            .with_writer_lock(None, &CancellationToken::new(), || async {
                self.platform
                    .build_faulted(&ctx.engine_id, &ctx.build_id, &message)
                    .await?;
                self.service
                    .build_job_finished_locked(&ctx.engine_id, &ctx.build_id, false)
                    .await
            })
            .await?;
        tracing::error!(build_id = %ctx.build_id, stage = %ctx.stage, error = %message, "Build faulted");
        Ok(JobCompletionStatus::Faulted)
    }
}

/// Cancel `token` once this job's build is canceling, replaced or gone.
async fn watch_for_cancel(
    engines: Arc<dyn Repository<Engine>>,
    engine_id: String,
    job_id: String,
    token: CancellationToken,
) {
    let id = engine_id.clone();
    let filter: SharedFilter<Engine> = Arc::new(move |e: &Engine| e.id == id);
    let mut sub = match engines.subscribe(filter).await {
        Ok(sub) => sub,
        Err(e) => {
            tracing::warn!(engine_id = %engine_id, error = %e, "Cancel watcher could not subscribe");
            return;
        }
    };

    loop {
        let still_ours = sub
            .change()
            .entity
            .as_ref()
            .and_then(|e| e.current_build.as_ref())
            .is_some_and(|b| b.job_id == job_id && b.job_state != BuildJobState::Canceling);
        if !still_ours {
            tracing::debug!(engine_id = %engine_id, job_id = %job_id, "Cancel requested for running job");
            token.cancel();
            return;
        }

        tokio::select! {
            _ = token.cancelled() => return,
            result = sub.wait_for_change(None) => {
                if let Err(e) = result {
                    tracing::warn!(engine_id = %engine_id, error = %e, "Cancel watcher lost its subscription");
                    return;
                }
            }
        }
    }
}
