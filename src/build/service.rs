use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::build::model::{Build, BuildJobState, BuildStage, Engine, RunnerType};
use crate::build::runner::{BuildJobRunner, JobDefinition, RunnerRegistry};
use crate::error::{CoordError, Result};
use crate::lock::{DistributedLock, LockFactory};
use crate::platform::PlatformService;
use crate::store::{Mutation, Repository, UpdateOptions};

/// Parameters for [`BuildJobService::start_build_job`].
#[derive(Debug, Clone)]
pub struct StartBuild {
    pub runner_type: RunnerType,
    pub engine_type: String,
    pub engine_id: String,
    pub build_id: String,
    pub stage: BuildStage,
    pub data: Option<serde_json::Value>,
    pub options: Option<String>,
}

impl StartBuild {
    pub fn new(
        runner_type: RunnerType,
        engine_type: impl Into<String>,
        engine_id: impl Into<String>,
        build_id: impl Into<String>,
        stage: BuildStage,
    ) -> Self {
        Self {
            runner_type,
            engine_type: engine_type.into(),
            engine_id: engine_id.into(),
            build_id: build_id.into(),
            stage,
            data: None,
            options: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }
}

/// Owns the build state machine of every engine.
///
/// ```text
/// None -start-> Pending -started-> Active -finish-> None
/// Pending -cancel-> None
/// Active -cancel-> Canceling -finish-> None
/// Active -restarting-> Pending
/// ```
///
/// A `Canceling` build never goes back to `Pending`; once canceled it can
/// only finish.
///
/// Every transition runs under the engine's distributed writer lock, so two
/// hosts never interleave mutations of the same engine.
pub struct BuildJobService {
    engines: Arc<dyn Repository<Engine>>,
    locks: LockFactory,
    runners: RunnerRegistry,
    platform: Arc<dyn PlatformService>,
}

impl BuildJobService {
    pub fn new(
        engines: Arc<dyn Repository<Engine>>,
        locks: LockFactory,
        runners: RunnerRegistry,
        platform: Arc<dyn PlatformService>,
    ) -> Self {
        Self {
            engines,
            locks,
            runners,
            platform,
        }
    }

    pub fn runners(&self) -> &RunnerRegistry {
        &self.runners
    }

    /// The writer lock every transition of this engine runs under. Callers
    /// that need to read, decide and transition as one step hold it and use
    /// the `*_locked` variants.
    pub fn engine_lock(&self, engine_id: &str) -> DistributedLock {
        self.locks.get(engine_id)
    }

    pub async fn is_engine_building(&self, engine_id: &str) -> Result<bool> {
        self.engines
            .exists(&|e: &Engine| e.id == engine_id && e.current_build.is_some())
            .await
    }

    pub async fn get_building_engines(&self, runner_type: RunnerType) -> Result<Vec<Engine>> {
        self.engines
            .get_all(&|e: &Engine| {
                e.current_build
                    .as_ref()
                    .is_some_and(|b| b.runner_type == runner_type)
            })
            .await
    }

    pub async fn get_build(&self, engine_id: &str, build_id: &str) -> Result<Option<Build>> {
        let engine = self
            .engines
            .get(&|e: &Engine| e.id == engine_id && e.is_building(build_id))
            .await?;
        Ok(engine.and_then(|e| e.current_build))
    }

    pub async fn get_engine(&self, engine_id: &str) -> Result<Option<Engine>> {
        self.engines.get(&|e: &Engine| e.id == engine_id).await
    }

    /// Register a new engine with the store, its lock and every runner.
    pub async fn create_engine(
        &self,
        engine_id: &str,
        engine_type: &str,
        name: Option<&str>,
    ) -> Result<Engine> {
        let mut engine = Engine::new(engine_id, engine_type);
        engine.name = name.map(str::to_string);
        self.engines.insert(engine.clone()).await?;
        self.locks.create(engine_id).await?;
        for runner in self.runners.iter() {
            runner.create_engine(engine_id, name).await?;
        }
        tracing::info!(engine_id, engine_type, "Engine created");
        Ok(engine)
    }

    /// Cancel any build, then remove the engine everywhere. Returns whether
    /// the engine existed.
    pub async fn delete_engine(&self, engine_id: &str) -> Result<bool> {
        self.cancel_build_job(engine_id).await?;
        let deleted = self
            .with_engine_lock(engine_id, || async {
                self.engines.delete(&|e: &Engine| e.id == engine_id).await
            })
            .await?;
        for runner in self.runners.iter() {
            runner.delete_engine(engine_id).await?;
        }
        self.locks.delete(engine_id).await?;
        if deleted.is_some() {
            tracing::info!(engine_id, "Engine deleted");
        }
        Ok(deleted.is_some())
    }

    /// Create, record and enqueue a job for a build stage.
    ///
    /// Fails with `BuildInProgress` if the engine already has a build. The one
    /// exception is a stage handoff: starting the next stage of the build
    /// that is currently `Active` replaces its record. A `Canceling` build
    /// always blocks.
    ///
    /// No external job outlives a failure here: if the record cannot be
    /// written the job is deleted, and if enqueueing fails the record is
    /// rolled back as well.
    pub async fn start_build_job(&self, request: StartBuild) -> Result<()> {
        let engine_id = request.engine_id.clone();
        self.with_engine_lock(&engine_id, || self.start_locked(request))
            .await
    }

    async fn start_locked(&self, request: StartBuild) -> Result<()> {
        let engine_id = request.engine_id.as_str();
        let engine = self
            .engines
            .get(&|e: &Engine| e.id == engine_id)
            .await?
            .ok_or_else(|| CoordError::EngineNotFound(engine_id.to_string()))?;

        let previous = engine.current_build.clone();
        let continuation = match &previous {
            None => false,
            Some(b) if b.build_id == request.build_id && b.job_state == BuildJobState::Active => {
                true
            }
            Some(_) => {
                return Err(CoordError::BuildInProgress {
                    engine_id: engine_id.to_string(),
                })
            }
        };

        let runner = self.runners.get(request.runner_type)?.clone();
        let job_id = runner
            .create_job(JobDefinition {
                engine_type: request.engine_type.clone(),
                engine_id: engine_id.to_string(),
                build_id: request.build_id.clone(),
                stage: request.stage,
                data: request.data.clone(),
                options: request.options.clone(),
                continuation,
            })
            .await?;

        let build = Build {
            build_id: request.build_id.clone(),
            job_id: job_id.clone(),
            runner_type: request.runner_type,
            stage: request.stage,
            job_state: BuildJobState::Pending,
            data: request.data.clone(),
            options: request.options.clone(),
        };
        let recorded = self
            .engines
            .update(
                &|e: &Engine| e.id == engine_id && e.current_build == previous,
                &|e: &mut Engine| e.current_build = Some(build.clone()),
                UpdateOptions::default(),
            )
            .await;
        match recorded {
            Ok(Some(_)) => {}
            Ok(None) => {
                discard_job(runner.as_ref(), &job_id).await;
                return Err(CoordError::BuildInProgress {
                    engine_id: engine_id.to_string(),
                });
            }
            Err(e) => {
                discard_job(runner.as_ref(), &job_id).await;
                return Err(e);
            }
        }

        if let Err(e) = runner.enqueue_job(&job_id, &request.engine_type).await {
            tracing::error!(engine_id, job_id = %job_id, error = %e, "Failed to enqueue build job");
            let rollback = self
                .engines
                .update(
                    &|e: &Engine| {
                        e.id == engine_id
                            && e.current_build.as_ref().is_some_and(|b| b.job_id == job_id)
                    },
                    &|e: &mut Engine| e.current_build = previous.clone(),
                    UpdateOptions::default(),
                )
                .await;
            if let Err(rollback) = rollback {
                tracing::error!(engine_id, error = %rollback, "Failed to roll back build record");
            }
            discard_job(runner.as_ref(), &job_id).await;
            return Err(e);
        }

        tracing::info!(
            engine_id,
            build_id = %request.build_id,
            job_id = %job_id,
            stage = %request.stage,
            runner = %request.runner_type,
            "Build job started"
        );
        Ok(())
    }

    /// Cancel the engine's current build.
    ///
    /// A `Pending` build is removed and its job dequeued: returns
    /// `(Some(build_id), None)`. An `Active` build is flagged `Canceling` and
    /// its job signalled; the job itself observes the flag and finishes:
    /// returns `(Some(build_id), Canceling)`. Otherwise `(None, None)`.
    pub async fn cancel_build_job(
        &self,
        engine_id: &str,
    ) -> Result<(Option<String>, BuildJobState)> {
        self.with_engine_lock(engine_id, || self.cancel_locked(engine_id))
            .await
    }

    async fn cancel_locked(&self, engine_id: &str) -> Result<(Option<String>, BuildJobState)> {
        let Some(current) = self
            .engines
            .get(&|e: &Engine| e.id == engine_id && e.current_build.is_some())
            .await?
            .and_then(|e| e.current_build)
        else {
            return Ok((None, BuildJobState::None));
        };
        let runner = self.runners.get(current.runner_type)?;

        match current.job_state {
            BuildJobState::Pending => {
                let original = self
                    .engines
                    .update(
                        &|e: &Engine| e.id == engine_id && e.current_build.is_some(),
                        &|e: &mut Engine| e.current_build = None,
                        UpdateOptions::return_original(),
                    )
                    .await?;
                if let Some(build) = original.and_then(|e| e.current_build) {
                    // The job never ran, so nothing else reports the cancel.
                    self.platform
                        .build_canceled(engine_id, &build.build_id)
                        .await?;
                    // The record is already gone; a job left queued finds no
                    // pending build and ends as canceled.
                    if let Err(e) = runner.stop_job(&build.job_id).await {
                        tracing::warn!(
                            engine_id,
                            job_id = %build.job_id,
                            error = %e,
                            "Failed to stop canceled job"
                        );
                    }
                    tracing::info!(engine_id, build_id = %build.build_id, "Pending build canceled");
                    return Ok((Some(build.build_id), BuildJobState::None));
                }
            }
            BuildJobState::Active => {
                let updated = self
                    .engines
                    .update(
                        &|e: &Engine| e.id == engine_id && e.current_build.is_some(),
                        &|e: &mut Engine| {
                            if let Some(build) = e.current_build.as_mut() {
                                build.job_state = BuildJobState::Canceling;
                            }
                        },
                        UpdateOptions::default(),
                    )
                    .await?;
                if let Some(build) = updated.and_then(|e| e.current_build) {
                    runner.stop_job(&build.job_id).await?;
                    tracing::info!(engine_id, build_id = %build.build_id, "Active build canceling");
                    return Ok((Some(build.build_id), BuildJobState::Canceling));
                }
            }
            BuildJobState::Canceling | BuildJobState::None => {}
        }
        Ok((None, BuildJobState::None))
    }

    /// `Pending -> Active`. Returns false when the build is no longer pending
    /// (canceled or replaced), in which case the job must not run.
    pub async fn build_job_started(&self, engine_id: &str, build_id: &str) -> Result<bool> {
        self.with_engine_lock(engine_id, || async {
            self.apply(engine_id, build_id, &[BuildJobState::Pending], &|e: &mut Engine| {
                if let Some(build) = e.current_build.as_mut() {
                    build.job_state = BuildJobState::Active;
                }
            })
            .await
        })
        .await
    }

    /// Clear the build. A successful build advances the engine's revision.
    pub async fn build_job_finished(
        &self,
        engine_id: &str,
        build_id: &str,
        success: bool,
    ) -> Result<bool> {
        self.with_engine_lock(engine_id, || {
            self.build_job_finished_locked(engine_id, build_id, success)
        })
        .await
    }

    /// [`build_job_finished`](Self::build_job_finished) for a caller already
    /// holding [`engine_lock`](Self::engine_lock).
    pub async fn build_job_finished_locked(
        &self,
        engine_id: &str,
        build_id: &str,
        success: bool,
    ) -> Result<bool> {
        let finished = self
            .apply(
                engine_id,
                build_id,
                &[
                    BuildJobState::Pending,
                    BuildJobState::Active,
                    BuildJobState::Canceling,
                ],
                &|e: &mut Engine| {
                    e.current_build = None;
                    if success {
                        e.build_revision += 1;
                    }
                },
            )
            .await?;
        if finished {
            tracing::info!(engine_id, build_id, success, "Build finished");
        }
        Ok(finished)
    }

    /// `Active -> Pending`: put an interrupted build back so it runs again.
    /// A build that is `Canceling` stays canceling; the cancel wins.
    pub async fn build_job_restarting(&self, engine_id: &str, build_id: &str) -> Result<bool> {
        self.with_engine_lock(engine_id, || {
            self.build_job_restarting_locked(engine_id, build_id)
        })
        .await
    }

    /// [`build_job_restarting`](Self::build_job_restarting) for a caller
    /// already holding [`engine_lock`](Self::engine_lock).
    pub async fn build_job_restarting_locked(
        &self,
        engine_id: &str,
        build_id: &str,
    ) -> Result<bool> {
        self.apply(engine_id, build_id, &[BuildJobState::Active], &|e: &mut Engine| {
            if let Some(build) = e.current_build.as_mut() {
                build.job_state = BuildJobState::Pending;
            }
        })
        .await
    }

    /// Recreate and enqueue the job of a `Pending` build whose job was lost
    /// with the host that ran it. The record is pointed at the new job.
    /// Returns false when the build is no longer pending.
    pub async fn requeue_build(&self, engine_id: &str, build_id: &str) -> Result<bool> {
        self.with_engine_lock(engine_id, || async {
            let Some(engine) = self
                .engines
                .get(&|e: &Engine| e.id == engine_id && e.is_building(build_id))
                .await?
            else {
                return Ok(false);
            };
            let Some(previous) = engine.current_build.clone() else {
                return Ok(false);
            };
            if previous.job_state != BuildJobState::Pending {
                return Ok(false);
            }

            let runner = self.runners.get(previous.runner_type)?.clone();
            let job_id = runner
                .create_job(JobDefinition {
                    engine_type: engine.engine_type.clone(),
                    engine_id: engine_id.to_string(),
                    build_id: build_id.to_string(),
                    stage: previous.stage,
                    data: previous.data.clone(),
                    options: previous.options.clone(),
                    continuation: false,
                })
                .await?;

            let replaced = self
                .engines
                .update(
                    &|e: &Engine| e.id == engine_id && e.current_build.as_ref() == Some(&previous),
                    &|e: &mut Engine| {
                        if let Some(build) = e.current_build.as_mut() {
                            build.job_id = job_id.clone();
                        }
                    },
                    UpdateOptions::default(),
                )
                .await;
            match replaced {
                Ok(Some(_)) => {}
                Ok(None) => {
                    discard_job(runner.as_ref(), &job_id).await;
                    return Ok(false);
                }
                Err(e) => {
                    discard_job(runner.as_ref(), &job_id).await;
                    return Err(e);
                }
            }

            if let Err(e) = runner.enqueue_job(&job_id, &engine.engine_type).await {
                let restore = self
                    .engines
                    .update(
                        &|e: &Engine| {
                            e.id == engine_id
                                && e.current_build.as_ref().is_some_and(|b| b.job_id == job_id)
                        },
                        &|e: &mut Engine| e.current_build = Some(previous.clone()),
                        UpdateOptions::default(),
                    )
                    .await;
                if let Err(restore) = restore {
                    tracing::error!(engine_id, error = %restore, "Failed to restore build record");
                }
                discard_job(runner.as_ref(), &job_id).await;
                return Err(e);
            }

            tracing::info!(
                engine_id,
                build_id,
                old_job_id = %previous.job_id,
                job_id = %job_id,
                "Build job requeued"
            );
            Ok(true)
        })
        .await
    }

    async fn with_engine_lock<T, F, Fut>(&self, engine_id: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.locks
            .get(engine_id)
            .with_writer_lock(None, &CancellationToken::new(), f)
            .await
    }

    /// Mutate the engine if `build_id` is its current build and in one of
    /// the `from` states. Callers hold the engine lock.
    async fn apply(
        &self,
        engine_id: &str,
        build_id: &str,
        from: &[BuildJobState],
        mutation: &Mutation<'_, Engine>,
    ) -> Result<bool> {
        let updated = self
            .engines
            .update(
                &|e: &Engine| {
                    e.id == engine_id
                        && e.current_build
                            .as_ref()
                            .is_some_and(|b| b.build_id == build_id && from.contains(&b.job_state))
                },
                mutation,
                UpdateOptions::default(),
            )
            .await?;
        Ok(updated.is_some())
    }
}

async fn discard_job(runner: &dyn BuildJobRunner, job_id: &str) {
    if let Err(e) = runner.delete_job(job_id).await {
        tracing::warn!(job_id, error = %e, "Failed to delete orphaned build job");
    }
}
