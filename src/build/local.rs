use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::build::job::{BuildJobExecutor, JobCompletionStatus};
use crate::build::model::RunnerType;
use crate::build::runner::{BuildJobRunner, JobDefinition};
use crate::error::{CoordError, Result};

const DEFAULT_MAX_JOBS: usize = 10_000;
/// How long stopped and finished jobs stay visible before the worker prunes them.
const DEFAULT_FINISHED_RETENTION: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuedJobStatus {
    /// Created but not yet runnable.
    Created,
    Queued,
    Running,
    Stopped,
    Finished(JobCompletionStatus),
}

impl std::fmt::Display for QueuedJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueuedJobStatus::Created => write!(f, "created"),
            QueuedJobStatus::Queued => write!(f, "queued"),
            QueuedJobStatus::Running => write!(f, "running"),
            QueuedJobStatus::Stopped => write!(f, "stopped"),
            QueuedJobStatus::Finished(status) => write!(f, "finished ({})", status),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: String,
    pub definition: JobDefinition,
    pub status: QueuedJobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    stop: Option<CancellationToken>,
}

impl QueuedJob {
    /// Created, queued or running: the job still holds a capacity slot.
    pub fn is_live(&self) -> bool {
        matches!(
            self.status,
            QueuedJobStatus::Created | QueuedJobStatus::Queued | QueuedJobStatus::Running
        )
    }

    fn new(definition: JobDefinition) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            definition,
            status: QueuedJobStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            stop: None,
        }
    }
}

/// Job table plus the FIFO of runnable job ids.
#[derive(Debug, Default)]
struct JobTable {
    jobs: HashMap<String, QueuedJob>,
    ready: VecDeque<String>,
}

/// In-process [`BuildJobRunner`]: jobs are kept in memory and executed by a
/// [`LocalWorker`] on this host.
pub struct LocalQueueRunner {
    runner_type: RunnerType,
    table: RwLock<JobTable>,
    max_jobs: usize,
    ready: Notify,
}

impl LocalQueueRunner {
    pub fn new(runner_type: RunnerType) -> Self {
        Self::with_capacity(runner_type, DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(runner_type: RunnerType, max_jobs: usize) -> Self {
        Self {
            runner_type,
            table: RwLock::new(JobTable::default()),
            max_jobs,
            ready: Notify::new(),
        }
    }

    pub async fn get_job(&self, job_id: &str) -> Option<QueuedJob> {
        self.table.read().await.jobs.get(job_id).cloned()
    }

    /// All jobs sorted chronologically by creation time
    pub async fn all_jobs(&self) -> Vec<QueuedJob> {
        let mut jobs: Vec<QueuedJob> = self.table.read().await.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub async fn queued_len(&self) -> usize {
        self.table.read().await.ready.len()
    }

    /// Take the next runnable job, marking it running under a stop token
    /// derived from `shutdown`.
    pub async fn take_next(
        &self,
        shutdown: &CancellationToken,
    ) -> Option<(QueuedJob, CancellationToken)> {
        let mut table = self.table.write().await;
        while let Some(job_id) = table.ready.pop_front() {
            let Some(job) = table.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.status != QueuedJobStatus::Queued {
                continue;
            }
            let stop = shutdown.child_token();
            job.status = QueuedJobStatus::Running;
            job.started_at = Some(Utc::now());
            job.stop = Some(stop.clone());
            return Some((job.clone(), stop));
        }
        None
    }

    /// Record how a run ended. A run that ends `Restarting` was interrupted
    /// with its build put back to `Pending`, so the job goes back on the
    /// queue to run again.
    pub async fn complete(&self, job_id: &str, status: JobCompletionStatus) {
        let mut table = self.table.write().await;
        let Some(job) = table.jobs.get_mut(job_id) else {
            return;
        };
        job.stop = None;
        if status == JobCompletionStatus::Restarting {
            job.status = QueuedJobStatus::Queued;
            job.started_at = None;
            // The rerun announces itself again after the restart notice.
            job.definition.continuation = false;
            table.ready.push_back(job_id.to_string());
            drop(table);
            tracing::debug!(job_id, runner = %self.runner_type, "Job re-queued after restart");
            self.ready.notify_one();
            return;
        }
        job.status = QueuedJobStatus::Finished(status);
        job.completed_at = Some(Utc::now());
    }

    /// Remove stopped and finished jobs that ended more than `retention`
    /// ago. Returns the number removed.
    pub async fn cleanup_finished_jobs(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let mut table = self.table.write().await;
        let before = table.jobs.len();
        table
            .jobs
            .retain(|_, job| job.is_live() || job.completed_at.is_some_and(|at| at > cutoff));
        before - table.jobs.len()
    }

    async fn wait_for_work(&self) {
        self.ready.notified().await
    }
}

#[async_trait]
impl BuildJobRunner for LocalQueueRunner {
    fn runner_type(&self) -> RunnerType {
        self.runner_type
    }

    async fn create_engine(&self, _engine_id: &str, _name: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn delete_engine(&self, engine_id: &str) -> Result<()> {
        let mut table = self.table.write().await;
        for job in table.jobs.values_mut() {
            if job.definition.engine_id != engine_id {
                continue;
            }
            if let Some(stop) = job.stop.take() {
                stop.cancel();
            }
            if matches!(job.status, QueuedJobStatus::Created | QueuedJobStatus::Queued) {
                job.status = QueuedJobStatus::Stopped;
                job.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn create_job(&self, definition: JobDefinition) -> Result<String> {
        let mut table = self.table.write().await;
        if table.jobs.values().filter(|j| j.is_live()).count() >= self.max_jobs {
            return Err(CoordError::Runner(format!(
                "{} job queue at capacity ({} jobs)",
                self.runner_type, self.max_jobs
            )));
        }
        let job = QueuedJob::new(definition);
        let job_id = job.id.clone();
        table.jobs.insert(job_id.clone(), job);
        Ok(job_id)
    }

    async fn enqueue_job(&self, job_id: &str, _engine_type: &str) -> Result<()> {
        let mut table = self.table.write().await;
        let job = table
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| CoordError::Runner(format!("unknown job {}", job_id)))?;
        if job.status != QueuedJobStatus::Created {
            return Err(CoordError::Runner(format!(
                "job {} cannot be queued while {}",
                job_id, job.status
            )));
        }
        job.status = QueuedJobStatus::Queued;
        table.ready.push_back(job_id.to_string());
        drop(table);

        tracing::debug!(job_id, runner = %self.runner_type, "Job queued");
        self.ready.notify_one();
        Ok(())
    }

    async fn stop_job(&self, job_id: &str) -> Result<bool> {
        let mut table = self.table.write().await;
        let Some(job) = table.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        match job.status {
            QueuedJobStatus::Created | QueuedJobStatus::Queued => {
                job.status = QueuedJobStatus::Stopped;
                job.completed_at = Some(Utc::now());
                table.ready.retain(|id| id != job_id);
            }
            QueuedJobStatus::Running => {
                if let Some(stop) = &job.stop {
                    stop.cancel();
                }
            }
            QueuedJobStatus::Stopped | QueuedJobStatus::Finished(_) => {}
        }
        tracing::debug!(job_id, runner = %self.runner_type, "Job stop requested");
        Ok(true)
    }

    async fn delete_job(&self, job_id: &str) -> Result<bool> {
        let mut table = self.table.write().await;
        table.ready.retain(|id| id != job_id);
        let Some(job) = table.jobs.remove(job_id) else {
            return Ok(false);
        };
        if let Some(stop) = job.stop {
            stop.cancel();
        }
        Ok(true)
    }
}

/// Pulls jobs off a [`LocalQueueRunner`] and runs them through the
/// executor, at most `concurrency` at a time.
pub struct LocalWorker {
    runner: Arc<LocalQueueRunner>,
    executor: Arc<BuildJobExecutor>,
    concurrency: usize,
    poll_interval: Duration,
    finished_retention: Duration,
}

impl LocalWorker {
    pub fn new(
        runner: Arc<LocalQueueRunner>,
        executor: Arc<BuildJobExecutor>,
        concurrency: usize,
    ) -> Self {
        Self {
            runner,
            executor,
            concurrency: concurrency.max(1),
            poll_interval: Duration::from_millis(500),
            finished_retention: DEFAULT_FINISHED_RETENTION,
        }
    }

    pub fn with_finished_retention(mut self, retention: Duration) -> Self {
        self.finished_retention = retention;
        self
    }

    /// Worker loop. Wakes on new work or every poll interval, starts as many
    /// jobs as there are free slots, and returns once `shutdown` fires and
    /// the running jobs have wound down.
    pub async fn run(self, shutdown: CancellationToken) {
        let slots = Arc::new(Semaphore::new(self.concurrency));
        let mut interval = tokio::time::interval(self.poll_interval);
        let runner_type = self.runner.runner_type();
        tracing::info!(runner = %runner_type, concurrency = self.concurrency, "Worker started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.runner.wait_for_work() => {}
                _ = interval.tick() => {
                    let pruned = self.runner.cleanup_finished_jobs(self.finished_retention).await;
                    if pruned > 0 {
                        tracing::debug!(runner = %runner_type, pruned, "Pruned finished jobs");
                    }
                }
            }

            while let Ok(slot) = slots.clone().try_acquire_owned() {
                let Some((job, stop)) = self.runner.take_next(&shutdown).await else {
                    break;
                };
                let runner = self.runner.clone();
                let executor = self.executor.clone();
                tokio::spawn(async move {
                    let status = match executor.run(&job.id, &job.definition, &stop).await {
                        Ok(status) => status,
                        Err(e) => {
                            tracing::error!(job_id = %job.id, error = %e, "Build job failed");
                            JobCompletionStatus::Faulted
                        }
                    };
                    runner.complete(&job.id, status).await;
                    tracing::debug!(job_id = %job.id, status = %status, "Job finished");
                    drop(slot);
                    // A freed slot may unblock work that is already queued.
                    runner.ready.notify_one();
                });
            }
        }

        // Running jobs observe the cancelled stop tokens; wait for their slots.
        let _ = slots.acquire_many(self.concurrency as u32).await;
        tracing::info!(runner = %runner_type, "Worker stopped");
    }
}
