use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::blob::{BlobStore, FileBlobStore, MemoryBlobStore};
use crate::build::{
    BuildJob, BuildJobExecutor, BuildJobService, BuildJobState, Engine, LocalQueueRunner,
    LocalWorker, RunnerRegistry, RunnerType,
};
use crate::config::HostConfig;
use crate::error::Result;
use crate::lock::{LockDocument, LockFactory};
use crate::outbox::{Outbox, OutboxCounter, OutboxDeliveryService, OutboxMessage};
use crate::platform::{OutboxPlatformService, PlatformApi, PlatformOutboxHandler, PlatformService};
use crate::store::{MemoryRepository, Repository};

/// The shared state every host of a deployment points at.
#[derive(Clone)]
pub struct HostStores {
    pub engines: Arc<dyn Repository<Engine>>,
    pub locks: Arc<dyn Repository<LockDocument>>,
    pub messages: Arc<dyn Repository<OutboxMessage>>,
    pub counters: Arc<dyn Repository<OutboxCounter>>,
    pub blobs: Arc<dyn BlobStore>,
}

impl HostStores {
    /// Fresh in-memory stores. Clone the result to give several hosts the
    /// same view.
    pub fn in_memory() -> Self {
        Self {
            engines: Arc::new(MemoryRepository::<Engine>::new()),
            locks: Arc::new(MemoryRepository::<LockDocument>::new()),
            messages: Arc::new(MemoryRepository::<OutboxMessage>::new()),
            counters: Arc::new(MemoryRepository::<OutboxCounter>::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
        }
    }

    /// In-memory stores, with blobs on disk when `config.blob_dir` is set.
    pub fn from_config(config: &HostConfig) -> Self {
        let mut stores = Self::in_memory();
        if let Some(dir) = &config.blob_dir {
            stores.blobs = Arc::new(FileBlobStore::new(dir.clone()));
        }
        stores
    }
}

/// One process worth of components, wired together.
pub struct Host {
    pub config: HostConfig,
    pub stores: HostStores,
    pub locks: LockFactory,
    pub outbox: Outbox,
    pub platform: Arc<dyn PlatformService>,
    pub service: Arc<BuildJobService>,
    pub executor: Arc<BuildJobExecutor>,
    pub delivery: Arc<OutboxDeliveryService>,
    pub cpu_runner: Arc<LocalQueueRunner>,
    pub gpu_runner: Arc<LocalQueueRunner>,
}

impl Host {
    pub fn new(
        config: HostConfig,
        stores: HostStores,
        api: Arc<dyn PlatformApi>,
        jobs: Vec<Arc<dyn BuildJob>>,
    ) -> Self {
        let locks = LockFactory::new(
            config.host_id.clone(),
            stores.locks.clone(),
            config.locks.clone(),
        );
        let outbox = Outbox::new(
            stores.messages.clone(),
            stores.counters.clone(),
            stores.blobs.clone(),
            config.outbox.clone(),
        );
        let platform: Arc<dyn PlatformService> =
            Arc::new(OutboxPlatformService::new(outbox.clone()));

        let cpu_runner = Arc::new(LocalQueueRunner::new(RunnerType::Cpu));
        let gpu_runner = Arc::new(LocalQueueRunner::new(RunnerType::Gpu));
        let runners = RunnerRegistry::new()
            .with_runner(cpu_runner.clone())
            .with_runner(gpu_runner.clone());

        let service = Arc::new(BuildJobService::new(
            stores.engines.clone(),
            locks.clone(),
            runners,
            platform.clone(),
        ));

        let mut executor =
            BuildJobExecutor::new(stores.engines.clone(), service.clone(), platform.clone());
        for job in jobs {
            executor.register(job);
        }

        let delivery = OutboxDeliveryService::new(
            stores.messages.clone(),
            stores.blobs.clone(),
            config.outbox.clone(),
        )
        .with_handler(Arc::new(PlatformOutboxHandler::new(api)));

        Self {
            config,
            stores,
            locks,
            outbox,
            platform,
            service,
            executor: Arc::new(executor),
            delivery: Arc::new(delivery),
            cpu_runner,
            gpu_runner,
        }
    }

    /// Run the host until `shutdown` fires.
    ///
    /// 1. Releases any locks a previous run of this host left behind
    /// 2. Requeues pending builds whose job this process does not hold
    /// 3. Spawns the outbox delivery loop
    /// 4. Spawns a worker per local runner
    ///
    /// # Errors
    ///
    /// Returns an error if crash recovery fails; nothing is started then.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let cleared = self.locks.init().await?;
        tracing::info!(host_id = %self.config.host_id, cleared, "Host starting");
        let requeued = self.recover_builds().await?;
        if requeued > 0 {
            tracing::info!(host_id = %self.config.host_id, requeued, "Recovered pending builds");
        }

        let delivery = self.delivery.clone();
        let delivery_shutdown = shutdown.clone();
        let delivery_task = tokio::spawn(async move {
            delivery.run(delivery_shutdown).await;
        });

        let cpu_worker = LocalWorker::new(
            self.cpu_runner.clone(),
            self.executor.clone(),
            self.config.workers.cpu_concurrency,
        );
        let cpu_task = tokio::spawn(cpu_worker.run(shutdown.clone()));

        let gpu_worker = LocalWorker::new(
            self.gpu_runner.clone(),
            self.executor.clone(),
            self.config.workers.gpu_concurrency,
        );
        let gpu_task = tokio::spawn(gpu_worker.run(shutdown.clone()));

        shutdown.cancelled().await;

        let tasks = [
            ("delivery", delivery_task),
            ("cpu worker", cpu_task),
            ("gpu worker", gpu_task),
        ];
        for (name, task) in tasks {
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "Host task panicked");
            }
        }
        tracing::info!(host_id = %self.config.host_id, "Host stopped");
        Ok(())
    }

    /// Local runner queues live in process memory, so a build left `Pending`
    /// by an earlier run (an interrupted job, or one never picked up) has a
    /// job id nothing here knows. Give each such build a fresh job.
    async fn recover_builds(&self) -> Result<usize> {
        let mut requeued = 0;
        for (runner_type, runner) in [
            (RunnerType::Cpu, &self.cpu_runner),
            (RunnerType::Gpu, &self.gpu_runner),
        ] {
            for engine in self.service.get_building_engines(runner_type).await? {
                let Some(build) = engine.current_build else {
                    continue;
                };
                if build.job_state != BuildJobState::Pending
                    || runner.get_job(&build.job_id).await.is_some()
                {
                    continue;
                }
                match self.service.requeue_build(&engine.id, &build.build_id).await {
                    Ok(true) => requeued += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(
                            engine_id = %engine.id,
                            build_id = %build.build_id,
                            error = %e,
                            "Failed to requeue build"
                        );
                    }
                }
            }
        }
        Ok(requeued)
    }
}
