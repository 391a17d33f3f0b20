//! Resizable pool of processors sharing one job queue.
//!
//! The pool starts `pool_size` processors and then waits for all of them to
//! stop. Resizing adds processors or gracefully shuts down the newest ones.
//! A pause toggle lets an operator drain the pool without `run` returning.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use buildworker_core::{LogWriterFactory, WorkerConfig};
use buildworker_executor::{Pipeline, PipelineDeps, job_pipeline};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::processor::{Processor, ProcessorInfo, processor_id};
use crate::queue::JobQueue;
use crate::{PoolErrorKind, PoolResult};

/// Counts running processors; `wait` resolves once it drops to zero.
#[derive(Debug, Clone)]
struct WaitGroup {
    count: Arc<watch::Sender<usize>>,
}

impl WaitGroup {
    fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    fn add(&self) {
        self.count.send_modify(|c| *c += 1);
    }

    fn done(&self) {
        self.count.send_modify(|c| *c = c.saturating_sub(1));
    }

    async fn wait(&self) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|c| *c == 0).await;
    }
}

/// Running processors plus the job count of the ones that stopped.
#[derive(Default)]
struct Alive {
    processors: Vec<Arc<Processor>>,
    retired_processed: usize,
}

impl Alive {
    fn retire(&mut self, processor: &Processor) {
        self.processors.retain(|p| p.id() != processor.id());
        self.retired_processed += processor.processed();
    }
}

#[derive(Default)]
struct Resize {
    queue: Option<Arc<dyn JobQueue>>,
    log_writer_factory: Option<Arc<dyn LogWriterFactory>>,
    pause_count: u32,
    errors: Vec<String>,
}

/// Runs a variable number of [`Processor`]s against one queue.
pub struct ProcessorPool {
    config: Arc<WorkerConfig>,
    pipeline: Arc<Pipeline>,
    token: CancellationToken,

    /// Serializes resizes. Held across processor creation.
    resize: tokio::sync::Mutex<Resize>,
    processors: Mutex<Vec<Arc<Processor>>>,
    /// Processors whose `run` has not returned, including shut down ones
    /// still finishing a job.
    alive: Arc<Mutex<Alive>>,
    active: Arc<AtomicUsize>,
    running: WaitGroup,
    first_started: CancellationToken,
}

impl std::fmt::Debug for ProcessorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorPool")
            .field("size", &self.size())
            .field("expected_size", &self.expected_size())
            .finish_non_exhaustive()
    }
}

impl ProcessorPool {
    /// Creates an empty pool. Every processor runs the standard job
    /// pipeline built from `deps`.
    #[must_use]
    pub fn new(config: WorkerConfig, deps: &PipelineDeps) -> Self {
        let pipeline = Arc::new(job_pipeline(deps, &config));
        Self {
            config: Arc::new(config),
            pipeline,
            token: CancellationToken::new(),
            resize: tokio::sync::Mutex::new(Resize::default()),
            processors: Mutex::new(Vec::new()),
            alive: Arc::new(Mutex::new(Alive::default())),
            active: Arc::new(AtomicUsize::new(0)),
            running: WaitGroup::new(),
            first_started: CancellationToken::new(),
        }
    }

    /// Starts `pool_size` processors on `queue` and waits until every
    /// processor has stopped.
    ///
    /// # Errors
    ///
    /// Fails when some processors could not be created. The ones that did
    /// start are shut down gracefully first.
    pub async fn run(
        &self,
        pool_size: usize,
        queue: Arc<dyn JobQueue>,
        log_writer_factory: Option<Arc<dyn LogWriterFactory>>,
    ) -> PoolResult {
        {
            let mut resize = self.resize.lock().await;
            resize.queue = Some(queue);
            resize.log_writer_factory = log_writer_factory;

            for _ in 0..pool_size {
                self.incr_locked(&mut resize).await;
            }

            if !resize.errors.is_empty() {
                let errors = std::mem::take(&mut resize.errors);
                error!(errors = ?errors, "failed to populate pool");
                self.decr_all_locked();
                return Err(PoolErrorKind::Populate { errors }.into());
            }
        }

        self.first_started.cancelled().await;
        self.running.wait().await;
        info!(processed = self.total_processed(), "processor pool stopped");
        Ok(())
    }

    /// Grows or shrinks the pool to `n` processors.
    pub async fn set_size(&self, n: usize) {
        let mut resize = self.resize.lock().await;
        let current = self.expected_size();
        info!(from = current, to = n, "resizing pool");
        for _ in current..n {
            self.incr_locked(&mut resize).await;
        }
        for _ in n..current {
            self.decr_locked();
        }
    }

    /// Adds one processor.
    pub async fn incr(&self) {
        let mut resize = self.resize.lock().await;
        self.incr_locked(&mut resize).await;
    }

    /// Gracefully shuts down the newest processor.
    pub async fn decr(&self) {
        let _resize = self.resize.lock().await;
        self.decr_locked();
    }

    /// Shuts every processor down gracefully.
    ///
    /// With `toggle_pause` the first call drains the pool but keeps `run`
    /// waiting, and the second call lets it return. Further calls do
    /// nothing.
    pub async fn graceful_shutdown(&self, toggle_pause: bool) {
        let mut resize = self.resize.lock().await;

        if toggle_pause {
            resize.pause_count += 1;
            match resize.pause_count {
                1 => {
                    info!("pausing pool");
                    self.running.add();
                }
                2 => {
                    info!("unpausing pool");
                    self.running.done();
                }
                _ => {
                    info!(pause_count = resize.pause_count, "pool already unpaused");
                    return;
                }
            }
        }

        self.first_started.cancel();
        self.decr_all_locked();
    }

    /// Cancels every processor's current job and stops them all.
    pub fn terminate(&self) {
        info!("terminating pool");
        self.first_started.cancel();
        self.token.cancel();
    }

    /// Processors currently running.
    #[must_use]
    pub fn size(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Processors the pool holds, including ones still finishing a job.
    #[must_use]
    pub fn expected_size(&self) -> usize {
        self.processors.lock().len()
    }

    /// Jobs run by every processor this pool started.
    #[must_use]
    pub fn total_processed(&self) -> usize {
        let alive = self.alive.lock();
        alive.retired_processed + alive.processors.iter().map(|p| p.processed()).sum::<usize>()
    }

    /// Calls `f` for each held processor in id order.
    pub fn each(&self, mut f: impl FnMut(usize, &Processor)) {
        let mut processors = self.processors.lock().clone();
        processors.sort_by(|a, b| a.id().cmp(b.id()));
        for (i, processor) in processors.iter().enumerate() {
            f(i, processor);
        }
    }

    /// Status of each held processor in id order.
    #[must_use]
    pub fn status_snapshot(&self) -> Vec<ProcessorInfo> {
        let mut infos = Vec::new();
        self.each(|_, p| infos.push(p.status_snapshot()));
        infos
    }

    async fn incr_locked(&self, resize: &mut Resize) {
        let Some(queue) = resize.queue.clone() else {
            resize.errors.push("pool has no job queue".to_string());
            return;
        };

        let id = processor_id(&self.config.hostname);
        let processor = match Processor::new(
            id,
            Arc::clone(&self.config),
            Arc::clone(&self.pipeline),
            queue.as_ref(),
            resize.log_writer_factory.clone(),
            &self.token,
        )
        .await
        {
            Ok(processor) => Arc::new(processor),
            Err(err) => {
                error!(queue = %queue.name(), error = %err, "couldn't create processor");
                resize.errors.push(err.to_string());
                return;
            }
        };

        info!(processor = %processor.id(), "incrementing pool");
        self.processors.lock().push(Arc::clone(&processor));
        self.alive.lock().processors.push(Arc::clone(&processor));
        self.running.add();
        self.active.fetch_add(1, Ordering::SeqCst);

        let alive = Arc::clone(&self.alive);
        let active = Arc::clone(&self.active);
        let running = self.running.clone();
        tokio::spawn(async move {
            processor.run().await;
            alive.lock().retire(&processor);
            active.fetch_sub(1, Ordering::SeqCst);
            running.done();
        });

        self.first_started.cancel();
    }

    fn decr_locked(&self) {
        let Some(processor) = self.processors.lock().pop() else {
            return;
        };
        info!(processor = %processor.id(), "decrementing pool");
        processor.graceful_shutdown();
    }

    fn decr_all_locked(&self) {
        let processors = std::mem::take(&mut *self.processors.lock());
        for processor in processors.iter().rev() {
            info!(processor = %processor.id(), "decrementing pool");
            processor.graceful_shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildworker_core::testing::{FakeProvider, StaticScriptGenerator};
    use buildworker_core::{CancellationBroadcaster, QueueError};
    use crate::queue::{ChannelJobQueue, JobStream};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn deps() -> PipelineDeps {
        PipelineDeps {
            provider: Arc::new(FakeProvider::default()),
            generator: Arc::new(StaticScriptGenerator::new("echo hi")),
            persister: None,
            broadcaster: CancellationBroadcaster::new(),
        }
    }

    struct BrokenQueue;

    #[async_trait]
    impl JobQueue for BrokenQueue {
        async fn jobs(&self, _token: CancellationToken) -> Result<JobStream, QueueError> {
            Err(buildworker_core::QueueErrorKind::Unavailable {
                reason: "broker down".to_string(),
            }
            .into())
        }

        fn name(&self) -> String {
            "broken".to_string()
        }

        async fn cleanup(&self) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_wait_group_resolves_at_zero() {
        let wg = WaitGroup::new();
        wg.add();
        wg.add();
        let waiter = {
            let wg = wg.clone();
            tokio::spawn(async move { wg.wait().await })
        };
        wg.done();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        wg.done();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_fails_when_queue_is_broken() {
        let pool = ProcessorPool::new(WorkerConfig::default(), &deps());
        let err = pool.run(2, Arc::new(BrokenQueue), None).await.unwrap_err();

        let crate::PoolErrorKind::Populate { errors } = err.kind();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("broker down"));
        assert_eq!(pool.expected_size(), 0);
    }

    #[tokio::test]
    async fn test_resizing_releases_stopped_processors() {
        let pool = Arc::new(ProcessorPool::new(WorkerConfig::default(), &deps()));
        let (queue, _sender) = ChannelJobQueue::new(1);
        let runner = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.run(1, Arc::new(queue), None).await })
        };

        for _ in 0..20 {
            pool.set_size(4).await;
            pool.set_size(1).await;
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.size() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(pool.expected_size(), 1);
        assert_eq!(pool.alive.lock().processors.len(), 1);
        assert_eq!(pool.total_processed(), 0);

        pool.graceful_shutdown(false).await;
        runner.await.unwrap().unwrap();
        assert!(pool.alive.lock().processors.is_empty());
    }

    #[tokio::test]
    async fn test_each_visits_in_id_order() {
        let pool = Arc::new(ProcessorPool::new(WorkerConfig::default(), &deps()));
        let (queue, _sender) = ChannelJobQueue::new(1);
        let runner = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.run(3, Arc::new(queue), None).await })
        };

        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.expected_size() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let mut ids = Vec::new();
        pool.each(|i, p| ids.push((i, p.id().to_string())));
        let mut sorted = ids.clone();
        sorted.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(ids, sorted);
        assert_eq!(ids.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);

        pool.graceful_shutdown(false).await;
        runner.await.unwrap().unwrap();
        assert_eq!(pool.size(), 0);
    }
}
