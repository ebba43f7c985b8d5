//! Wave-based bounded concurrency.
//!
//! Tasks are cut into waves of `min(pool_size, worker_budget)` and pushed
//! through a worker pool that lives for one [`BoundedConcurrencyScheduler::run_all`]
//! call. A wave must drain completely before the next one starts, and an
//! unconditional cooldown separates waves. Task failures are folded into
//! their [`FetchResult`]; only pool setup errors reach the caller.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::batch::partition;
use crate::cancel::{CancellationToken, Sleeper};
use crate::domain::{FetchResult, RetrievalTask};
use crate::error::XrefError;
use crate::retriever::DataRetriever;

pub const DEFAULT_WORKER_BUDGET: usize = 10;
pub const DEFAULT_INTER_WAVE_COOLDOWN: Duration = Duration::from_secs(5);

type Job = (usize, RetrievalTask);

struct WorkerPool {
    jobs: Option<Sender<Job>>,
    results: Receiver<(usize, FetchResult)>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(size: usize, retriever: Arc<dyn DataRetriever>) -> Result<Self, XrefError> {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (result_tx, result_rx) = mpsc::channel();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let retriever = Arc::clone(&retriever);
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{index}", retriever.name()))
                .spawn(move || {
                    loop {
                        let job = {
                            let guard = job_rx.lock().unwrap_or_else(|p| p.into_inner());
                            guard.recv()
                        };
                        let Ok((slot, task)) = job else {
                            break;
                        };
                        let result = run_task(retriever.as_ref(), &task);
                        if result_tx.send((slot, result)).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|err| XrefError::WorkerPool(err.to_string()))?;
            workers.push(handle);
        }

        Ok(Self {
            jobs: Some(job_tx),
            results: result_rx,
            workers,
        })
    }

    fn submit(&self, slot: usize, task: RetrievalTask) -> Result<(), XrefError> {
        self.jobs
            .as_ref()
            .ok_or_else(|| XrefError::WorkerPool("pool already shut down".to_string()))?
            .send((slot, task))
            .map_err(|_| XrefError::WorkerPool("all workers exited".to_string()))
    }

    fn collect(&self) -> Result<(usize, FetchResult), XrefError> {
        self.results
            .recv()
            .map_err(|_| XrefError::WorkerPool("all workers exited".to_string()))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.jobs.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn run_task(retriever: &dyn DataRetriever, task: &RetrievalTask) -> FetchResult {
    match catch_unwind(AssertUnwindSafe(|| retriever.retrieve(task))) {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            error!(
                retriever = %task.retriever,
                source = %task.source_locator,
                destination = %task.destination,
                species = ?task.context.species.as_ref().map(|s| s.as_str()),
                reference_db = ?task.context.reference_db.as_ref().map(|r| r.as_str()),
                kind = %err.kind(),
                "task failed: {err}"
            );
            FetchResult::failed(task, &err)
        }
        Err(payload) => {
            let err = XrefError::TaskPanicked(panic_message(payload.as_ref()));
            error!(
                retriever = %task.retriever,
                destination = %task.destination,
                "task panicked: {err}"
            );
            FetchResult::failed(task, &err)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "unknown panic".to_string()
}

#[derive(Clone)]
pub struct BoundedConcurrencyScheduler {
    worker_budget: usize,
    cooldown: Duration,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancellationToken,
}

impl BoundedConcurrencyScheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            worker_budget: DEFAULT_WORKER_BUDGET,
            cooldown: DEFAULT_INTER_WAVE_COOLDOWN,
            sleeper: Arc::new(cancel.clone()),
            cancel,
        }
    }

    pub fn with_worker_budget(mut self, budget: usize) -> Self {
        self.worker_budget = budget;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn effective_parallelism(&self, pool_size: usize) -> usize {
        pool_size.min(self.worker_budget)
    }

    /// Runs every task and returns one result per task, in task order.
    ///
    /// Tasks go out in waves of `min(pool_size, worker budget)`. The pause
    /// between waves is the cooldown set with [`Self::with_cooldown`]
    /// (configured as `inter_wave_cooldown_secs`), not a per-call argument.
    pub fn run_all(
        &self,
        retriever: Arc<dyn DataRetriever>,
        tasks: Vec<RetrievalTask>,
        pool_size: usize,
    ) -> Result<Vec<FetchResult>, XrefError> {
        let parallelism = self.effective_parallelism(pool_size);
        if parallelism == 0 {
            return Err(XrefError::Configuration(
                "worker pool size must be greater than zero".to_string(),
            ));
        }
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let name = retriever.name().to_string();
        let indexed = tasks.into_iter().enumerate().collect::<Vec<_>>();
        let waves = partition(&indexed, parallelism)?;
        let pool = WorkerPool::new(parallelism, retriever)?;
        let mut results: Vec<Option<FetchResult>> = vec![None; indexed.len()];
        let wave_count = waves.len();
        let mut stopped: Option<XrefError> = None;

        for (wave_index, wave) in waves.into_iter().enumerate() {
            if wave_index > 0 {
                if let Err(err) = self.sleeper.sleep(self.cooldown) {
                    stopped = Some(err);
                    break;
                }
            }
            if self.cancel.is_cancelled() {
                stopped = Some(XrefError::Cancelled);
                break;
            }

            let size = wave.len();
            for (slot, task) in wave {
                pool.submit(slot, task)?;
            }
            let mut failed = 0usize;
            for _ in 0..size {
                let (slot, result) = pool.collect()?;
                if !result.succeeded() {
                    failed += 1;
                }
                results[slot] = Some(result);
            }
            info!(
                retriever = %name,
                wave = wave_index + 1,
                waves = wave_count,
                tasks = size,
                failed,
                "wave complete"
            );
        }
        drop(pool);

        if let Some(err) = &stopped {
            let pending = results.iter().filter(|r| r.is_none()).count();
            warn!(retriever = %name, pending, "stopping before all waves ran: {err}");
        }
        Ok(results
            .into_iter()
            .zip(indexed)
            .map(|(result, (_, task))| {
                result.unwrap_or_else(|| {
                    FetchResult::failed(&task, stopped.as_ref().unwrap_or(&XrefError::Cancelled))
                })
            })
            .collect())
    }
}
