use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::bail;
use tokio::select;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

pub type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A fixed number of workers sharing a single FIFO task queue. Tasks are submitted without
///  blocking; the queue is unbounded.
///
/// A worker whose task panics is replaced by a fresh one, so the pool stays at its nominal
///  size without application code having to care.
pub struct WorkerPool {
    size: usize,
    sender: mpsc::UnboundedSender<Task>,
    shared: Arc<PoolShared>,
    shutdown_send: watch::Sender<bool>,
    supervisors: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

struct PoolShared {
    receiver: Mutex<mpsc::UnboundedReceiver<Task>>,
    is_shut_down: AtomicBool,
    num_live: AtomicUsize,
    num_idle: AtomicUsize,
    num_queued: AtomicUsize,
}

/// decrements the live worker count when a worker ends, regardless of how it ends
struct LiveWorkerGuard(Arc<PoolShared>);
impl Drop for LiveWorkerGuard {
    fn drop(&mut self) {
        self.0.num_live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerPool {
    /// NB: This spawns tokio tasks, so it must be called in the context of a tokio runtime
    pub fn new(size: usize) -> Arc<WorkerPool> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown_send, shutdown_recv) = watch::channel(false);

        let shared = Arc::new(PoolShared {
            receiver: Mutex::new(receiver),
            is_shut_down: AtomicBool::new(false),
            num_live: AtomicUsize::new(0),
            num_idle: AtomicUsize::new(0),
            num_queued: AtomicUsize::new(0),
        });

        let supervisors = (0..size)
            .map(|worker_id| tokio::spawn(Self::supervise(worker_id, shared.clone(), shutdown_recv.clone())))
            .collect();

        info!("started worker pool with {} workers", size);
        Arc::new(WorkerPool {
            size,
            sender,
            shared,
            shutdown_send,
            supervisors: std::sync::Mutex::new(supervisors),
        })
    }

    pub fn submit(&self, task: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        if self.shared.is_shut_down.load(Ordering::Acquire) {
            bail!("worker pool is shut down");
        }

        self.shared.num_queued.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(Box::pin(task)).is_err() {
            self.shared.num_queued.fetch_sub(1, Ordering::AcqRel);
            bail!("worker pool is shut down");
        }
        Ok(())
    }

    /// Stops accepting tasks and discards queued tasks without running them. Tasks that are
    ///  already running are allowed to finish, and this function returns when all workers
    ///  are done.
    pub async fn shutdown(&self) {
        if self.shared.is_shut_down.swap(true, Ordering::AcqRel) {
            debug!("worker pool is already shut down");
            return;
        }
        info!("shutting down worker pool");
        self.shutdown_send.send_replace(true);

        {
            let mut receiver = self.shared.receiver.lock().await;
            receiver.close();
            let mut num_discarded = 0;
            while receiver.try_recv().is_ok() {
                self.shared.num_queued.fetch_sub(1, Ordering::AcqRel);
                num_discarded += 1;
            }
            if num_discarded > 0 {
                debug!("discarded {} queued tasks", num_discarded);
            }
        }

        let supervisors = match self.supervisors.lock() {
            Ok(mut supervisors) => std::mem::take(&mut *supervisors),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in supervisors {
            if let Err(e) = handle.await {
                error!("worker supervisor ended abnormally: {}", e);
            }
        }
        info!("worker pool shut down");
    }

    /// the nominal number of workers
    pub fn size(&self) -> usize {
        self.size
    }

    /// the number of workers that are currently alive. This is [WorkerPool::size] except
    ///  for the short time between a worker dying and its replacement being started, and
    ///  after shutdown.
    pub fn worker_count(&self) -> usize {
        self.shared.num_live.load(Ordering::Acquire)
    }

    pub fn idle_worker_count(&self) -> usize {
        self.shared.num_idle.load(Ordering::Acquire)
    }

    pub fn queued_task_count(&self) -> usize {
        self.shared.num_queued.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down.load(Ordering::Acquire)
    }

    async fn supervise(worker_id: usize, shared: Arc<PoolShared>, shutdown_recv: watch::Receiver<bool>) {
        loop {
            shared.num_live.fetch_add(1, Ordering::AcqRel);
            let guard = LiveWorkerGuard(shared.clone());

            let worker = tokio::spawn(Self::worker_loop(worker_id, guard, shared.clone(), shutdown_recv.clone()));
            match worker.await {
                Ok(()) => {
                    trace!("worker {} terminated", worker_id);
                    return;
                }
                Err(e) if e.is_panic() => {
                    if shared.is_shut_down.load(Ordering::Acquire) {
                        return;
                    }
                    warn!("worker {} panicked - replacing it", worker_id);
                }
                Err(e) => {
                    debug!("worker {} was cancelled: {}", worker_id, e);
                    return;
                }
            }
        }
    }

    async fn worker_loop(worker_id: usize, _guard: LiveWorkerGuard, shared: Arc<PoolShared>, mut shutdown_recv: watch::Receiver<bool>) {
        trace!("worker {} started", worker_id);

        loop {
            if *shutdown_recv.borrow() {
                return;
            }

            shared.num_idle.fetch_add(1, Ordering::AcqRel);
            let task = select! {
                biased;
                _ = shutdown_recv.changed() => None,
                task = async { shared.receiver.lock().await.recv().await } => task,
            };
            shared.num_idle.fetch_sub(1, Ordering::AcqRel);

            match task {
                Some(task) => {
                    shared.num_queued.fetch_sub(1, Ordering::AcqRel);
                    task.await;
                }
                None => return,
            }
        }
    }
}
