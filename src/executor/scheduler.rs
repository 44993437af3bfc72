use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::executor::worker_pool::{Task, WorkerPool};

/// Creates a fresh task each time a scheduled entry fires. Repeating entries fire many times,
///  so they can not hold a single future.
pub type TaskFactory = Arc<dyn Fn() -> Task + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleHandle(u64);

enum Command {
    Schedule {
        handle: ScheduleHandle,
        factory: TaskFactory,
        delay: Duration,
        repeat: bool,
    },
    Cancel {
        handle: ScheduleHandle,
        reply: oneshot::Sender<bool>,
    },
    PendingCount {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

struct ScheduledEntry {
    factory: TaskFactory,
    delay: Duration,
    repeat: bool,
    accumulated: Duration,
    last_credited: Instant,
}

/// Runs tasks after a delay, either once or repeatedly. A single ticking task owns all
///  pending entries: it wakes up every `tick`, credits the elapsed time to every entry and
///  fires those whose delay is used up. Other code talks to it through a command channel.
///
/// Firing means submitting to the worker pool if there is one, and running the task on the
///  ticking task otherwise.
pub struct Scheduler {
    commands: mpsc::UnboundedSender<Command>,
    next_handle: AtomicU64,
    pool: Option<Arc<WorkerPool>>,
    ticker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// NB: This spawns a tokio task, so it must be called in the context of a tokio runtime
    pub fn new(tick: Duration, pool: Option<Arc<WorkerPool>>) -> Scheduler {
        let (commands, command_recv) = mpsc::unbounded_channel();
        let ticker = tokio::spawn(Self::tick_loop(tick, command_recv, pool.clone()));

        Scheduler {
            commands,
            next_handle: AtomicU64::new(1),
            pool,
            ticker: std::sync::Mutex::new(Some(ticker)),
        }
    }

    /// A zero delay bypasses the timer: the task is fired right away and never registered.
    ///  Repeating with a zero period is rejected.
    pub fn schedule_after(&self, factory: TaskFactory, delay: Duration, repeat: bool) -> anyhow::Result<ScheduleHandle> {
        if delay.is_zero() && repeat {
            bail!("a repeating task requires a non-zero delay");
        }
        let handle = ScheduleHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));

        if delay.is_zero() {
            trace!("zero delay - firing {:?} immediately", handle);
            self.fire_now(factory())?;
            return Ok(handle);
        }

        self.commands.send(Command::Schedule { handle, factory, delay, repeat })
            .map_err(|_| anyhow!("scheduler is shut down"))?;
        Ok(handle)
    }

    /// Returns `true` if the entry was still pending, i.e. if cancelling it had an effect
    pub async fn cancel_scheduled(&self, handle: ScheduleHandle) -> bool {
        let (reply, reply_recv) = oneshot::channel();
        if self.commands.send(Command::Cancel { handle, reply }).is_err() {
            return false;
        }
        reply_recv.await.unwrap_or(false)
    }

    pub async fn pending_count(&self) -> usize {
        let (reply, reply_recv) = oneshot::channel();
        if self.commands.send(Command::PendingCount { reply }).is_err() {
            return 0;
        }
        reply_recv.await.unwrap_or(0)
    }

    /// Drops all pending entries and stops the ticking task. Tasks that were already handed
    ///  to the worker pool are not affected.
    pub async fn shutdown(&self) {
        let ticker = match self.ticker.lock() {
            Ok(mut ticker) => ticker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(ticker) = ticker else {
            debug!("scheduler is already shut down");
            return;
        };

        info!("shutting down scheduler");
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = ticker.await {
            warn!("scheduler ticker ended abnormally: {}", e);
        }
    }

    fn fire_now(&self, task: Task) -> anyhow::Result<()> {
        match &self.pool {
            Some(pool) => pool.submit(task),
            None => {
                if self.commands.is_closed() {
                    bail!("scheduler is shut down");
                }
                tokio::spawn(task);
                Ok(())
            }
        }
    }

    async fn tick_loop(tick: Duration, mut commands: mpsc::UnboundedReceiver<Command>, pool: Option<Arc<WorkerPool>>) {
        let mut entries: FxHashMap<ScheduleHandle, ScheduledEntry> = FxHashMap::default();

        let mut ticks = interval(tick);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Schedule { handle, factory, delay, repeat }) => {
                            trace!("scheduling {:?} after {:?}, repeat={}", handle, delay, repeat);
                            entries.insert(handle, ScheduledEntry {
                                factory,
                                delay,
                                repeat,
                                accumulated: Duration::ZERO,
                                last_credited: Instant::now(),
                            });
                        }
                        Some(Command::Cancel { handle, reply }) => {
                            let was_pending = entries.remove(&handle).is_some();
                            trace!("cancelling {:?}: was pending={}", handle, was_pending);
                            let _ = reply.send(was_pending);
                        }
                        Some(Command::PendingCount { reply }) => {
                            let _ = reply.send(entries.len());
                        }
                        Some(Command::Shutdown) | None => {
                            debug!("scheduler ticker terminating, dropping {} pending entries", entries.len());
                            return;
                        }
                    }
                }
                _ = ticks.tick() => {
                    Self::on_tick(&mut entries, pool.as_deref()).await;
                }
            }
        }
    }

    async fn on_tick(entries: &mut FxHashMap<ScheduleHandle, ScheduledEntry>, pool: Option<&WorkerPool>) {
        let now = Instant::now();

        let mut due = Vec::new();
        let mut finished = Vec::new();
        for (&handle, entry) in entries.iter_mut() {
            entry.accumulated += now.saturating_duration_since(entry.last_credited);
            entry.last_credited = now;

            if entry.accumulated >= entry.delay {
                due.push((handle, entry.factory.clone()));
                if entry.repeat {
                    entry.accumulated = Duration::ZERO;
                }
                else {
                    finished.push(handle);
                }
            }
        }
        for handle in finished {
            entries.remove(&handle);
        }

        for (handle, factory) in due {
            trace!("firing {:?}", handle);
            match pool {
                Some(pool) => {
                    if let Err(e) = pool.submit(factory()) {
                        debug!("could not submit scheduled task: {}", e);
                    }
                }
                None => factory().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use rstest::rstest;
    use tokio::time::sleep;
    use super::*;

    fn counting_factory(counter: &Arc<AtomicUsize>) -> TaskFactory {
        let counter = counter.clone();
        Arc::new(move || -> Task {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    fn tick() -> Duration {
        Duration::from_millis(50)
    }

    #[rstest]
    #[case::inline(false)]
    #[case::pool(true)]
    #[tokio::test(start_paused = true)]
    async fn test_one_shot(#[case] with_pool: bool) {
        let pool = with_pool.then(|| WorkerPool::new(2));
        let scheduler = Scheduler::new(tick(), pool);
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.schedule_after(counting_factory(&counter), Duration::from_millis(120), false).unwrap();
        assert_eq!(scheduler.pending_count().await, 1);

        sleep(Duration::from_millis(130)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_count().await, 0);

        sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating() {
        let scheduler = Scheduler::new(tick(), None);
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.schedule_after(counting_factory(&counter), Duration::from_millis(100), true).unwrap();

        sleep(Duration::from_millis(360)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.pending_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let scheduler = Scheduler::new(tick(), None);
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = scheduler.schedule_after(counting_factory(&counter), Duration::from_millis(100), true).unwrap();
        sleep(Duration::from_millis(110)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert!(scheduler.cancel_scheduled(handle).await);
        assert!(!scheduler.cancel_scheduled(handle).await);

        sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_count().await, 0);
    }

    #[rstest]
    #[case::inline(false)]
    #[case::pool(true)]
    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_fires_immediately(#[case] with_pool: bool) {
        let pool = with_pool.then(|| WorkerPool::new(1));
        let scheduler = Scheduler::new(tick(), pool);
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.schedule_after(counting_factory(&counter), Duration::ZERO, false).unwrap();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_repeat_is_rejected() {
        let scheduler = Scheduler::new(tick(), None);
        let counter = Arc::new(AtomicUsize::new(0));

        assert!(scheduler.schedule_after(counting_factory(&counter), Duration::ZERO, true).is_err());
        sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending() {
        let scheduler = Scheduler::new(tick(), None);
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.schedule_after(counting_factory(&counter), Duration::from_millis(100), false).unwrap();
        scheduler.shutdown().await;

        sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(scheduler.schedule_after(counting_factory(&counter), Duration::from_millis(100), false).is_err());
        assert_eq!(scheduler.pending_count().await, 0);
    }
}
