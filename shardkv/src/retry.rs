use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use bytes::Bytes;
use tokio::{task::JoinHandle, task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{StoreError, StoreResult},
    stats::StoreStats,
    ShardId,
};

/// A write that could not take its locks in time, waiting to be redriven.
#[derive(Debug, Clone)]
pub struct RetryTask {
    /// Shard the write was routed to when it was queued.
    pub shard: ShardId,
    pub key: String,
    pub payload: Bytes,
    pub enqueued_at: Instant,
    pub attempts: u32,
}

impl RetryTask {
    pub fn new(shard: ShardId, key: String, payload: Bytes) -> Self {
        Self {
            shard,
            key,
            payload,
            enqueued_at: Instant::now(),
            attempts: 0,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// FIFO of pending retries with admission control.
///
/// Fresh writes go through [`offer`](Self::offer) and are refused once the
/// queue holds `max_len` tasks. Tasks already admitted are put back with
/// [`requeue`](Self::requeue), which never refuses.
pub struct RetryQueue {
    tasks: Mutex<VecDeque<RetryTask>>,
    max_len: usize,
}

impl RetryQueue {
    pub fn new(max_len: usize) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            max_len,
        }
    }

    /// Admits `task` unless the queue is full.
    pub fn offer(&self, task: RetryTask) -> StoreResult<()> {
        let mut tasks = lock(&self.tasks);
        if tasks.len() >= self.max_len {
            return Err(StoreError::QueueOverflow);
        }
        tasks.push_back(task);
        Ok(())
    }

    pub fn requeue(&self, task: RetryTask) {
        lock(&self.tasks).push_back(task);
    }

    /// Puts `task` back unless a newer write of the same key is already
    /// queued. Returns `false` when the task was dropped.
    pub fn requeue_unless_superseded(&self, task: RetryTask) -> bool {
        let mut tasks = lock(&self.tasks);
        if tasks.iter().any(|queued| queued.key == task.key) {
            return false;
        }
        tasks.push_back(task);
        true
    }

    /// Pops up to `limit` tasks, grouped by key. Groups are ordered by the
    /// first task of each key and keep queue order inside.
    fn take_by_key(&self, limit: usize) -> Vec<Vec<RetryTask>> {
        let mut tasks = lock(&self.tasks);
        let n = limit.min(tasks.len());
        let mut groups: Vec<Vec<RetryTask>> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for task in tasks.drain(..n) {
            match index.get(&task.key) {
                Some(&i) => groups[i].push(task),
                None => {
                    index.insert(task.key.clone(), groups.len());
                    groups.push(vec![task]);
                }
            }
        }
        groups
    }

    pub fn pop(&self) -> Option<RetryTask> {
        lock(&self.tasks).pop_front()
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_len
    }

    pub fn capacity(&self) -> usize {
        self.max_len
    }
}

/// Bounded sink for retries that exhausted their attempts. The oldest
/// letter is discarded when full.
pub struct DeadLetters {
    letters: Mutex<VecDeque<RetryTask>>,
    capacity: usize,
}

impl DeadLetters {
    pub fn new(capacity: usize) -> Self {
        Self {
            letters: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, task: RetryTask) {
        let mut letters = lock(&self.letters);
        if letters.len() >= self.capacity {
            if let Some(old) = letters.pop_front() {
                warn!("dead letter sink full, discarding write of key {}", old.key);
            }
        }
        letters.push_back(task);
    }

    /// Takes every letter out of the sink.
    pub fn drain(&self) -> Vec<RetryTask> {
        lock(&self.letters).drain(..).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.letters).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Something that can re-attempt a queued write.
#[async_trait::async_trait]
pub trait RetryTarget: Send + Sync + 'static {
    /// Attempts the write once, bypassing admission control.
    async fn redrive(&self, task: &RetryTask) -> StoreResult<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub succeeded: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Failed retries dropped because a newer write of the key was queued.
    pub superseded: usize,
}

/// Worker redriving queued writes.
pub struct Rescheduler<T> {
    queue: Arc<RetryQueue>,
    dead_letters: Arc<DeadLetters>,
    stats: Arc<StoreStats>,
    target: Weak<T>,
    interval: Duration,
    max_attempts: u32,
    workers: usize,
}

impl<T: RetryTarget> Rescheduler<T> {
    pub fn new(
        queue: Arc<RetryQueue>,
        dead_letters: Arc<DeadLetters>,
        stats: Arc<StoreStats>,
        target: Weak<T>,
        interval: Duration,
        max_attempts: u32,
        workers: usize,
    ) -> Self {
        Self {
            queue,
            dead_letters,
            stats,
            target,
            interval,
            max_attempts: max_attempts.max(1),
            workers: workers.max(1),
        }
    }

    /// Polls faster while a backlog exists, down to a tenth of the
    /// configured interval.
    pub fn poll_interval(&self) -> Duration {
        let depth = self.queue.len();
        let divisor = (1 + depth / 100).min(10) as u32;
        self.interval / divisor
    }

    /// Redrives every task queued at the time of the call. Tasks of one
    /// key run one after another in queue order; different keys run
    /// concurrently. Returns `None` once the target is gone.
    pub async fn drain_once(&self) -> Option<DrainReport> {
        let target = self.target.upgrade()?;
        let mut report = DrainReport::default();
        let mut running = JoinSet::new();

        for chain in self.queue.take_by_key(self.queue.len()) {
            if running.len() >= self.workers {
                if let Some(done) = running.join_next().await {
                    self.settle(done, &mut report);
                }
            }
            let target = target.clone();
            running.spawn(async move {
                let mut results = Vec::with_capacity(chain.len());
                for task in chain {
                    let result = target.redrive(&task).await;
                    results.push((task, result));
                }
                results
            });
        }
        while let Some(done) = running.join_next().await {
            self.settle(done, &mut report);
        }
        Some(report)
    }

    fn settle(
        &self,
        done: Result<Vec<(RetryTask, StoreResult<()>)>, tokio::task::JoinError>,
        report: &mut DrainReport,
    ) {
        let results = match done {
            Ok(results) => results,
            Err(err) => {
                warn!("retry worker failed: {}", err);
                return;
            }
        };
        let last = results.len().saturating_sub(1);
        for (i, (mut task, result)) in results.into_iter().enumerate() {
            task.attempts += 1;
            match result {
                Ok(()) => {
                    debug!(
                        "retry of key {} succeeded after {} attempt(s)",
                        task.key, task.attempts
                    );
                    self.stats.retry_succeeded();
                    report.succeeded += 1;
                }
                Err(err) if i < last => {
                    debug!(
                        "retry of key {} failed and was superseded: {}",
                        task.key, err
                    );
                    report.superseded += 1;
                }
                Err(err) if task.attempts >= self.max_attempts => {
                    warn!(
                        "dropping write of key {} after {} attempts: {}",
                        task.key, task.attempts, err
                    );
                    self.dead_letters.push(task);
                    self.stats.dead_lettered();
                    report.dead_lettered += 1;
                }
                Err(err) => {
                    debug!(
                        "retry {} of key {} failed: {}",
                        task.attempts, task.key, err
                    );
                    if self.queue.requeue_unless_superseded(task) {
                        self.stats.retry_requeued();
                        report.requeued += 1;
                    } else {
                        report.superseded += 1;
                    }
                }
            }
        }
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "start rescheduler: every {:?}, {} worker(s), {} attempt(s) max",
                self.interval, self.workers, self.max_attempts
            );
            loop {
                match self.drain_once().await {
                    Some(report) if report != DrainReport::default() => {
                        debug!("rescheduler cycle: {:?}", report);
                    }
                    Some(_) => {}
                    None => break,
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval()) => {}
                    _ = token.cancelled() => {
                        info!("cancelled rescheduler");
                        break;
                    }
                }
            }
        })
    }
}
