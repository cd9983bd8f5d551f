//! Batch processor
//!
//! Queue and wait timer share one mutex, so the size check and the batch cut
//! are consistent under concurrent `add`. Closed batches are spawned onto the
//! runtime and wait for a semaphore permit before calling the processor.
//!
//! Each wait timer carries the queue generation it was started for and only
//! cuts a batch while that generation is still current. A processor that
//! panics still settles its items, so `flush` and `wait_for_all` return.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::mapper::ResultMapper;
use super::{BatchConfig, BatchStats};
use crate::error::{Error, Result};

type ProcessFn<T, R> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, Result<Vec<R>>> + Send + Sync>;

struct Pending<T, R> {
    item: T,
    tx: oneshot::Sender<Result<R>>,
}

struct Queue<T, R> {
    items: Vec<Pending<T, R>>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever a timer is started or the queue is cut
    generation: u64,
}

impl<T, R> Queue<T, R> {
    /// Take every queued item and invalidate the running timer
    fn cut(&mut self) -> Vec<Pending<T, R>> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
        std::mem::take(&mut self.items)
    }
}

#[derive(Default)]
struct Counters {
    total_items: u64,
    total_batches: u64,
    errors: u64,
}

struct Inner<T, R> {
    config: BatchConfig,
    process: ProcessFn<T, R>,
    mapper: ResultMapper<T, R>,
    queue: Mutex<Queue<T, R>>,
    semaphore: Arc<Semaphore>,
    /// Accepted, not yet settled
    unsettled: AtomicUsize,
    idle: Notify,
    active_jobs: AtomicUsize,
    counters: Mutex<Counters>,
}

/// Size/time bounded batching in front of a `processor(items) -> results`
/// function
pub struct BatchProcessor<T, R> {
    inner: Arc<Inner<T, R>>,
}

impl<T, R> Clone for BatchProcessor<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, R> BatchProcessor<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + 'static,
{
    pub fn new<F, Fut>(config: BatchConfig, processor: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<R>>> + Send + 'static,
    {
        Self::with_mapper(config, processor, ResultMapper::Positional)
    }

    pub fn with_mapper<F, Fut>(config: BatchConfig, processor: F, mapper: ResultMapper<T, R>) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<R>>> + Send + 'static,
    {
        let permits = config.concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                config,
                process: Arc::new(move |items| processor(items).boxed()),
                mapper,
                queue: Mutex::new(Queue {
                    items: Vec::new(),
                    timer: None,
                    generation: 0,
                }),
                semaphore: Arc::new(Semaphore::new(permits)),
                unsettled: AtomicUsize::new(0),
                idle: Notify::new(),
                active_jobs: AtomicUsize::new(0),
                counters: Mutex::new(Counters::default()),
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Queue one item; resolves once its batch has been processed
    pub async fn add(&self, item: T) -> Result<R> {
        let rx = self.enqueue(item);
        rx.await
            .unwrap_or_else(|_| Err(Error::Internal("batch dropped before settling".into())))
    }

    /// Queue several items; results come back in input order
    pub async fn add_many(&self, items: Vec<T>) -> Vec<Result<R>> {
        join_all(items.into_iter().map(|item| self.add(item))).await
    }

    fn enqueue(&self, item: T) -> oneshot::Receiver<Result<R>> {
        let (tx, rx) = oneshot::channel();
        self.inner.unsettled.fetch_add(1, Ordering::SeqCst);

        let full = {
            let mut queue = self.inner.queue.lock();
            queue.items.push(Pending { item, tx });

            if queue.items.len() >= self.inner.config.max_batch_size {
                Some(queue.cut())
            } else {
                if queue.timer.is_none() {
                    queue.generation += 1;
                    queue.timer = Some(self.start_timer(queue.generation));
                }
                None
            }
        };

        if let Some(batch) = full {
            Inner::dispatch(&self.inner, batch);
        }
        rx
    }

    fn start_timer(&self, generation: u64) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.max_wait_time).await;
            Inner::on_timer(&inner, generation);
        })
    }

    /// Dispatch everything queued now, in `max_batch_size` chunks, and wait
    /// for those batches
    pub async fn flush(&self) {
        let queued = self.inner.queue.lock().cut();
        if queued.is_empty() {
            return;
        }

        let mut handles = Vec::new();
        let mut rest = queued;
        while !rest.is_empty() {
            let tail = rest.split_off(rest.len().min(self.inner.config.max_batch_size));
            handles.push(Inner::dispatch(&self.inner, rest));
            rest = tail;
        }

        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Batch task did not complete");
            }
        }
    }

    /// Resolve once every accepted item has settled, including items added
    /// while waiting
    pub async fn wait_for_all(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.unsettled.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Reject every queued item with [`Error::ProcessorCleared`]; dispatched
    /// batches are left alone
    pub fn clear(&self) {
        let dropped = self.inner.queue.lock().cut();

        let count = dropped.len();
        for pending in dropped {
            let _ = pending.tx.send(Err(Error::ProcessorCleared));
        }
        if count > 0 {
            debug!(count, "Rejected queued batch items");
            self.inner.settled(count);
        }
    }

    pub fn stats(&self) -> BatchStats {
        let pending_items = self.inner.queue.lock().items.len();
        let c = self.inner.counters.lock();
        BatchStats {
            total_items: c.total_items,
            total_batches: c.total_batches,
            avg_batch_size: if c.total_batches == 0 {
                0.0
            } else {
                c.total_items as f64 / c.total_batches as f64
            },
            errors: c.errors,
            error_rate: if c.total_batches == 0 {
                0.0
            } else {
                c.errors as f64 / c.total_batches as f64
            },
            pending_items,
            active_jobs: self.inner.active_jobs.load(Ordering::SeqCst),
        }
    }

    pub fn reset_stats(&self) {
        *self.inner.counters.lock() = Counters::default();
    }
}

impl<T, R> Inner<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + 'static,
{
    /// Timer expiry; a no-op unless `generation` is still the queue's current one
    fn on_timer(inner: &Arc<Self>, generation: u64) {
        let batch = {
            let mut queue = inner.queue.lock();
            if queue.generation != generation {
                return;
            }
            queue.timer = None;
            queue.generation += 1;
            std::mem::take(&mut queue.items)
        };
        if !batch.is_empty() {
            Inner::dispatch(inner, batch);
        }
    }

    fn dispatch(inner: &Arc<Self>, batch: Vec<Pending<T, R>>) -> JoinHandle<()> {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let size = batch.len();
            let _settle = SettleOnDrop {
                inner: &*inner,
                count: size,
            };
            let (items, senders): (Vec<T>, Vec<oneshot::Sender<Result<R>>>) =
                batch.into_iter().map(|p| (p.item, p.tx)).unzip();

            let outcome = match Arc::clone(&inner.semaphore).acquire_owned().await {
                Ok(_permit) => {
                    let _job = ActiveJob::start(&inner.active_jobs);
                    (inner.process)(items.clone()).await
                }
                Err(_) => Err(Error::Internal("batch semaphore closed".into())),
            };

            {
                let mut c = inner.counters.lock();
                c.total_items += size as u64;
                c.total_batches += 1;
                if outcome.is_err() {
                    c.errors += 1;
                }
            }

            match outcome {
                Ok(results) => {
                    let mapped = inner.mapper.map(&items, results);
                    for (index, (tx, result)) in senders.into_iter().zip(mapped).enumerate() {
                        let _ = tx.send(result.ok_or(Error::MissingResult { index }));
                    }
                    debug!(size, "Batch processed");
                }
                Err(e) => {
                    warn!(size, error = %e, "Batch failed");
                    let shared = Arc::new(e);
                    for tx in senders {
                        let _ = tx.send(Err(Error::BatchFailed(Arc::clone(&shared))));
                    }
                }
            }
        })
    }
}

/// Settles a dispatched batch when its task ends, panicking or not
struct SettleOnDrop<'a, T, R> {
    inner: &'a Inner<T, R>,
    count: usize,
}

impl<T, R> Drop for SettleOnDrop<'_, T, R> {
    fn drop(&mut self) {
        self.inner.settled(self.count);
    }
}

struct ActiveJob<'a>(&'a AtomicUsize);

impl<'a> ActiveJob<'a> {
    fn start(jobs: &'a AtomicUsize) -> Self {
        jobs.fetch_add(1, Ordering::SeqCst);
        Self(jobs)
    }
}

impl Drop for ActiveJob<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T, R> Inner<T, R> {
    fn settled(&self, count: usize) {
        let before = self.unsettled.fetch_sub(count, Ordering::SeqCst);
        if before == count {
            self.idle.notify_waiters();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
