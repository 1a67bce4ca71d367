use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use strata_core::{IndexDocument, Language};
use strata_storage::queue::{EmbeddingQueueStore, QueueItem};

use crate::error::IndexError;
use crate::ports::VectorIndexPort;

/// How long an idle worker sleeps before rechecking the queue, so shutdown
/// stays responsive even if a notification is missed.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Condition-variable wakeup shared by the worker pool (owner) and the
/// queue (non-owning notifier).
pub struct WorkSignal {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WorkSignal {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn notify_one(&self) {
        let _guard = self.lock.lock().expect("work signal lock poisoned");
        self.cond.notify_one();
    }

    pub fn notify_all(&self) {
        let _guard = self.lock.lock().expect("work signal lock poisoned");
        self.cond.notify_all();
    }

    fn wait_timeout(&self, timeout: Duration) {
        let guard = self.lock.lock().expect("work signal lock poisoned");
        let _ = self.cond.wait_timeout(guard, timeout);
    }
}

/// Priority queue of chunks awaiting embedding, persisted in the relational
/// store. Producers never block: rows are durable and workers drain them
/// FIFO-within-priority.
///
/// The queue holds a weak reference to the pool's wake signal, set after
/// both ends exist, so neither side owns the other.
pub struct EmbeddingQueue {
    store: Arc<EmbeddingQueueStore>,
    vector: Arc<dyn VectorIndexPort>,
    max_retries: u32,
    pool_signal: Mutex<Weak<WorkSignal>>,
    exhausted: AtomicU64,
}

impl EmbeddingQueue {
    pub fn new(
        store: Arc<EmbeddingQueueStore>,
        vector: Arc<dyn VectorIndexPort>,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            vector,
            max_retries,
            pool_signal: Mutex::new(Weak::new()),
            exhausted: AtomicU64::new(0),
        }
    }

    /// Wire the pool's wake signal into the queue.
    pub fn bind_pool_signal(&self, signal: &Arc<WorkSignal>) {
        *self.pool_signal.lock().expect("pool signal lock poisoned") = Arc::downgrade(signal);
    }

    fn notify_one(&self) {
        if let Some(signal) = self.pool_signal.lock().expect("pool signal lock poisoned").upgrade()
        {
            signal.notify_one();
        }
    }

    fn notify_all(&self) {
        if let Some(signal) = self.pool_signal.lock().expect("pool signal lock poisoned").upgrade()
        {
            signal.notify_all();
        }
    }

    /// Enqueue documents for embedding. A single item wakes one worker; a
    /// bulk enqueue wakes all of them.
    pub fn enqueue(&self, docs: &[IndexDocument], priority: i32) -> Result<usize, IndexError> {
        let mut accepted = 0;
        for doc in docs {
            self.store.enqueue(
                &doc.repo_id,
                &doc.snapshot_id,
                doc.id,
                &doc.file_path,
                doc.symbol_id.as_deref(),
                &doc.content,
                priority,
            )?;
            accepted += 1;
        }
        if accepted == 1 {
            self.notify_one();
        } else if accepted > 1 {
            self.notify_all();
        }
        Ok(accepted)
    }

    /// Highest-priority pending item, or `None` when the queue is drained.
    pub fn pop_one(&self) -> Result<Option<QueueItem>, IndexError> {
        Ok(self.store.pop_one()?)
    }

    /// Embed one item and upsert it into the vector index. Returns whether
    /// it succeeded; failures are retried up to `max_retries` at the same
    /// priority, after which the item is marked failed and dropped.
    pub fn process_single_item(&self, item: &QueueItem) -> bool {
        let doc = queue_item_to_document(item);
        match self.vector.upsert(&item.repo_id, &item.snapshot_id, &[doc]) {
            Ok(()) => {
                if let Err(e) = self.store.mark_done(item.row_id) {
                    tracing::warn!(chunk_id = %item.chunk_id, error = %e, "mark_done failed");
                }
                true
            }
            Err(e) => {
                tracing::warn!(
                    chunk_id = %item.chunk_id,
                    attempts = item.attempts,
                    error = %e,
                    "embedding failed"
                );
                if item.attempts + 1 >= self.max_retries {
                    self.exhausted.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self.store.mark_failed(item.row_id) {
                        tracing::warn!(error = %e, "mark_failed failed");
                    }
                } else if let Err(e) = self.store.requeue(item.row_id) {
                    tracing::warn!(error = %e, "requeue failed");
                }
                false
            }
        }
    }

    pub fn is_idle(&self, repo_id: &str, snapshot_id: &str) -> Result<bool, IndexError> {
        Ok(self.store.is_idle(repo_id, snapshot_id)?)
    }

    pub fn pending_count(&self) -> Result<usize, IndexError> {
        Ok(self.store.pending_count()?)
    }

    /// Items dropped after exhausting retries.
    pub fn exhausted_count(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }
}

fn queue_item_to_document(item: &QueueItem) -> IndexDocument {
    let language = Path::new(&item.file_path)
        .extension()
        .and_then(|e| e.to_str())
        .and_then(Language::from_extension)
        .unwrap_or(Language::Text);
    IndexDocument {
        id: item.chunk_id,
        repo_id: item.repo_id.clone(),
        snapshot_id: item.snapshot_id.clone(),
        file_path: item.file_path.clone(),
        language,
        symbol_id: item.symbol_id.clone(),
        symbol_name: None,
        content: item.content.clone(),
        identifiers: Vec::new(),
        tags: std::collections::BTreeMap::new(),
        start_line: None,
        end_line: None,
    }
}

/// Snapshot of worker-pool counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub processed: u64,
    pub failed: u64,
}

/// Event-driven embedding worker pool: N OS threads cooperating on one
/// condition variable.
///
/// Workers pop items as long as any are pending; when the queue runs dry
/// they wait on the signal with a 1 s timeout. `stop` flips the running
/// flag and wakes everyone, so shutdown completes promptly.
pub struct EmbeddingWorkerPool {
    signal: Arc<WorkSignal>,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<PoolStats>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
    worker_count: usize,
}

impl EmbeddingWorkerPool {
    pub fn new(worker_count: usize) -> Self {
        Self {
            signal: Arc::new(WorkSignal::new()),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(PoolStats::default())),
            workers: Mutex::new(Vec::new()),
            worker_count,
        }
    }

    pub fn signal(&self) -> &Arc<WorkSignal> {
        &self.signal
    }

    /// Spawn the workers and wire the queue's notifications to this pool.
    pub fn start(&self, queue: Arc<EmbeddingQueue>) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("worker pool already running");
            return;
        }
        queue.bind_pool_signal(&self.signal);

        let mut workers = self.workers.lock().expect("workers lock poisoned");
        for worker_id in 0..self.worker_count {
            let queue = queue.clone();
            let signal = self.signal.clone();
            let running = self.running.clone();
            let stats = self.stats.clone();
            workers.push(std::thread::spawn(move || {
                tracing::debug!(worker_id, "embedding worker started");
                while running.load(Ordering::SeqCst) {
                    match queue.pop_one() {
                        Ok(Some(item)) => {
                            let ok = queue.process_single_item(&item);
                            let mut stats = stats.lock().expect("stats lock poisoned");
                            if ok {
                                stats.processed += 1;
                            } else {
                                stats.failed += 1;
                            }
                        }
                        Ok(None) => {
                            if !running.load(Ordering::SeqCst) {
                                break;
                            }
                            signal.wait_timeout(IDLE_WAIT);
                        }
                        Err(e) => {
                            tracing::error!(worker_id, error = %e, "worker pop failed");
                            signal.wait_timeout(IDLE_WAIT);
                        }
                    }
                }
                tracing::debug!(worker_id, "embedding worker stopped");
            }));
        }
        tracing::info!(worker_count = self.worker_count, "embedding worker pool started");
    }

    /// Stop all workers and wait for them to exit.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.signal.notify_all();
        let mut workers = self.workers.lock().expect("workers lock poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        let stats = self.stats();
        tracing::info!(
            processed = stats.processed,
            failed = stats.failed,
            "embedding worker pool stopped"
        );
    }

    pub fn stats(&self) -> PoolStats {
        *self.stats.lock().expect("stats lock poisoned")
    }
}

impl Drop for EmbeddingWorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}
