use crate::metrics::{MetricsCollector, WorkerKind};
use flume::{Receiver, Sender};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum WorkerMessage {
    Task { kind: WorkerKind, job: Job },

    /// Tells exactly one worker to exit (pool shrink)
    Close,
}

struct PoolInner {
    workers: Vec<std::thread::JoinHandle<()>>,
    target: usize,
}

/// Fixed-size pool of background workers.
///
/// Workers consume tasks from a FIFO MPMC queue; the queue is unbounded,
/// so producers never block. Shutdown is a graceful drain: workers finish
/// everything still queued, then exit. The pool can be resized at
/// runtime, which is how the adaptive tuner applies its worker-count
/// decisions.
pub(crate) struct ThreadPool {
    inner: Mutex<PoolInner>,
    sender: Mutex<Option<Sender<WorkerMessage>>>,
    rx: Receiver<WorkerMessage>,

    /// Tasks submitted but not yet finished
    pending: Arc<AtomicUsize>,

    metrics: Arc<MetricsCollector>,
}

impl ThreadPool {
    pub fn new(worker_count: usize, metrics: Arc<MetricsCollector>) -> Self {
        assert!(worker_count > 0);

        let (message_queue_sender, rx) = flume::unbounded();

        let pool = Self {
            inner: Mutex::new(PoolInner {
                workers: Vec::with_capacity(worker_count),
                target: worker_count,
            }),
            sender: Mutex::new(Some(message_queue_sender)),
            rx,
            pending: Arc::new(AtomicUsize::new(0)),
            metrics,
        };

        {
            let mut inner = pool.inner.lock().expect("lock is poisoned");
            for idx in 0..worker_count {
                inner.workers.push(pool.spawn_worker(idx));
            }
        }

        pool
    }

    fn spawn_worker(&self, worker_no: usize) -> std::thread::JoinHandle<()> {
        let rx = self.rx.clone();
        let pending = self.pending.clone();
        let metrics = self.metrics.clone();

        log::debug!("Starting background worker thread #{worker_no}");

        std::thread::Builder::new()
            .name("skred:worker".to_string())
            .spawn(move || {
                loop {
                    let idle_start = Instant::now();

                    match rx.recv() {
                        Ok(WorkerMessage::Task { kind, job }) => {
                            metrics.record_idle(kind, idle_start.elapsed());

                            job();

                            pending.fetch_sub(1, Ordering::AcqRel);
                        }
                        Ok(WorkerMessage::Close) => {
                            log::trace!("Worker #{worker_no} closes because pool is shrinking");
                            return;
                        }
                        Err(_) => {
                            // Channel closed and drained: graceful shutdown
                            log::trace!("Worker #{worker_no} closes, queue drained");
                            return;
                        }
                    }
                }
            })
            .expect("should spawn thread")
    }

    /// Submits a task; returns `false` if the pool has shut down
    pub fn submit(&self, kind: WorkerKind, job: Job) -> bool {
        let sender = self.sender.lock().expect("lock is poisoned");

        let Some(sender) = sender.as_ref() else {
            return false;
        };

        self.pending.fetch_add(1, Ordering::AcqRel);

        if sender.send(WorkerMessage::Task { kind, job }).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }

        true
    }

    /// Amount of tasks submitted but not yet finished
    pub fn pending_tasks(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Current worker count target
    pub fn worker_count(&self) -> usize {
        self.inner.lock().expect("lock is poisoned").target
    }

    /// Grows or shrinks the pool to `n` workers.
    ///
    /// Growing spawns immediately; shrinking enqueues close messages that
    /// take effect once a worker picks them up.
    pub fn set_worker_count(&self, n: usize) {
        assert!(n > 0);

        let mut inner = self.inner.lock().expect("lock is poisoned");

        if n > inner.target {
            for idx in inner.target..n {
                inner.workers.push(self.spawn_worker(idx));
            }
        } else {
            let sender = self.sender.lock().expect("lock is poisoned");

            if let Some(sender) = sender.as_ref() {
                for _ in n..inner.target {
                    sender.send(WorkerMessage::Close).ok();
                }
            }
        }

        inner.target = n;
    }

    /// Shuts the pool down, draining all pending tasks first.
    ///
    /// Idempotent; the second call is a no-op.
    pub fn shutdown(&self) {
        {
            // Closing the channel wakes all workers; they drain what is
            // left and exit
            let mut sender = self.sender.lock().expect("lock is poisoned");
            drop(sender.take());
        }

        let workers = {
            let mut inner = self.inner.lock().expect("lock is poisoned");
            std::mem::take(&mut inner.workers)
        };

        let current = std::thread::current().id();

        for worker in workers {
            // A worker can end up driving the shutdown itself, when the
            // last engine handle dies inside one of its tasks; it cannot
            // join itself and exits on the closed channel instead
            if worker.thread().id() == current {
                continue;
            }

            if worker.join().is_err() {
                log::error!("background worker panicked during shutdown");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
