//! Event-loop group - worker threads delivering native callbacks
//!
//! Jobs are sent over an unbounded flume channel and run on whichever worker
//! picks them up first, so callbacks for one object may arrive on any thread.
//! `wait_idle` blocks until every scheduled job has finished.

use crate::logging::{debug, trace, warn};
use flume::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Scheduled-but-unfinished job count, with a condvar for waiters
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }
}

pub struct EventLoopGroup {
    sender: Sender<Job>,
    closed: AtomicBool,
    pending: Arc<Pending>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
}

impl EventLoopGroup {
    /// Spawn `threads` workers (at least one)
    pub fn new(threads: usize) -> Arc<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = flume::unbounded::<Job>();
        let pending = Arc::new(Pending::default());

        let workers = (0..threads)
            .filter_map(|index| {
                let receiver = receiver.clone();
                let pending = Arc::clone(&pending);
                thread::Builder::new()
                    .name(format!("native-bridge-loop-{index}"))
                    .spawn(move || worker(index, receiver, pending))
                    .map_err(|e| warn!(event = "worker_spawn_failed", index, error = %e))
                    .ok()
            })
            .collect();

        debug!(event = "event_loop_started", threads);
        Arc::new(Self {
            sender,
            closed: AtomicBool::new(false),
            pending,
            workers: Mutex::new(workers),
            threads,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Stop accepting jobs. Queued jobs still run.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(event = "event_loop_closed", pending = self.pending());
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue `job` for a worker. Returns false once the group is shut down.
    pub fn schedule(&self, job: impl FnOnce() + Send + 'static) -> bool {
        if self.is_shut_down() {
            warn!(event = "schedule_rejected", "event loop group is shut down");
            return false;
        }
        self.pending.add();
        if self.sender.send(Box::new(job)).is_err() {
            self.pending.done();
            warn!(event = "schedule_rejected", "event loop group is shut down");
            return false;
        }
        true
    }

    pub fn pending(&self) -> usize {
        *self.pending.count.lock()
    }

    /// Block until no job is queued or running; false on timeout
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.pending.count.lock();
        while *count > 0 {
            if self.pending.drained.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        // Workers exit once the channel disconnects; a worker may be the one
        // dropping the group, so they are detached rather than joined
        let workers = std::mem::take(&mut *self.workers.lock());
        debug!(event = "event_loop_stopping", workers = workers.len());
    }
}

fn worker(index: usize, receiver: Receiver<Job>, pending: Arc<Pending>) {
    trace!(event = "worker_started", index);
    while let Ok(job) = receiver.recv() {
        job();
        pending.done();
    }
    trace!(event = "worker_stopped", index);
}
