//! Completion delivery.
//!
//! Finished commands leave the adapter lock as a batch and are handed to callers here.
//! Small batches (or all batches, with no workers configured) are delivered on the calling
//! thread through a shared queue. A `draining` flag lets only one thread drain it at a time;
//! a callback that submits more work and completes it inline only appends to the queue.
//! Larger batches are split across worker threads, each with its own queue and lock,
//! selected least-loaded-with-threshold.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::command::{Completion, CommandId, CompletionFn, Finished, Route};
use crate::config::AdapterConfig;
use crate::{lock, HbaError, Result};

type Job = (CompletionFn, Completion);

#[derive(Default)]
struct WorkerQueue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

#[derive(Default)]
struct WorkerShared {
    queue: Mutex<WorkerQueue>,
    ready: Condvar,
    len: AtomicUsize,
}

impl WorkerShared {
    fn push(&self, jobs: Vec<Job>) {
        let n = jobs.len();
        let mut q = lock(&self.queue);
        q.jobs.extend(jobs);
        self.len.fetch_add(n, Ordering::AcqRel);
        drop(q);
        self.ready.notify_one();
    }

    fn run(&self) {
        loop {
            let job = {
                let mut q = lock(&self.queue);
                loop {
                    if let Some(job) = q.jobs.pop_front() {
                        break Some(job);
                    }
                    if q.shutdown {
                        break None;
                    }
                    q = self.ready.wait(q).unwrap_or_else(PoisonError::into_inner);
                }
            };
            let Some((callback, completion)) = job else {
                return;
            };
            callback(completion);
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

struct Worker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

pub(crate) struct Delivery {
    shared: Mutex<VecDeque<Job>>,
    draining: AtomicBool,
    workers: Vec<Worker>,
    next_worker: AtomicUsize,
    threshold: usize,
    sync_limit: usize,
    polled: Mutex<HashMap<CommandId, Completion>>,
    abandoned: Mutex<HashSet<CommandId>>,
}

impl Delivery {
    pub(crate) fn new(config: &AdapterConfig) -> Result<Self> {
        let mut workers = Vec::with_capacity(config.delivery_workers);
        for i in 0..config.delivery_workers {
            let shared = Arc::new(WorkerShared::default());
            let worker_shared = Arc::clone(&shared);
            let thread = thread::Builder::new()
                .name(format!("aero-hba-done-{i}"))
                .spawn(move || worker_shared.run())
                .map_err(|source| HbaError::Spawn {
                    what: "delivery worker",
                    source,
                })?;
            workers.push(Worker {
                shared,
                thread: Some(thread),
            });
        }

        Ok(Self {
            shared: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            workers,
            next_worker: AtomicUsize::new(0),
            threshold: config.delivery_threshold.max(1),
            sync_limit: config.delivery_sync_limit,
            polled: Mutex::new(HashMap::new()),
            abandoned: Mutex::new(HashSet::new()),
        })
    }

    /// Hands a batch of finished commands to their callers. Must be called with no adapter
    /// lock held.
    pub(crate) fn dispatch(&self, batch: Vec<Finished>) {
        if batch.is_empty() {
            return;
        }

        let mut jobs = Vec::with_capacity(batch.len());
        for finished in batch {
            match finished.route {
                Route::Callback(callback) => jobs.push((callback, finished.completion)),
                Route::Polled => self.store_polled(finished.completion),
                Route::Discard => {}
            }
        }
        if jobs.is_empty() {
            return;
        }

        if self.workers.is_empty() || jobs.len() <= self.sync_limit {
            lock(&self.shared).extend(jobs);
            self.drain_shared();
            return;
        }

        let mut jobs = jobs.into_iter().peekable();
        while jobs.peek().is_some() {
            let chunk: Vec<Job> = jobs.by_ref().take(self.threshold).collect();
            self.pick_worker().push(chunk);
        }
    }

    fn drain_shared(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                // Whoever holds the flag will pick up what we appended.
                return;
            }
            loop {
                let job = lock(&self.shared).pop_front();
                let Some((callback, completion)) = job else {
                    break;
                };
                callback(completion);
            }
            self.draining.store(false, Ordering::Release);

            // A push may have landed between the last pop and clearing the flag.
            if lock(&self.shared).is_empty() {
                return;
            }
        }
    }

    /// A worker with fewer than `threshold` pending jobs, else the least loaded one.
    fn pick_worker(&self) -> &WorkerShared {
        let n = self.workers.len();
        let start = self.next_worker.fetch_add(1, Ordering::Relaxed) % n;
        let mut best = &self.workers[start].shared;
        let mut best_len = usize::MAX;
        for i in 0..n {
            let shared = &self.workers[(start + i) % n].shared;
            let len = shared.len.load(Ordering::Acquire);
            if len < self.threshold {
                return shared;
            }
            if len < best_len {
                best = shared;
                best_len = len;
            }
        }
        best
    }

    fn store_polled(&self, completion: Completion) {
        if lock(&self.abandoned).remove(&completion.id) {
            tracing::debug!(id = %completion.id, reason = ?completion.reason, "discarding abandoned polled completion");
            return;
        }
        lock(&self.polled).insert(completion.id, completion);
    }

    pub(crate) fn take_polled(&self, id: CommandId) -> Option<Completion> {
        lock(&self.polled).remove(&id)
    }

    /// The poller gave up on `id`; its completion will be dropped when it arrives.
    pub(crate) fn abandon(&self, id: CommandId) {
        if lock(&self.polled).remove(&id).is_none() {
            lock(&self.abandoned).insert(id);
        }
    }

    pub(crate) fn pending(&self) -> usize {
        lock(&self.shared).len()
            + self
                .workers
                .iter()
                .map(|w| w.shared.len.load(Ordering::Acquire))
                .sum::<usize>()
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        for worker in &self.workers {
            lock(&worker.shared.queue).shutdown = true;
            worker.shared.ready.notify_all();
        }
        for worker in &mut self.workers {
            let Some(thread) = worker.thread.take() else {
                continue;
            };
            // The last adapter reference may be released by a callback on a worker.
            if thread.thread().id() == thread::current().id() {
                continue;
            }
            if thread.join().is_err() {
                tracing::error!("completion worker panicked");
            }
        }
    }
}
