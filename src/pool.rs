use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// A fixed set of worker threads draining a shared FIFO queue.
///
/// The pool knows nothing about sampling: jobs are opaque values handed to
/// the work function. A panic inside a job is caught at the worker boundary,
/// reported through the fault hook, and the worker goes back to the queue.
///
/// `stop` is cooperative: in-flight jobs run to completion, queued but
/// undispatched jobs are dropped, and `stopping` can be polled by anything
/// that would otherwise submit more work.
pub struct WorkerPool<J: Send + 'static> {
    shared: Arc<PoolShared<J>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct PoolShared<J> {
    queue: Mutex<VecDeque<J>>,
    wake: Condvar,
    stopping: AtomicBool,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Spawn `threads` named workers, each running `work` for every dequeued
    /// job and `fault` for every job that panicked.
    pub fn start<W, F>(threads: usize, name: &str, work: W, fault: F) -> Self
    where
        W: Fn(usize, &J) + Send + Sync + 'static,
        F: Fn(&J) + Send + Sync + 'static,
    {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            stopping: AtomicBool::new(false),
        });
        let work = Arc::new(work);
        let fault = Arc::new(fault);
        let workers = (0..threads)
            .map(|index| {
                let shared = Arc::clone(&shared);
                let work = Arc::clone(&work);
                let fault = Arc::clone(&fault);
                std::thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || worker_loop(index, &shared, &*work, &*fault))
                    .expect("failed to spawn pool worker")
            })
            .collect();
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a job. Returns false (dropping the job) once a stop was
    /// requested.
    pub fn submit(&self, job: J) -> bool {
        if self.stopping() {
            return false;
        }
        let mut queue = self.shared.queue.lock().expect("poisoned job queue");
        queue.push_back(job);
        self.shared.wake.notify_one();
        true
    }

    /// Whether a stop has been requested. Safe to poll from any thread.
    pub fn stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    /// Request a stop, wake blocked workers, join them, and drop whatever
    /// was still queued. Idempotent.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        let workers = {
            let mut guard = self.workers.lock().expect("poisoned worker list");
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            worker.join().expect("pool worker panicked outside a job");
        }
        self.shared.queue.lock().expect("poisoned job queue").clear();
    }
}

impl<J: Send + 'static> Drop for WorkerPool<J> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<J>(
    index: usize,
    shared: &PoolShared<J>,
    work: &(dyn Fn(usize, &J) + Send + Sync),
    fault: &(dyn Fn(&J) + Send + Sync),
) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().expect("poisoned job queue");
            loop {
                if shared.stopping.load(Ordering::Acquire) {
                    return;
                }
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                queue = shared.wake.wait(queue).expect("poisoned job queue");
            }
        };
        if catch_unwind(AssertUnwindSafe(|| work(index, &job))).is_err() {
            fault(&job);
        }
    }
}
