use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::app::error::AppError;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    jobs: VecDeque<Job>,
    accepting: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed set of named worker threads draining one FIFO queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize, name: &str) -> Result<Self, AppError> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                accepting: true,
            }),
            available: Condvar::new(),
        });
        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{name}-{id}"))
                .spawn(move || worker_loop(&shared))
                .map_err(|err| AppError::system(format!("Failed to spawn worker: {err}"), ""))?;
            workers.push(handle);
        }
        debug!(size, name, "worker pool started");
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn execute(&self, job: Job) -> Result<(), AppError> {
        let mut queue = self.shared.lock();
        if !queue.accepting {
            return Err(AppError::validation("Worker pool is shut down", ""));
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.available.notify_one();
        Ok(())
    }

    pub fn queued(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    /// Stops accepting jobs, lets the queue drain, then joins every worker.
    pub fn shutdown(&self) {
        self.shared.lock().accepting = false;
        self.shared.available.notify_all();

        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let current = thread::current().id();
        for handle in handles {
            // A job that drops the last owner runs on a worker; it cannot join itself.
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break Some(job);
                }
                if !queue.accepting {
                    break None;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        let Some(job) = job else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(
                thread = thread::current().name().unwrap_or("worker"),
                "job panicked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn pool_limits_concurrency() {
        let pool = WorkerPool::new(2, "test").expect("pool");
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();

        for _ in 0..8 {
            let running = Arc::clone(&running);
            let max_running = Arc::clone(&max_running);
            let done_tx = done_tx.clone();
            pool.execute(Box::new(move || {
                let current = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(current, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                running.fetch_sub(1, Ordering::SeqCst);
                done_tx.send(()).expect("send");
            }))
            .expect("execute");
        }

        for _ in 0..8 {
            done_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("job finished");
        }
        assert!(max_running.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn single_worker_runs_jobs_in_fifo_order() {
        let pool = WorkerPool::new(1, "fifo").expect("pool");
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..10 {
            let order = Arc::clone(&order);
            pool.execute(Box::new(move || order.lock().expect("lock").push(n)))
                .expect("execute");
        }
        pool.shutdown();
        assert_eq!(*order.lock().expect("lock"), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1, "panic").expect("pool");
        pool.execute(Box::new(|| panic!("boom"))).expect("execute");
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move || tx.send(42).expect("send")))
            .expect("execute");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).expect("recv"), 42);
    }

    #[test]
    fn shutdown_drains_queue_and_rejects_new_jobs() {
        let pool = WorkerPool::new(1, "drain").expect("pool");
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let ran = Arc::clone(&ran);
            pool.execute(Box::new(move || {
                thread::sleep(Duration::from_millis(5));
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("execute");
        }
        pool.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 5);
        let err = pool.execute(Box::new(|| {})).expect_err("rejected");
        assert!(err.is_validation());
    }
}
