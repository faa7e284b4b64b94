//! Parallel GC workers.
//!
//! Tasks run on scoped threads so they can borrow the collector state of the
//! current pause. A pool of one runs the task inline.

use crossbeam_utils::thread;

/// Runs the same task on several GC threads.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    count: usize,
}

impl WorkerPool {
    /// Pool of `count` workers (at least one).
    pub fn new(count: usize) -> Self {
        Self {
            count: count.max(1),
        }
    }

    /// Number of workers.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Run `task(worker_id)` on every worker and collect the results in id order.
    pub fn run<T, F>(&self, task: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Sync,
    {
        if self.count == 1 {
            return vec![task(0)];
        }
        let task = &task;
        let scoped = thread::scope(|scope| {
            let handles: Vec<_> = (0..self.count)
                .map(|id| {
                    scope
                        .builder()
                        .name(format!("otter-g1-worker-{id}"))
                        .spawn(move |_| task(id))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle {
                    Ok(handle) => handle.join().unwrap_or_else(|e| std::panic::resume_unwind(e)),
                    Err(e) => {
                        tracing::error!(target: "otter::gc", error = %e, "failed to spawn GC worker");
                        panic!("failed to spawn GC worker: {e}");
                    }
                })
                .collect::<Vec<T>>()
        });
        scoped.unwrap_or_else(|e| std::panic::resume_unwind(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_every_worker_once() {
        let pool = WorkerPool::new(4);
        let counter = AtomicUsize::new(0);
        let ids = pool.run(|id| {
            counter.fetch_add(1, Ordering::SeqCst);
            id
        });
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn single_worker_runs_inline() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.count(), 1);
        let current = std::thread::current().id();
        let ids = pool.run(|_| std::thread::current().id());
        assert_eq!(ids, vec![current]);
    }
}
