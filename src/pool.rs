use crossbeam_channel::{unbounded, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool over an MPMC job queue. `join` waits for the queue
/// to drain through a shared reference, so a pool can live inside a shared
/// structure; workers exit when the pool is dropped.
pub struct Pool {
    tx: Option<Sender<Job>>,
    pending: Arc<(Mutex<u64>, Condvar)>,
    workers: Vec<JoinHandle<()>>,
}

impl Pool {
    pub fn new(threads: u64) -> Self {
        let threads = threads.max(1);
        let (tx, rx) = unbounded::<Job>();
        let pending = Arc::new((Mutex::new(0u64), Condvar::new()));

        let mut workers = Vec::with_capacity(threads as usize);
        for _ in 0..threads {
            let rx = rx.clone();
            let pending = Arc::clone(&pending);
            workers.push(thread::spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                    let (count, signal) = &*pending;
                    let mut count = count.lock().expect("pool pending lock poisoned");
                    *count -= 1;
                    if *count == 0 {
                        signal.notify_all();
                    }
                }
            }));
        }

        Self {
            tx: Some(tx),
            pending,
            workers,
        }
    }

    pub fn add<F: FnOnce() + Send + 'static>(&self, job: F) {
        {
            let (count, _) = &*self.pending;
            *count.lock().expect("pool pending lock poisoned") += 1;
        }
        self.tx
            .as_ref()
            .expect("pool already shut down")
            .send(Box::new(job))
            .expect("pool workers exited early");
    }

    /// Block until every queued job has run.
    pub fn join(&self) {
        let (count, signal) = &*self.pending;
        let mut count = count.lock().expect("pool pending lock poisoned");
        while *count > 0 {
            count = signal.wait(count).expect("pool pending lock poisoned");
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn join_waits_for_every_queued_job() {
        let pool = Pool::new(4);
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.add(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.join();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn pool_is_reusable_after_a_join() {
        let pool = Pool::new(2);
        let counter = Arc::new(AtomicU64::new(0));
        for round in 0..3 {
            for _ in 0..10 {
                let counter = Arc::clone(&counter);
                pool.add(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
            pool.join();
            assert_eq!(counter.load(Ordering::Relaxed), (round + 1) * 10);
        }
    }

    #[test]
    fn jobs_queued_from_jobs_still_drain() {
        let pool = Arc::new(Pool::new(2));
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..5 {
            let pool_inner = Arc::clone(&pool);
            let counter = Arc::clone(&counter);
            pool.add(move || {
                let counter_inner = Arc::clone(&counter);
                pool_inner.add(move || {
                    counter_inner.fetch_add(1, Ordering::Relaxed);
                });
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.join();
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }
}
