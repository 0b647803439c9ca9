use crate::logging::{self, o, Logger};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum PoolMsg {
    Run(Job),
    Terminate,
}

/// Cheap cloneable submission side of the pool. Submitting never blocks;
/// jobs arriving after shutdown are dropped.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<PoolMsg>,
    log: Logger,
}

impl WorkerHandle {
    /// Enqueues a job for the next free worker.
    #[inline]
    pub fn submit(&self, job: Job) {
        if self.tx.send(PoolMsg::Run(job)).is_err() {
            logging::debug!(self.log, "job dropped after pool shutdown");
        }
    }
}

/// A fixed pool of message handler threads fed from an unbounded queue.
///
/// Handlers may suspend on futures, so the pool is what keeps the reactor
/// from ever blocking on message execution. A panicking job is logged and
/// the worker keeps draining the queue.
pub struct WorkerPool {
    tx: mpsc::Sender<PoolMsg>,
    handles: Vec<thread::JoinHandle<()>>,
    log: Logger,
}

impl WorkerPool {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(size: usize, log: L) -> WorkerPool {
        let log = match log.into() {
            Some(log) => log.new(o!("component" => "workers")),
            None => logging::discard(),
        };

        let (tx, rx) = mpsc::channel();
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..size)
            .map(|index| {
                let rx = rx.clone();
                let log = log.new(o!("worker" => index));

                thread::Builder::new()
                    .name(format!("pcj-worker-{}", index))
                    .spawn(move || worker_loop(rx, log))
                    .expect("Error spawning worker thread")
            })
            .collect();

        WorkerPool { tx, handles, log }
    }

    /// Enqueues a job for the next free worker.
    #[inline]
    pub fn submit(&self, job: Job) {
        if self.tx.send(PoolMsg::Run(job)).is_err() {
            logging::debug!(self.log, "job dropped after pool shutdown");
        }
    }

    #[inline]
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            tx: self.tx.clone(),
            log: self.log.clone(),
        }
    }

    /// Stops all workers after the queued jobs have drained.
    pub fn shutdown(&mut self) {
        for _ in &self.handles {
            let _ = self.tx.send(PoolMsg::Terminate);
        }

        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }

        logging::debug!(self.log, "worker pool stopped");
    }
}

fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<PoolMsg>>>, log: Logger) {
    loop {
        let msg = {
            let guard = rx.lock().unwrap();
            guard.recv()
        };

        match msg {
            Ok(PoolMsg::Run(job)) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    logging::error!(log, "message handler panicked");
                }
            }
            Ok(PoolMsg::Terminate) | Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn jobs_run_on_the_pool() {
        let mut pool = WorkerPool::new(4, None);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = counter.clone();
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn panicking_job_does_not_kill_the_pool() {
        let mut pool = WorkerPool::new(1, None);
        let counter = Arc::new(AtomicUsize::new(0));

        pool.submit(Box::new(|| panic!("handler failure")));

        let survived = counter.clone();
        pool.submit(Box::new(move || {
            survived.fetch_add(1, Ordering::SeqCst);
        }));

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn jobs_may_block_without_stalling_others() {
        let mut pool = WorkerPool::new(2, None);
        let counter = Arc::new(AtomicUsize::new(0));

        let blocked = counter.clone();
        pool.submit(Box::new(move || {
            thread::sleep(Duration::from_millis(50));
            blocked.fetch_add(1, Ordering::SeqCst);
        }));

        let quick = counter.clone();
        pool.submit(Box::new(move || {
            quick.fetch_add(1, Ordering::SeqCst);
        }));

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
