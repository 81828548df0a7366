//! Dedicated per-device worker.
//!
//! Every device instance owns one background thread; all GPU commands for
//! that instance are issued from it, which is what makes the single
//! in-order queue a sufficient ordering guarantee.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Single-thread task pool with drain-wait and cooperative cancellation.
pub struct DedicatedWorker {
    sender: Option<mpsc::Sender<Job>>,
    handle: Option<thread::JoinHandle<()>>,
    pending: Arc<(Mutex<usize>, Condvar)>,
    cancel: Arc<AtomicBool>,
}

impl DedicatedWorker {
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })
            .expect("failed to spawn device worker thread");

        Self {
            sender: Some(sender),
            handle: Some(handle),
            pending: Arc::new((Mutex::new(0), Condvar::new())),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue one job; jobs run in push order on the worker thread.
    pub fn push(&self, job: impl FnOnce() + Send + 'static) {
        let pending = self.pending.clone();
        {
            let (count, _) = &*pending;
            *count.lock().unwrap() += 1;
        }
        let wrapped: Job = Box::new(move || {
            job();
            let (count, cvar) = &*pending;
            *count.lock().unwrap() -= 1;
            cvar.notify_all();
        });
        if let Some(sender) = &self.sender {
            if sender.send(wrapped).is_err() {
                let (count, cvar) = &*self.pending;
                *count.lock().unwrap() -= 1;
                cvar.notify_all();
            }
        }
    }

    /// Block until every queued job has finished, then clear the sticky
    /// cancel flag for the next batch.
    pub fn wait(&self) {
        let (count, cvar) = &*self.pending;
        let mut guard = count.lock().unwrap();
        while *guard > 0 {
            guard = cvar.wait(guard).unwrap();
        }
        self.cancel.store(false, Ordering::SeqCst);
    }

    /// Request cooperative cancellation; running jobs observe the flag at
    /// their own poll points.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Shared cancel flag, polled together with the task's own callback.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }
}

impl Drop for DedicatedWorker {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        drop(self.sender.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn jobs_run_in_order_and_wait_drains() {
        let worker = DedicatedWorker::new("test-worker");
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let log = log.clone();
            worker.push(move || {
                thread::sleep(Duration::from_millis(2));
                log.lock().unwrap().push(i);
            });
        }
        worker.wait();

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cancel_flag_is_visible_to_jobs_and_cleared_by_wait() {
        let worker = DedicatedWorker::new("test-worker");
        let observed = Arc::new(AtomicUsize::new(0));

        let flag = worker.cancel_flag();
        worker.cancel();
        {
            let observed = observed.clone();
            let flag = flag.clone();
            worker.push(move || {
                if flag.load(Ordering::SeqCst) {
                    observed.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        worker.wait();

        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert!(!flag.load(Ordering::SeqCst));
    }
}
