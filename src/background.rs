//! Background work queue for CPU-heavy codec work.
//!
//! Uses a dedicated `std::thread` (not a tokio task) so encode/decode never
//! competes with network tasks, the same way the audio threads are run.
//! Jobs never touch device state; results go back to the dispatcher through
//! scheduled closures.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Jobs queued or running. `wait_for_completion` blocks on it reaching zero.
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self) {
        *self.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

pub struct BackgroundTask {
    /// `None` once shut down.
    jobs: Option<mpsc::UnboundedSender<Job>>,
    in_flight: Arc<InFlight>,
    worker: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (jobs, rx) = mpsc::unbounded_channel::<Job>();
        let in_flight = Arc::new(InFlight::default());
        let worker = {
            let in_flight = in_flight.clone();
            thread::Builder::new()
                .name(name.into())
                .spawn(move || worker_loop(rx, &in_flight))?
        };
        Ok(Self {
            jobs: Some(jobs),
            in_flight,
            worker: Some(worker),
        })
    }

    /// Queue a job. Jobs scheduled after `shutdown` are dropped.
    pub fn schedule<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(jobs) = self.jobs.as_ref() else {
            log::warn!("Background task is shut down, dropping job");
            return;
        };
        self.in_flight.add();
        if jobs.send(Box::new(job)).is_err() {
            log::warn!("Background worker is gone, dropping job");
            self.in_flight.done();
        }
    }

    /// Block until every job scheduled so far has finished.
    pub fn wait_for_completion(&self) {
        let mut count = self.in_flight.lock();
        while *count > 0 {
            count = self
                .in_flight
                .idle
                .wait(count)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn pending(&self) -> usize {
        *self.in_flight.lock()
    }

    /// Drain outstanding work, then stop the worker thread.
    pub fn shutdown(&mut self) {
        self.wait_for_completion();
        // 关闭发送端，工作线程收完剩余任务后退出
        self.jobs = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Background worker panicked");
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(mut rx: mpsc::UnboundedReceiver<Job>, in_flight: &InFlight) {
    while let Some(job) = rx.blocking_recv() {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
            log::error!("Background job panicked");
        }
        in_flight.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn wait_for_completion_is_a_barrier() {
        let task = BackgroundTask::new("bg-test").unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let done = done.clone();
            task.schedule(move || {
                thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        task.wait_for_completion();
        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert_eq!(task.pending(), 0);
    }

    #[test]
    fn jobs_run_in_order() {
        let task = BackgroundTask::new("bg-order").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let log = log.clone();
            task.schedule(move || log.lock().unwrap().push(i));
        }
        task.wait_for_completion();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn shutdown_drains_then_rejects() {
        let mut task = BackgroundTask::new("bg-shutdown").unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        {
            let done = done.clone();
            task.schedule(move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        task.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 1);

        let late = done.clone();
        task.schedule(move || {
            late.fetch_add(1, Ordering::SeqCst);
        });
        task.wait_for_completion();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_job_does_not_wedge_the_queue() {
        let task = BackgroundTask::new("bg-panic").unwrap();
        task.schedule(|| panic!("boom"));
        let done = Arc::new(AtomicUsize::new(0));
        let flag = done.clone();
        task.schedule(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        task.wait_for_completion();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
