//! Background-work utilities.

use crossbeam_channel::{Sender, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::{Result, TsVaultError};

/// A pool of worker threads executing flush, close, and merge jobs.
pub struct WorkerPool<T: Send + 'static> {
    workers: Vec<Worker>,
    sender: Sender<Message<T>>,
    shutdown: Arc<AtomicBool>,
    in_flight_tasks: Arc<AtomicUsize>,
    inline_handler: Option<Arc<dyn Fn(T) + Send + Sync>>,
}

enum Message<T> {
    Task(T),
    Shutdown,
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Creates a new worker pool with the specified number of workers.
    pub fn new<F>(name: &str, num_workers: usize, task_handler: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let num_workers = if num_workers == 0 {
            warn!("WorkerPool::new called with 0 workers; defaulting to 1");
            1
        } else {
            num_workers
        };

        let queue_capacity = num_workers.saturating_mul(4).max(1);
        let (sender, receiver) = bounded::<Message<T>>(queue_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let in_flight_tasks = Arc::new(AtomicUsize::new(0));
        let task_handler: Arc<dyn Fn(T) + Send + Sync> = Arc::new(task_handler);

        let mut workers = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            let receiver = receiver.clone();
            let in_flight_tasks = Arc::clone(&in_flight_tasks);
            let task_handler = Arc::clone(&task_handler);

            let thread_result = thread::Builder::new()
                .name(format!("{name}-{id}"))
                .spawn(move || {
                    loop {
                        let message = match receiver.recv_timeout(Duration::from_millis(100)) {
                            Ok(msg) => msg,
                            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                        };

                        match message {
                            Message::Task(task) => {
                                debug!("worker {} picked up a task", id);
                                let result =
                                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                                        task_handler(task)
                                    }));
                                in_flight_tasks.fetch_sub(1, Ordering::AcqRel);
                                if result.is_err() {
                                    error!("worker {} task handler panicked", id);
                                }
                            }
                            Message::Shutdown => break,
                        }
                    }
                });

            match thread_result {
                Ok(thread) => workers.push(Worker {
                    id,
                    thread: Some(thread),
                }),
                Err(e) => {
                    error!("failed to spawn worker thread {}: {}", id, e);
                    break;
                }
            }
        }

        let inline_handler = if workers.is_empty() {
            warn!("WorkerPool failed to spawn workers; tasks will run inline on the caller thread");
            Some(task_handler)
        } else {
            None
        };

        Self {
            workers,
            sender,
            shutdown,
            in_flight_tasks,
            inline_handler,
        }
    }

    /// Submits a task to the worker pool.
    pub fn submit(&self, task: T) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(TsVaultError::ShuttingDown);
        }

        if let Some(handler) = &self.inline_handler {
            self.in_flight_tasks.fetch_add(1, Ordering::AcqRel);
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(task)));
            self.in_flight_tasks.fetch_sub(1, Ordering::AcqRel);
            if result.is_err() {
                return Err(TsVaultError::Other(
                    "inline task handler panicked".to_string(),
                ));
            }
            return Ok(());
        }

        self.in_flight_tasks.fetch_add(1, Ordering::AcqRel);
        self.sender
            .send(Message::Task(task))
            .map_err(|_| TsVaultError::ChannelSend {
                channel: "worker_pool".to_string(),
            })
            .inspect_err(|_| {
                self.in_flight_tasks.fetch_sub(1, Ordering::AcqRel);
            })?;

        Ok(())
    }

    /// Returns the number of in-flight tasks (queued or currently running).
    pub fn active_tasks(&self) -> usize {
        self.in_flight_tasks.load(Ordering::Acquire)
    }

    /// Waits for all in-flight tasks to complete, up to a timeout.
    pub fn wait_for_completion(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        while self.in_flight_tasks.load(Ordering::Acquire) > 0 {
            if start.elapsed() > timeout {
                return Err(TsVaultError::Other(format!(
                    "worker pool did not drain within {}ms",
                    timeout.as_millis()
                )));
            }
            thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }

    /// Shuts down the worker pool gracefully, draining queued tasks first.
    pub fn shutdown(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);
        self.wait_for_completion(Duration::from_secs(30))?;

        for _ in &self.workers {
            let _ = self.sender.send(Message::Shutdown);
        }

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                match thread.join() {
                    Ok(_) => info!("worker {} shut down", worker.id),
                    Err(_) => error!("worker {} panicked during shutdown", worker.id),
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_pool_runs_submitted_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let pool = WorkerPool::new("test-worker", 2, move |value: usize| {
            counter_clone.fetch_add(value, Ordering::AcqRel);
        });

        for i in 1..=10 {
            pool.submit(i).unwrap();
        }
        pool.wait_for_completion(Duration::from_secs(5)).unwrap();

        assert_eq!(counter.load(Ordering::Acquire), 55);
        pool.shutdown().unwrap();
    }

    #[test]
    fn shutdown_drains_queued_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let pool = WorkerPool::new("test-worker", 1, move |_value: usize| {
            counter_clone.fetch_add(1, Ordering::AcqRel);
            thread::sleep(Duration::from_millis(2));
        });

        for i in 0..16 {
            pool.submit(i).unwrap();
        }
        pool.shutdown().unwrap();
        assert_eq!(counter.load(Ordering::Acquire), 16);
    }

    #[test]
    fn submit_after_shutdown_flag_is_rejected() {
        let pool = WorkerPool::new("test-worker", 1, |_: usize| {});
        pool.shutdown.store(true, Ordering::Release);
        assert!(matches!(pool.submit(1), Err(TsVaultError::ShuttingDown)));
    }
}
