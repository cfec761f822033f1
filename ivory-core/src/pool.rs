// Copyright 2026 The ivory Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed thread pool for fan-out work.
//!
//! One pool serves an entire engine instance. `submit` hands a closure to
//! the FIFO queue and returns a [`TaskHandle`] the caller blocks on; there
//! is no cancellation — callers always wait for completion. After
//! [`ThreadPool::shutdown`] further submits fail with
//! [`Error::ShuttingDown`] while queued work drains.

use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Awaitable result of a submitted closure.
pub struct TaskHandle<T> {
    rx: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the closure has run and returns its result. Fails only
    /// if the worker died (a panicking task) before sending.
    pub fn wait(self) -> Result<T> {
        self.rx
            .recv()
            .map_err(|_| Error::Invariant("worker abandoned task before completion".into()))
    }
}

pub struct ThreadPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawns `threads` workers; `0` picks [`ThreadPool::default_threads`].
    pub fn new(threads: usize) -> Self {
        let threads = if threads == 0 {
            Self::default_threads()
        } else {
            threads
        };

        let (tx, rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx: Receiver<Job> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("ivory-worker-{i}"))
                .spawn(move || {
                    // Ends when the sender side is dropped at shutdown.
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("failed to spawn pool worker");
            workers.push(handle);
        }

        ThreadPool {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Hardware concurrency with a floor of 4.
    pub fn default_threads() -> usize {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .max(4)
    }

    pub fn submit<F, T>(&self, f: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let guard = self.sender.lock();
        let sender = guard.as_ref().ok_or(Error::ShuttingDown)?;
        sender
            .send(Box::new(move || {
                let _ = tx.send(f());
            }))
            .map_err(|_| Error::ShuttingDown)?;
        Ok(TaskHandle { rx })
    }

    /// Stops accepting work, lets queued jobs drain and joins the workers.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn submit_and_wait_returns_result() {
        let pool = ThreadPool::new(2);
        let handle = pool.submit(|| 21 * 2).unwrap();
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn all_submitted_jobs_run() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap()
            })
            .collect();
        for h in handles {
            h.wait().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let pool = ThreadPool::new(1);
        pool.shutdown();
        assert!(matches!(pool.submit(|| ()), Err(Error::ShuttingDown)));
    }

    #[test]
    fn zero_thread_count_uses_default() {
        let pool = ThreadPool::new(0);
        assert_eq!(pool.submit(|| 1).unwrap().wait().unwrap(), 1);
    }
}
