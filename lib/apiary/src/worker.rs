// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dedicated single-thread workers.
//!
//! vCPU file descriptors are thread-affine, so everything that touches a
//! given machine's vCPU (boot, fork, reset, storage execution) runs on one
//! dedicated worker thread, optionally pinned to a host core to avoid
//! cross-core vCPU migration.

use std::sync::mpsc;
use std::thread::{Builder, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the result of an enqueued job.
pub struct Task<T> {
    rx: mpsc::Receiver<std::thread::Result<T>>,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("worker task panicked")]
    Panicked,
    #[error("worker is gone")]
    WorkerGone,
}

impl<T> Task<T> {
    /// Blocks until the job has run and returns its result.
    pub fn wait(self) -> Result<T, TaskError> {
        match self.rx.recv() {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(_)) => Err(TaskError::Panicked),
            Err(_) => Err(TaskError::WorkerGone),
        }
    }
}

/// A single worker thread consuming jobs in FIFO order.
pub struct WorkerPool {
    // Behind a mutex so the pool is shareable; senders are not.
    tx: Option<std::sync::Mutex<mpsc::Sender<Job>>>,
    join: Option<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns the worker. When `pin_core` is set the thread is bound to the
    /// given host CPU.
    pub fn new(name: &str, pin_core: Option<usize>) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let join = Builder::new().name(name.to_string()).spawn(move || {
            if let Some(core) = pin_core {
                pin_to_core(core);
            }
            while let Ok(job) = rx.recv() {
                job();
            }
        })?;
        Ok(Self { tx: Some(std::sync::Mutex::new(tx)), join: Some(join) })
    }

    /// Enqueues `f` and returns a handle to its result. A panicking job
    /// does not take the worker down; the panic is surfaced through the
    /// returned [`Task`].
    pub fn enqueue<T, F>(&self, f: F) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move || {
            let result = std::panic::catch_unwind(
                std::panic::AssertUnwindSafe(f),
            );
            let _ = tx.send(result);
        });
        // The worker outlives every enqueue call site; see Drop.
        self.tx
            .as_ref()
            .expect("worker pool sender present until drop")
            .lock()
            .unwrap()
            .send(job)
            .ok();
        Task { rx }
    }

    /// Runs `f` on the worker and waits for it.
    pub fn run<T, F>(&self, f: F) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.enqueue(f).wait()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(target_os = "linux")]
fn pin_to_core(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core % libc::CPU_SETSIZE as usize, &mut set);
        // Best effort; an invalid core id just leaves the thread unpinned.
        libc::sched_setaffinity(
            0,
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_core: usize) {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn jobs_run_in_order_on_one_thread() {
        let pool = WorkerPool::new("test-worker", None).unwrap();
        let first = pool.enqueue(std::thread::current);
        let t1 = first.wait().unwrap();
        let mut tasks = Vec::new();
        for i in 0..16u32 {
            tasks.push(pool.enqueue(move || (i, std::thread::current().id())));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            let (n, tid) = task.wait().unwrap();
            assert_eq!(n as usize, i);
            assert_eq!(tid, t1.id());
        }
    }

    #[test]
    fn panics_are_contained() {
        let pool = WorkerPool::new("test-worker", None).unwrap();
        let bad = pool.enqueue(|| panic!("boom"));
        assert!(matches!(bad.wait(), Err(TaskError::Panicked)));
        // The worker is still alive afterwards.
        assert_eq!(pool.run(|| 7).unwrap(), 7);
    }
}
