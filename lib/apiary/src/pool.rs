// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The idle-VM queue and host topology helpers.
//!
//! Each program keeps one blocking multi-producer/multi-consumer queue of
//! idle request-VM slots per NUMA node. Dispatchers dequeue from the queue
//! matching their current node so a request lands on a VM whose memory is
//! local to the serving socket.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A blocking MPMC queue with timed dequeue. Every slot has exactly one
/// owner at any time: the queue, a dispatcher, or a resetting worker.
pub struct VmQueue<T> {
    inner: Mutex<VecDeque<T>>,
    cv: Condvar,
}

impl<T> Default for VmQueue<T> {
    fn default() -> Self {
        Self { inner: Mutex::new(VecDeque::new()), cv: Condvar::new() }
    }
}

impl<T> VmQueue<T> {
    pub fn enqueue(&self, item: T) {
        self.inner.lock().unwrap().push_back(item);
        self.cv.notify_one();
    }

    /// Dequeues the oldest item, waiting up to `timeout` for one to appear.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut queue = self.inner.lock().unwrap();
        loop {
            if let Some(item) = queue.pop_front() {
                return Some(item);
            }
            let remaining =
                deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (q, _) = self.cv.wait_timeout(queue, remaining).unwrap();
            queue = q;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The NUMA node the calling thread is currently executing on.
#[cfg(target_arch = "x86_64")]
pub fn current_node() -> usize {
    let mut aux: u32 = 0;
    // TSC_AUX is (node << 12) | cpu on Linux.
    unsafe { core::arch::x86_64::__rdtscp(&mut aux) };
    (aux >> 12) as usize
}

#[cfg(all(not(target_arch = "x86_64"), target_os = "linux"))]
pub fn current_node() -> usize {
    let mut cpu: libc::c_uint = 0;
    let mut node: libc::c_uint = 0;
    let rc = unsafe {
        libc::syscall(
            libc::SYS_getcpu,
            &mut cpu as *mut libc::c_uint,
            &mut node as *mut libc::c_uint,
            std::ptr::null_mut::<libc::c_void>(),
        )
    };
    if rc == 0 {
        node as usize
    } else {
        0
    }
}

#[cfg(all(not(target_arch = "x86_64"), not(target_os = "linux")))]
pub fn current_node() -> usize {
    0
}

/// Number of populated NUMA nodes on the host, at least 1.
pub fn node_count() -> usize {
    static NODES: std::sync::OnceLock<usize> = std::sync::OnceLock::new();
    *NODES.get_or_init(|| {
        let mut count = 0usize;
        if let Ok(entries) = std::fs::read_dir("/sys/devices/system/node") {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with("node")
                    && name[4..].chars().all(|c| c.is_ascii_digit())
                {
                    count += 1;
                }
            }
        }
        count.max(1)
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn fifo_order() {
        let q = VmQueue::default();
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        assert_eq!(q.dequeue_timeout(Duration::ZERO), Some(1));
        assert_eq!(q.dequeue_timeout(Duration::ZERO), Some(2));
        assert_eq!(q.dequeue_timeout(Duration::ZERO), Some(3));
        assert_eq!(q.dequeue_timeout(Duration::ZERO), None);
    }

    #[test]
    fn timed_dequeue_expires() {
        let q: VmQueue<u32> = VmQueue::default();
        let t0 = Instant::now();
        assert_eq!(q.dequeue_timeout(Duration::from_millis(50)), None);
        assert!(t0.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn dequeue_wakes_on_enqueue() {
        let q = Arc::new(VmQueue::default());
        let q2 = Arc::clone(&q);
        let waiter = std::thread::spawn(move || {
            q2.dequeue_timeout(Duration::from_secs(10))
        });
        std::thread::sleep(Duration::from_millis(20));
        q.enqueue(42);
        assert_eq!(waiter.join().unwrap(), Some(42));
    }

    #[test]
    fn conservation_across_owners() {
        // N items moved between two "owner" threads and the queue; the
        // multiset of items never changes.
        let q = Arc::new(VmQueue::default());
        for i in 0..8 {
            q.enqueue(i);
        }
        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let item = q
                        .dequeue_timeout(Duration::from_secs(5))
                        .expect("queue starved");
                    q.enqueue(item);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut seen = Vec::new();
        while let Some(i) = q.dequeue_timeout(Duration::ZERO) {
            seen.push(i);
        }
        seen.sort();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn topology_is_sane() {
        assert!(node_count() >= 1);
        let _ = current_node();
    }
}
