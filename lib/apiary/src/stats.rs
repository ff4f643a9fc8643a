// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-VM and per-program counters.
//!
//! Counters are updated from the hot path without coordination; aggregation
//! takes a best-effort snapshot. Relaxed atomics keep the accounting sound
//! without a lock.

use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(&self, n: u64) {
        self.0.store(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Accumulated wall-clock time, stored as nanoseconds.
#[derive(Default)]
pub struct TimeCounter(AtomicU64);

impl TimeCounter {
    pub fn add(&self, d: Duration) {
        self.0.fetch_add(d.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn seconds(&self) -> f64 {
        self.0.load(Ordering::Relaxed) as f64 * 1e-9
    }
}

/// Adds the elapsed lifetime of the guard to a [`TimeCounter`].
pub struct ScopedTimer<'a> {
    target: &'a TimeCounter,
    start: Instant,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(target: &'a TimeCounter) -> Self {
        Self { target, start: Instant::now() }
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        self.target.add(self.start.elapsed());
    }
}

/// Counters kept per machine instance.
#[derive(Default)]
pub struct MachineStats {
    pub invocations: Counter,
    pub resets: Counter,
    pub full_resets: Counter,
    pub exceptions: Counter,
    pub timeouts: Counter,
    pub remote_calls: Counter,
    pub input_bytes: Counter,
    pub output_bytes: Counter,
    pub status_2xx: Counter,
    pub status_3xx: Counter,
    pub status_4xx: Counter,
    pub status_5xx: Counter,
    pub status_unknown: Counter,
    pub reservation_time: TimeCounter,
    pub vm_reset_time: TimeCounter,
    pub request_cpu_time: TimeCounter,
    pub error_cpu_time: TimeCounter,
}

impl MachineStats {
    pub fn count_status(&self, status: u16) {
        match status {
            200..=299 => self.status_2xx.inc(),
            300..=399 => self.status_3xx.inc(),
            400..=499 => self.status_4xx.inc(),
            500..=599 => self.status_5xx.inc(),
            _ => self.status_unknown.inc(),
        }
    }

    pub fn snapshot(&self) -> MachineStatsSnapshot {
        MachineStatsSnapshot {
            invocations: self.invocations.get(),
            resets: self.resets.get(),
            full_resets: self.full_resets.get(),
            exceptions: self.exceptions.get(),
            timeouts: self.timeouts.get(),
            vm_remote_calls: self.remote_calls.get(),
            input_bytes: self.input_bytes.get(),
            output_bytes: self.output_bytes.get(),
            status_2xx: self.status_2xx.get(),
            status_3xx: self.status_3xx.get(),
            status_4xx: self.status_4xx.get(),
            status_5xx: self.status_5xx.get(),
            status_unknown: self.status_unknown.get(),
            reservation_time: self.reservation_time.seconds(),
            reset_time: self.vm_reset_time.seconds(),
            request_cpu_time: self.request_cpu_time.seconds(),
            exception_cpu_time: self.error_cpu_time.seconds(),
        }
    }
}

/// A point-in-time copy of [`MachineStats`], additive across machines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct MachineStatsSnapshot {
    pub invocations: u64,
    pub resets: u64,
    pub full_resets: u64,
    pub exceptions: u64,
    pub timeouts: u64,
    pub vm_remote_calls: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub status_2xx: u64,
    pub status_3xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub status_unknown: u64,
    pub reservation_time: f64,
    pub reset_time: f64,
    pub request_cpu_time: f64,
    pub exception_cpu_time: f64,
}

impl AddAssign for MachineStatsSnapshot {
    fn add_assign(&mut self, rhs: Self) {
        self.invocations += rhs.invocations;
        self.resets += rhs.resets;
        self.full_resets += rhs.full_resets;
        self.exceptions += rhs.exceptions;
        self.timeouts += rhs.timeouts;
        self.vm_remote_calls += rhs.vm_remote_calls;
        self.input_bytes += rhs.input_bytes;
        self.output_bytes += rhs.output_bytes;
        self.status_2xx += rhs.status_2xx;
        self.status_3xx += rhs.status_3xx;
        self.status_4xx += rhs.status_4xx;
        self.status_5xx += rhs.status_5xx;
        self.status_unknown += rhs.status_unknown;
        self.reservation_time += rhs.reservation_time;
        self.reset_time += rhs.reset_time;
        self.request_cpu_time += rhs.request_cpu_time;
        self.exception_cpu_time += rhs.exception_cpu_time;
    }
}

/// Counters kept per loaded program.
#[derive(Default)]
pub struct ProgramStats {
    pub live_updates: Counter,
    pub live_update_transfer_bytes: Counter,
    pub reservation_timeouts: Counter,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn totals_are_additive() {
        let a = MachineStats::default();
        let b = MachineStats::default();
        a.invocations.add(3);
        a.count_status(204);
        a.count_status(404);
        b.invocations.add(2);
        b.count_status(500);
        b.count_status(99);

        let mut totals = MachineStatsSnapshot::default();
        totals += a.snapshot();
        totals += b.snapshot();
        assert_eq!(totals.invocations, 5);
        assert_eq!(totals.status_2xx, 1);
        assert_eq!(totals.status_4xx, 1);
        assert_eq!(totals.status_5xx, 1);
        assert_eq!(totals.status_unknown, 1);
    }

    #[test]
    fn scoped_timer_accumulates() {
        let t = TimeCounter::default();
        {
            let _guard = ScopedTimer::new(&t);
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(t.seconds() >= 0.005);
    }

    #[test]
    fn status_buckets() {
        let s = MachineStats::default();
        for code in [200, 299, 301, 403, 503, 600, 100] {
            s.count_status(code);
        }
        assert_eq!(s.status_2xx.get(), 2);
        assert_eq!(s.status_3xx.get(), 1);
        assert_eq!(s.status_4xx.get(), 1);
        assert_eq!(s.status_5xx.get(), 1);
        assert_eq!(s.status_unknown.get(), 2);
    }
}
