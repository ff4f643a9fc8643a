// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-program storage VMs.
//!
//! A tenant with storage enabled gets one long-lived storage VM that hosts
//! mutable state across requests. Request VMs reach it through the
//! storage-call trap-out; calls are serialized by the program's storage
//! executor. In 1:1 mode the storage main VM is additionally forked once
//! per request VM so each request VM can remote-execute in its own storage
//! twin.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::binary::BinaryStorage;
use crate::instance::MachineInstance;
use crate::stats::MachineStats;
use crate::worker::Task;

pub struct Storage {
    pub(crate) binary: BinaryStorage,
    /// The storage main VM; present once initialization reaches it.
    pub(crate) main_vm: Mutex<Option<MachineInstance>>,
    /// 1:1 forks, indexed by request id; set once during initialization.
    pub(crate) forks: std::sync::OnceLock<Vec<Arc<Mutex<MachineInstance>>>>,
    /// Stats handle of the storage main VM, readable without taking the
    /// VM lock.
    pub(crate) main_stats: std::sync::OnceLock<Arc<MachineStats>>,
    /// Guest addresses registered through `STORAGE_ALLOW` during boot.
    allow_list: Mutex<HashSet<u64>>,
    allow_frozen: AtomicBool,
    /// Pending async storage tasks; at most one is kept queued behind the
    /// in-flight one.
    pub(crate) tasks: Mutex<VecDeque<Task<i64>>>,
    pub(crate) task_generation: AtomicU64,
    /// Extra serializer honored by storage calls when the tenant requested
    /// strict serialization; remote-executing request VMs take it too.
    pub(crate) serializer: Arc<Mutex<()>>,
}

impl Storage {
    pub fn new(binary: BinaryStorage) -> Self {
        Self {
            binary,
            main_vm: Mutex::new(None),
            forks: std::sync::OnceLock::new(),
            main_stats: std::sync::OnceLock::new(),
            allow_list: Mutex::new(HashSet::new()),
            allow_frozen: AtomicBool::new(false),
            tasks: Mutex::new(VecDeque::new()),
            task_generation: AtomicU64::new(0),
            serializer: Arc::new(Mutex::new(())),
        }
    }

    /// Registers a callable storage entry point. Only possible while the
    /// program is still initializing.
    pub fn allow(&self, addr: u64) -> bool {
        if self.allow_frozen.load(Ordering::Acquire) || addr == 0 {
            return false;
        }
        self.allow_list.lock().unwrap().insert(addr);
        true
    }

    pub fn is_allowed(&self, addr: u64) -> bool {
        self.allow_list.lock().unwrap().contains(&addr)
    }

    /// Closes the allow-list; called when initialization completes.
    pub fn freeze_allow_list(&self) {
        self.allow_frozen.store(true, Ordering::Release);
    }

    pub(crate) fn queued_tasks(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn main_stats(&self) -> Option<&Arc<MachineStats>> {
        self.main_stats.get()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allow_list_freezes() {
        let storage = Storage::new(BinaryStorage::default());
        assert!(storage.allow(0x5000));
        assert!(!storage.allow(0));
        assert!(storage.is_allowed(0x5000));
        assert!(!storage.is_allowed(0x6000));

        storage.freeze_allow_list();
        assert!(!storage.allow(0x6000));
        assert!(!storage.is_allowed(0x6000));
        assert!(storage.is_allowed(0x5000));
    }
}
