// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A loaded tenant program.
//!
//! `ProgramInstance` owns the main VM, the fleet of forked request VMs with
//! their per-NUMA-node idle queues, and the optional storage side. Requests
//! borrow a slot through [`ProgramInstance::reserve_vm`]; the returned
//! [`Reservation`] guard releases the slot exactly once, scheduling the
//! reset on the slot's bound worker.
//!
//! Initialization runs on the program's storage executor so a tenant's
//! first request does not stall the front end: the gate opens as soon as
//! the first request VM is enqueued, while the remaining fleet keeps
//! filling in behind it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use slog::{error, info, o, warn, Logger};
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::binary::BinaryStorage;
use crate::config::TenantConfig;
use crate::instance::{BinaryType, MachineInstance, RunEntry};
use crate::pool::{current_node, node_count, VmQueue};
use crate::state::{EntryTable, ProgramEntryIndex, SerializedState};
use crate::stats::{MachineStats, ProgramStats, ScopedTimer};
use crate::storage::Storage;
use crate::vmm::{stack_push, MachineError, Vmm};
use crate::worker::WorkerPool;

/// Budget for running C++-style destructors after a storage call returns.
pub const STORAGE_CLEANUP_TIMEOUT: Duration = Duration::from_secs(2);
/// Budget for one async storage task.
pub const ASYNC_STORAGE_TIMEOUT: Duration = Duration::from_secs(5);
/// Budget for the deserialization half of a live-update state transfer.
pub const STORAGE_DESERIALIZE_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffer descriptor handed to storage functions; guest ABI.
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug)]
#[repr(C)]
pub struct VirtBuffer {
    pub addr: u64,
    pub len: u64,
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("the program failed to initialize; check logs for a crash")]
    Failed,
    #[error("the main program is not waiting for requests")]
    NotWaiting,
}

#[derive(Debug, Error)]
pub enum ReserveError {
    #[error("no idle VM within the queue timeout")]
    Timeout,
    #[error("program is shutting down")]
    Gone,
}

/// One-shot initialization gate; the first outcome written wins.
struct InitGate {
    state: Mutex<Option<bool>>,
    cv: Condvar,
}

impl InitGate {
    fn new() -> Self {
        Self { state: Mutex::new(None), cv: Condvar::new() }
    }

    fn set(&self, ok: bool) {
        let mut state = self.state.lock().unwrap();
        if state.is_none() {
            *state = Some(ok);
            self.cv.notify_all();
        }
    }

    fn wait(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.is_none() {
            state = self.cv.wait(state).unwrap();
        }
        state.unwrap()
    }
}

/// One request-VM slot: the instance, its dedicated worker thread, and the
/// program reference that pins the program alive while the slot is out of
/// its queue.
pub struct VMPoolItem {
    pub(crate) inst: Mutex<Option<MachineInstance>>,
    pub(crate) worker: WorkerPool,
    stats: OnceLock<Arc<MachineStats>>,
    prog_ref: Mutex<Option<Arc<ProgramInstance>>>,
    reqid: u16,
}

impl VMPoolItem {
    /// Creates the slot and forks the request VM on its bound worker
    /// thread, so the vCPU never migrates off that thread afterwards.
    fn spawn(
        reqid: u16,
        prog: &Arc<ProgramInstance>,
    ) -> Result<
        (Arc<Self>, crate::worker::Task<Result<(), String>>),
        MachineError,
    > {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let worker = WorkerPool::new(
            &format!("vm-{}-{}", prog.config.name, reqid),
            Some(reqid as usize % cores),
        )?;
        let item = Arc::new(Self {
            inst: Mutex::new(None),
            worker,
            stats: OnceLock::new(),
            prog_ref: Mutex::new(None),
            reqid,
        });

        let weak = Arc::downgrade(prog);
        let item2 = Arc::clone(&item);
        let task = item.worker.enqueue(move || -> Result<(), String> {
            let prog = weak.upgrade().ok_or("program gone")?;
            let guard = prog.main_vm.lock().unwrap();
            let main = guard.as_ref().ok_or("main VM missing")?;
            let storage_peer = if prog.config.group.storage_1_to_1 {
                prog.storage.as_ref().and_then(|s| {
                    s.forks
                        .get()
                        .and_then(|f| f.get(reqid as usize))
                        .map(|m| m.lock().unwrap().machine().id())
                })
            } else {
                None
            };
            let mi = MachineInstance::fork(reqid, main, storage_peer)
                .map_err(|e| e.to_string())?;
            let _ = item2.stats.set(Arc::clone(mi.stats()));
            *item2.inst.lock().unwrap() = Some(mi);
            Ok(())
        });
        Ok((item, task))
    }

    pub fn request_id(&self) -> u16 {
        self.reqid
    }

    pub fn stats(&self) -> Option<&Arc<MachineStats>> {
        self.stats.get()
    }
}

/// Exclusive use of one request-VM slot. Dropping the reservation resets
/// the VM per policy and returns the slot to its queue, exactly once.
pub struct Reservation {
    slot: Option<Arc<VMPoolItem>>,
    prog: Arc<ProgramInstance>,
}

impl Reservation {
    pub fn slot(&self) -> &Arc<VMPoolItem> {
        self.slot.as_ref().expect("reservation not yet released")
    }

    pub fn program(&self) -> &Arc<ProgramInstance> {
        &self.prog
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.prog.vm_free(slot);
        }
    }
}

pub struct ProgramInstance {
    pub request_binary: BinaryStorage,
    config: Arc<TenantConfig>,
    log: Logger,
    vmm: Arc<dyn Vmm>,
    self_weak: Weak<ProgramInstance>,

    vmqueue: Vec<VmQueue<Arc<VMPoolItem>>>,
    vms: Mutex<Vec<Arc<VMPoolItem>>>,
    storage: Option<Storage>,
    pub(crate) main_vm: Mutex<Option<MachineInstance>>,
    main_stats: OnceLock<Arc<MachineStats>>,
    binary_type: OnceLock<BinaryType>,

    entries: EntryTable,
    pub stats: ProgramStats,
    init: InitGate,
    store_state_flag: AtomicBool,

    /// Boot, storage calls and async tasks all run here, keeping the
    /// storage vCPU on one thread and storage calls globally FIFO.
    storage_queue: WorkerPool,
}

impl ProgramInstance {
    /// Creates the program and kicks off asynchronous initialization.
    /// Callers observe readiness through [`wait_for_initialization`].
    ///
    /// [`wait_for_initialization`]: ProgramInstance::wait_for_initialization
    pub fn new(
        request_binary: BinaryStorage,
        storage_binary: BinaryStorage,
        config: Arc<TenantConfig>,
        vmm: Arc<dyn Vmm>,
        log: &Logger,
        debug: bool,
    ) -> Result<Arc<Self>, MachineError> {
        let storage = if config.has_storage() {
            let binary = if storage_binary.is_empty() {
                request_binary.clone()
            } else {
                storage_binary
            };
            Some(Storage::new(binary))
        } else {
            None
        };
        let storage_queue =
            WorkerPool::new(&format!("storage-{}", config.name), None)?;
        let n_nodes = node_count();
        let log = log.new(o!("program" => config.name.clone()));

        let this = Arc::new_cyclic(|weak| Self {
            request_binary,
            config,
            log,
            vmm,
            self_weak: weak.clone(),
            vmqueue: (0..n_nodes).map(|_| VmQueue::default()).collect(),
            vms: Mutex::new(Vec::new()),
            storage,
            main_vm: Mutex::new(None),
            main_stats: OnceLock::new(),
            binary_type: OnceLock::new(),
            entries: EntryTable::default(),
            stats: ProgramStats::default(),
            init: InitGate::new(),
            store_state_flag: AtomicBool::new(false),
            storage_queue,
        });

        let init_ref = Arc::clone(&this);
        this.storage_queue.enqueue(move || {
            if let Err(e) = init_ref.begin_initialization(debug) {
                error!(init_ref.log, "program failed initialization";
                    "error" => %e);
                *init_ref.main_vm.lock().unwrap() = None;
                init_ref.init.set(false);
            }
        });
        Ok(this)
    }

    fn begin_initialization(
        self: &Arc<Self>,
        debug: bool,
    ) -> Result<(), MachineError> {
        let t0 = Instant::now();
        let max_vms = self.config.group.max_concurrency.max(1);

        // Storage boots first; the request program may call into it during
        // its own initialization.
        if let Some(storage) = &self.storage {
            let mut storage_main = MachineInstance::new_main(
                &storage.binary,
                &self.config,
                &*self.vmm,
                true,
                debug,
                &self.log,
            )?;
            storage_main.initialize(self)?;
            let _ = storage.main_stats.set(Arc::clone(storage_main.stats()));
            *storage.main_vm.lock().unwrap() = Some(storage_main);
        }

        let mut main = MachineInstance::new_main(
            &self.request_binary,
            &self.config,
            &*self.vmm,
            false,
            debug,
            &self.log,
        )?;

        if let Some(storage) = &self.storage {
            // A storage image based above the first gigapage advertises the
            // remote-execution ABI; connect the main VM so its forks
            // inherit the link for warmup.
            let peer = {
                let guard = storage.main_vm.lock().unwrap();
                guard.as_ref().map(|vm| {
                    (vm.machine().id(), vm.machine().start_address() >> 30)
                })
            };
            if let Some((peer, gigapage)) = peer {
                if gigapage > 0 {
                    main.machine_mut().remote_connect(
                        peer,
                        self.config.group.storage_perm_remote,
                    )?;
                }
            }
        }

        let warmup_time = main.initialize(self)?;
        let _ = self.main_stats.set(Arc::clone(main.stats()));
        let _ = self.binary_type.set(main.binary_type());
        *self.main_vm.lock().unwrap() = Some(main);

        if self.config.group.storage_1_to_1 {
            if let Some(storage) = &self.storage {
                let mut forks = Vec::with_capacity(max_vms);
                {
                    let mut guard = storage.main_vm.lock().unwrap();
                    let smain = guard.as_mut().ok_or_else(|| {
                        MachineError::Failed("storage main missing".into())
                    })?;
                    smain
                        .machine_mut()
                        .prepare_copy_on_write(0, u64::MAX)?;
                    for i in 0..max_vms {
                        let fork =
                            MachineInstance::fork(i as u16, smain, None)?;
                        forks.push(Arc::new(Mutex::new(fork)));
                    }
                }
                let _ = storage.forks.set(forks);
            }
        }
        if let Some(storage) = &self.storage {
            storage.freeze_allow_list();
        }

        // Fork the first request VM and open for business, then keep
        // filling the fleet.
        let (slot, task) = VMPoolItem::spawn(0, self)?;
        task.wait()
            .map_err(|e| MachineError::Failed(e.to_string()))?
            .map_err(MachineError::Failed)?;
        self.vms.lock().unwrap().push(Arc::clone(&slot));
        self.vmqueue[0].enqueue(slot);
        self.init.set(true);

        let n_nodes = self.vmqueue.len();
        let mut initialized = 1usize;
        for i in 1..max_vms {
            let spawned = VMPoolItem::spawn(i as u16, self).and_then(
                |(slot, task)| {
                    task.wait()
                        .map_err(|e| MachineError::Failed(e.to_string()))?
                        .map_err(MachineError::Failed)?;
                    Ok(slot)
                },
            );
            match spawned {
                Ok(slot) => {
                    self.vms.lock().unwrap().push(Arc::clone(&slot));
                    self.vmqueue[i % n_nodes].enqueue(slot);
                    initialized += 1;
                }
                Err(e) => {
                    error!(self.log, "failed to create request machine";
                        "vm" => i, "error" => %e);
                }
            }
        }

        let storage_info = match (&self.storage, self.config.group.storage_1_to_1)
        {
            (None, _) => "no".to_string(),
            (Some(_), true) => format!("{}x1:1", max_vms),
            (Some(_), false) => {
                if self.config.group.storage_serialized {
                    "serialized".to_string()
                } else {
                    "direct".to_string()
                }
            }
        };
        info!(self.log, "program is loaded";
            "vms" => initialized,
            "nodes" => n_nodes,
            "ephemeral" => self.config.group.ephemeral,
            "storage" => storage_info,
            "warmup_ms" => warmup_time.as_millis() as u64,
            "ready_ms" => t0.elapsed().as_millis() as u64);
        Ok(())
    }

    /// Blocks until initialization settles one way or the other.
    pub fn wait_for_initialization(&self) -> Result<(), InitError> {
        if !self.init.wait() {
            return Err(InitError::Failed);
        }
        let guard = self.main_vm.lock().unwrap();
        match guard.as_ref() {
            None => Err(InitError::Failed),
            Some(main) if !main.is_waiting_for_requests() => {
                Err(InitError::NotWaiting)
            }
            Some(_) => Ok(()),
        }
    }

    /// Dequeues an idle slot, preferring the caller's NUMA node queue and
    /// falling back to sibling nodes, bounded by the tenant's queue
    /// timeout.
    pub fn reserve_vm(&self) -> Result<Reservation, ReserveError> {
        let this = self.self_weak.upgrade().ok_or(ReserveError::Gone)?;
        let t0 = Instant::now();
        let deadline = t0 + self.config.max_queue_time();
        let node = self.queue_index();
        let n_nodes = self.vmqueue.len();
        let slot = loop {
            if let Some(slot) =
                self.vmqueue[node].dequeue_timeout(Duration::ZERO)
            {
                break slot;
            }
            // A slot parked by a worker on another node still serves.
            let stolen = (1..n_nodes).find_map(|i| {
                self.vmqueue[(node + i) % n_nodes]
                    .dequeue_timeout(Duration::ZERO)
            });
            if let Some(slot) = stolen {
                break slot;
            }
            let remaining =
                deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // Racy but uncontended.
                self.stats.reservation_timeouts.inc();
                return Err(ReserveError::Timeout);
            }
            if let Some(slot) = self.vmqueue[node]
                .dequeue_timeout(remaining.min(Duration::from_millis(25)))
            {
                break slot;
            }
        };
        if let Some(stats) = slot.stats.get() {
            stats.reservation_time.add(t0.elapsed());
        }
        // The slot itself keeps the program alive until it is re-enqueued.
        *slot.prog_ref.lock().unwrap() = Some(Arc::clone(&this));
        Ok(Reservation { slot: Some(slot), prog: this })
    }

    /// Releases a slot: reset per policy, then re-enqueue. In
    /// double-buffered mode the reset runs on the slot's bound worker and
    /// the dispatcher moves on immediately.
    pub(crate) fn vm_free(&self, slot: Arc<VMPoolItem>) {
        if self.config.group.double_buffered {
            let deferred = Arc::clone(&slot);
            slot.worker.enqueue(move || Self::do_reset(&deferred));
        } else {
            Self::do_reset(&slot);
        }
    }

    fn do_reset(slot: &Arc<VMPoolItem>) {
        let prog = match slot.prog_ref.lock().unwrap().take() {
            Some(prog) => prog,
            None => return,
        };
        {
            let mut guard = slot.inst.lock().unwrap();
            if let Some(inst) = guard.as_mut() {
                prog.reset_instance(inst);
            }
        }
        let node = prog.queue_index();
        prog.vmqueue[node].enqueue(Arc::clone(slot));
        // The program reference drops only now, after the slot is safely
        // back in its queue.
    }

    /// Resets a slot's instance without giving up ownership; used by
    /// front-end workers that pin a slot across requests.
    pub(crate) fn reset_slot_in_place(&self, slot: &Arc<VMPoolItem>) {
        let mut guard = slot.inst.lock().unwrap();
        if let Some(inst) = guard.as_mut() {
            self.reset_instance(inst);
        }
    }

    fn reset_instance(&self, inst: &mut MachineInstance) {
        inst.tail_reset();
        if inst.is_reset_needed() && self.take_store_state_flag() {
            self.save_snapshot_via_main();
        }
        let guard = self.main_vm.lock().unwrap();
        if let Some(main) = guard.as_ref() {
            if let Err(e) = inst.reset_to(main) {
                error!(self.log, "vm reset failed"; "error" => %e);
                inst.reset_needed_now();
            }
        }
    }

    fn save_snapshot_via_main(&self) {
        let state = self.save_state();
        let mut guard = self.main_vm.lock().unwrap();
        if let Some(main) = guard.as_mut() {
            match main.machine_mut().save_snapshot_state(&state) {
                Ok(()) => info!(self.log, "saved state on first reset"),
                Err(e) => {
                    warn!(self.log, "state save failed"; "error" => %e)
                }
            }
        }
    }

    /// Serialized storage call on behalf of a request VM. Input buffers
    /// were already gathered out of the caller; the result lands at
    /// `res_addr` in the caller when the callee provides one.
    pub(crate) fn storage_call(
        &self,
        caller: &mut MachineInstance,
        func: u64,
        buffers: Vec<Vec<u8>>,
        res_addr: u64,
        res_size: u64,
    ) -> i64 {
        let storage = match &self.storage {
            Some(storage) => storage,
            None => return -(libc::ENOSYS as i64),
        };
        if !storage.is_allowed(func) {
            warn!(self.log, "storage call denied";
                "func" => format!("{:#x}", func));
            return -(libc::EPERM as i64);
        }
        caller.stats().remote_calls.inc();
        let this = match self.self_weak.upgrade() {
            Some(this) => this,
            None => return -1,
        };
        let serialized = self.config.group.storage_serialized;
        let timeout = self.config.max_storage_time();

        let task = self.storage_queue.enqueue(
            move || -> (i64, Option<Vec<u8>>) {
                let prog = &*this;
                let storage = match prog.storage.as_ref() {
                    Some(storage) => storage,
                    None => return (-1, None),
                };
                let _serializer = serialized
                    .then(|| storage.serializer.lock().unwrap());
                let mut guard = storage.main_vm.lock().unwrap();
                let vm = match guard.as_mut() {
                    Some(vm) => vm,
                    None => return (-1, None),
                };
                let vm_stats = vm.stats().clone();
                let _cpu = ScopedTimer::new(&vm_stats.request_cpu_time);

                // Stage the inputs on the storage stack, descending and
                // 8-byte aligned, then the descriptor array naming them.
                let mut sp = vm.machine().stack_address();
                let mut descs = Vec::with_capacity(buffers.len());
                let mut total_input = 0u64;
                for buffer in &buffers {
                    total_input += buffer.len() as u64;
                    let addr = match stack_push(
                        vm.machine_mut(),
                        &mut sp,
                        buffer,
                    ) {
                        Ok(addr) => addr,
                        Err(_) => return (-1, None),
                    };
                    descs.push(VirtBuffer {
                        addr,
                        len: buffer.len() as u64,
                    });
                }
                let desc_bytes = descs.as_slice().as_bytes();
                let desc_addr =
                    match stack_push(vm.machine_mut(), &mut sp, desc_bytes) {
                        Ok(addr) => addr,
                        Err(_) => return (-1, None),
                    };
                let new_stack = desc_addr & !0xF;
                vm.stats().input_bytes.add(total_input);

                vm.begin_call();
                vm.stats().invocations.inc();
                let run = vm.run_guest(
                    prog,
                    RunEntry::Call {
                        addr: func,
                        stack: new_stack,
                        args: vec![descs.len() as u64, desc_addr, res_size],
                    },
                    timeout,
                );
                if let Err(e) = run {
                    if e.is_timeout() {
                        vm.stats().timeouts.inc();
                    }
                    vm.stats().exceptions.inc();
                    return (-1, None);
                }

                let resumable = vm.response_called(2);
                if !resumable && !vm.response_called(3) {
                    vm.stats().exceptions.inc();
                    return (-1, None);
                }

                let regs = vm.machine().registers();
                let result_buffer = regs.rdi;
                let result_len = regs.rsi.min(res_size);
                let mut out = None;
                if res_addr != 0 && result_buffer != 0 {
                    match vm
                        .machine()
                        .copy_from_guest(result_buffer, result_len)
                    {
                        Ok(bytes) => {
                            vm.stats().output_bytes.add(result_len);
                            out = Some(bytes);
                        }
                        Err(_) => {
                            vm.stats().exceptions.inc();
                            return (-1, None);
                        }
                    }
                }
                // With no result buffer the callee's length is the whole
                // message.
                let retval = if res_addr != 0 {
                    result_len as i64
                } else {
                    regs.rsi as i64
                };

                if resumable {
                    // Let the callee unwind and run destructors.
                    let _ = vm.run_guest(
                        prog,
                        RunEntry::Resume,
                        STORAGE_CLEANUP_TIMEOUT,
                    );
                }
                (retval, out)
            },
        );

        match task.wait() {
            Ok((retval, Some(bytes))) => {
                if caller.machine_mut().copy_to_guest(res_addr, &bytes).is_err()
                {
                    return -1;
                }
                retval
            }
            Ok((retval, None)) => retval,
            Err(_) => -1,
        }
    }

    /// Queues an async storage task and returns immediately. At most one
    /// task is kept waiting behind the in-flight one; older handles are
    /// reaped.
    pub(crate) fn storage_task(&self, func: u64, argument: Vec<u8>) -> i64 {
        let storage = match &self.storage {
            Some(storage) => storage,
            None => return -(libc::ENOSYS as i64),
        };
        if !storage.is_allowed(func) {
            return -(libc::EPERM as i64);
        }
        let this = match self.self_weak.upgrade() {
            Some(this) => this,
            None => return -1,
        };
        let generation = storage.task_generation.load(Ordering::Acquire);
        let task = self.storage_queue.enqueue(move || -> i64 {
            let prog = &*this;
            let storage = match prog.storage.as_ref() {
                Some(storage) => storage,
                None => return -1,
            };
            if storage.task_generation.load(Ordering::Acquire) != generation {
                // Cancelled before it started.
                return -1;
            }
            let mut guard = storage.main_vm.lock().unwrap();
            let vm = match guard.as_mut() {
                Some(vm) => vm,
                None => return -1,
            };
            let vm_stats = vm.stats().clone();
            let _cpu = ScopedTimer::new(&vm_stats.request_cpu_time);
            vm.stats().invocations.inc();
            vm.stats().input_bytes.add(argument.len() as u64);

            let mut sp = vm.machine().stack_address();
            let data_addr = if argument.is_empty() {
                0
            } else {
                match stack_push(vm.machine_mut(), &mut sp, &argument) {
                    Ok(addr) => addr,
                    Err(_) => return -1,
                }
            };
            let run = vm.run_guest(
                prog,
                RunEntry::Call {
                    addr: func,
                    stack: sp & !0xF,
                    args: vec![data_addr, argument.len() as u64],
                },
                ASYNC_STORAGE_TIMEOUT,
            );
            match run {
                Ok(()) => 0,
                Err(e) => {
                    if e.is_timeout() {
                        vm.stats().timeouts.inc();
                    }
                    vm.stats().exceptions.inc();
                    -1
                }
            }
        });

        let mut queue = storage.tasks.lock().unwrap();
        while queue.len() > 1 {
            // Reap older completed handles; their results only mattered
            // for error accounting, which the stats already carry.
            queue.pop_front();
        }
        queue.push_back(task);
        0
    }

    /// Cancels queued-but-unstarted async storage tasks.
    pub(crate) fn stop_storage_tasks(&self) -> u64 {
        match &self.storage {
            Some(storage) => {
                storage.task_generation.fetch_add(1, Ordering::AcqRel);
                let mut queue = storage.tasks.lock().unwrap();
                let n = queue.len() as u64;
                queue.clear();
                n
            }
            None => 0,
        }
    }

    /// Transfers serialized storage state from this program to `new_prog`
    /// during a live update. Returns the number of bytes transferred, or a
    /// negative value when either side declined.
    pub fn live_update_call(
        &self,
        func: u64,
        new_prog: &Arc<ProgramInstance>,
        newfunc: u64,
    ) -> i64 {
        let this = match self.self_weak.upgrade() {
            Some(this) => this,
            None => return -1,
        };
        let timeout = self.config.max_storage_time();
        let serialize = self.storage_queue.enqueue(move || -> Option<Vec<u8>> {
            let prog = &*this;
            let storage = prog.storage.as_ref()?;
            let mut guard = storage.main_vm.lock().unwrap();
            let vm = guard.as_mut()?;
            let sp = vm.machine().stack_address();
            vm.run_guest(
                prog,
                RunEntry::Call { addr: func, stack: sp, args: vec![] },
                timeout,
            )
            .ok()?;
            let regs = vm.machine().registers();
            let (data, len) = (regs.rdi, regs.rsi);
            if data == 0 || data.checked_add(len).is_none() {
                return None;
            }
            vm.machine().copy_from_guest(data, len).ok()
        });
        let state = match serialize.wait() {
            Ok(Some(state)) => state,
            _ => return -1,
        };

        let from_len = state.len() as u64;
        let receiver = Arc::clone(new_prog);
        let deserialize = new_prog.storage_queue.enqueue(move || -> i64 {
            let prog = &*receiver;
            let storage = match prog.storage.as_ref() {
                Some(storage) => storage,
                None => return -1,
            };
            let mut guard = storage.main_vm.lock().unwrap();
            let vm = match guard.as_mut() {
                Some(vm) => vm,
                None => return -1,
            };
            let timeout = prog.config.max_storage_time();
            let sp = vm.machine().stack_address();
            if vm
                .run_guest(
                    prog,
                    RunEntry::Call {
                        addr: newfunc,
                        stack: sp,
                        args: vec![from_len],
                    },
                    timeout,
                )
                .is_err()
            {
                return -1;
            }
            let regs = vm.machine().registers();
            let dest = regs.rdi;
            let accepted = regs.rsi.min(from_len);
            if dest == 0 {
                return 0;
            }
            if vm
                .machine_mut()
                .copy_to_guest(dest, &state[..accepted as usize])
                .is_err()
            {
                return -1;
            }
            // Resume the receiver so it can unpack the transferred bytes.
            let _ = vm.run_guest(
                prog,
                RunEntry::Resume,
                STORAGE_DESERIALIZE_TIMEOUT,
            );
            accepted as i64
        });
        deserialize.wait().unwrap_or(-1)
    }

    /// Runs `f` against the storage VM whose machine id is `id`, if any.
    pub(crate) fn with_storage_vm<R>(
        &self,
        id: crate::vmm::VmId,
        f: impl FnOnce(&mut MachineInstance) -> R,
    ) -> Option<R> {
        let storage = self.storage.as_ref()?;
        {
            let mut guard = storage.main_vm.lock().unwrap();
            if let Some(vm) = guard.as_mut() {
                if vm.machine().id() == id {
                    return Some(f(vm));
                }
            }
        }
        if let Some(forks) = storage.forks.get() {
            for fork in forks {
                let mut vm = fork.lock().unwrap();
                if vm.machine().id() == id {
                    return Some(f(&mut vm));
                }
            }
        }
        None
    }

    pub fn storage_allow(&self, addr: u64) -> bool {
        match &self.storage {
            Some(storage) => storage.allow(addr),
            None => false,
        }
    }

    pub fn has_storage(&self) -> bool {
        self.storage.is_some()
    }

    pub fn storage(&self) -> Option<&Storage> {
        self.storage.as_ref()
    }

    pub fn entries(&self) -> &EntryTable {
        &self.entries
    }

    pub fn entry_at(&self, idx: ProgramEntryIndex) -> u64 {
        self.entries.get(idx)
    }

    pub fn config(&self) -> &Arc<TenantConfig> {
        &self.config
    }

    pub fn binary_type(&self) -> Option<BinaryType> {
        self.binary_type.get().copied()
    }

    pub fn main_vm_stats(&self) -> Option<&Arc<MachineStats>> {
        self.main_stats.get()
    }

    pub fn pool_items(&self) -> Vec<Arc<VMPoolItem>> {
        self.vms.lock().unwrap().clone()
    }

    /// Serializes program-level state into the snapshot user area.
    pub fn save_state(&self) -> Vec<u8> {
        self.entries.snapshot().as_bytes().to_vec()
    }

    /// Restores program-level state from the snapshot user area.
    pub fn load_state(&self, bytes: &[u8]) {
        if let Some(state) = SerializedState::read_from_prefix(bytes) {
            self.entries.restore(&state);
        }
    }

    pub(crate) fn store_state_on_reset(&self) {
        self.store_state_flag.store(true, Ordering::Release);
    }

    fn take_store_state_flag(&self) -> bool {
        self.store_state_flag.swap(false, Ordering::AcqRel)
    }

    fn queue_index(&self) -> usize {
        current_node() % self.vmqueue.len()
    }

    /// Number of request VMs currently sitting in their idle queues.
    pub fn idle_vm_count(&self) -> usize {
        self.vmqueue.iter().map(|q| q.len()).sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn virtbuffer_is_guest_abi_sized() {
        assert_eq!(std::mem::size_of::<VirtBuffer>(), 16);
        let descs =
            [VirtBuffer { addr: 0x1000, len: 4 }, VirtBuffer { addr: 0, len: 0 }];
        assert_eq!(descs.as_slice().as_bytes().len(), 32);
    }

    #[test]
    fn init_gate_first_write_wins() {
        let gate = InitGate::new();
        gate.set(true);
        gate.set(false);
        assert!(gate.wait());
    }
}
