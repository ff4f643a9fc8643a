// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A single VM and its per-instance request state.
//!
//! A `MachineInstance` pairs a [`Machine`] with everything the engine tracks
//! per VM: response bookkeeping, the POST-body arena, the persistent inputs
//! stack, the guest file-descriptor table, per-VM statistics and the guest
//! PRNG. The main instance of a program boots the tenant binary and is then
//! forked copy-on-write into the request instances that actually serve.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use slog::{info, o, Logger};

use crate::binary::BinaryStorage;
use crate::config::{TenantConfig, GUEST_STATE_FILE};
use crate::program::ProgramInstance;
use crate::stats::MachineStats;
use crate::syscalls::{self, FdTable, Flow};
use crate::vmm::{
    ForkOptions, Machine, MachineError, MachineOptions, ResetOptions, VmExit,
    VmExitKind, VmId, Vmm,
};

/// Path of the host dynamic linker used to run interpreted guests.
pub const DYNAMIC_LINKER: &str = "/lib64/ld-linux-x86-64.so.2";

/// Size of the persistent guest stack used for marshaled request inputs.
pub const BACKEND_INPUTS_SIZE: u64 = 64 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinaryType {
    Static,
    StaticPie,
    Dynamic,
}

impl BinaryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryType::Static => "static",
            BinaryType::StaticPie => "static-pie",
            BinaryType::Dynamic => "dynamic",
        }
    }
}

/// ELF program header inspection; non-ELF images are treated as static,
/// which is what the emulation driver feeds through here.
fn elf_traits(bytes: &[u8]) -> (bool, bool) {
    const ET_DYN: u16 = 3;
    const PT_INTERP: u32 = 3;
    if bytes.len() < 64 || &bytes[0..4] != b"\x7fELF" {
        return (false, false);
    }
    let read_u16 = |off: usize| {
        u16::from_le_bytes(bytes[off..off + 2].try_into().unwrap())
    };
    let read_u64 = |off: usize| {
        u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap())
    };
    let is_dynamic = read_u16(16) == ET_DYN;
    let phoff = read_u64(32) as usize;
    let phentsize = read_u16(54) as usize;
    let phnum = read_u16(56) as usize;
    let mut has_interpreter = false;
    for i in 0..phnum {
        let base = phoff + i * phentsize;
        if base + 4 > bytes.len() {
            break;
        }
        let p_type =
            u32::from_le_bytes(bytes[base..base + 4].try_into().unwrap());
        if p_type == PT_INTERP {
            has_interpreter = true;
            break;
        }
    }
    (is_dynamic, has_interpreter)
}

fn detect_binary_type(binary: &BinaryStorage) -> BinaryType {
    match elf_traits(binary.as_bytes()) {
        (_, true) => BinaryType::Dynamic,
        (true, false) => BinaryType::StaticPie,
        (false, false) => BinaryType::Static,
    }
}

fn is_interpreted(binary: &BinaryStorage) -> bool {
    elf_traits(binary.as_bytes()).1
}

/// Base virtual address for the image, aligned down to a 1 GiB boundary.
fn detect_gigapage(
    binary: &BinaryStorage,
    dylink_address_hint: u64,
) -> Result<u64, MachineError> {
    const GIGAPAGE: u64 = 1 << 30;
    let bytes = binary.as_bytes();
    if dylink_address_hint >= GIGAPAGE && elf_traits(bytes).0 {
        return Ok(dylink_address_hint / GIGAPAGE * GIGAPAGE);
    }
    if bytes.len() < 64 || &bytes[0..4] != b"\x7fELF" {
        return Ok(0);
    }
    let entry = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
    let gigapage = entry / GIGAPAGE;
    if gigapage >= 64 {
        return Err(MachineError::Failed(
            "invalid ELF start address (above 64GB)".to_string(),
        ));
    }
    Ok(gigapage * GIGAPAGE)
}

/// xorshift128+ state handed to guests with each request. Forks inherit the
/// parent state so warmup and live traffic draw from one stream.
#[derive(Clone)]
pub(crate) struct XorShift128 {
    s: [u64; 2],
}

impl XorShift128 {
    pub fn from_entropy() -> Self {
        let mut rng = rand::rngs::OsRng;
        let mut s = [rng.next_u64(), rng.next_u64()];
        if s == [0, 0] {
            s = [0x9E3779B97F4A7C15, 0xBF58476D1CE4E5B9];
        }
        Self { s }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.s[0];
        let y = self.s[1];
        self.s[0] = y;
        x ^= x << 23;
        self.s[1] = x ^ y ^ (x >> 17) ^ (y >> 26);
        self.s[1].wrapping_add(y)
    }
}

pub struct MachineInstance {
    machine: Box<dyn Machine>,
    config: Arc<TenantConfig>,
    log: Logger,
    original_binary: BinaryStorage,
    request_id: u16,
    is_debug: bool,
    is_storage: bool,
    is_ephemeral: bool,
    waiting_for_requests: bool,
    is_warming_up: bool,
    response_called: u8,
    reset_needed: bool,
    binary_type: BinaryType,
    sighandler: u64,
    post_data: u64,
    post_size: u64,
    inputs_allocation: u64,
    pub(crate) fds: FdTable,
    stats: Arc<MachineStats>,
    prng: XorShift128,
}

impl MachineInstance {
    /// Boots a main VM (request or storage side) from a program image.
    pub fn new_main(
        binary: &BinaryStorage,
        config: &Arc<TenantConfig>,
        vmm: &dyn Vmm,
        is_storage: bool,
        is_debug: bool,
        log: &Logger,
    ) -> Result<Self, MachineError> {
        if binary.is_empty() {
            return Err(MachineError::UnknownImage(
                "empty program image".to_string(),
            ));
        }
        let dylink_hint = if is_storage {
            config.group.storage_dylink_address_hint
        } else {
            config.group.dylink_address_hint
        };
        let interpreted = is_interpreted(binary);
        let main_image = if interpreted {
            BinaryStorage::from_file(DYNAMIC_LINKER).map_err(|e| {
                MachineError::Failed(format!(
                    "dynamic linker unavailable: {}",
                    e
                ))
            })?
        } else {
            binary.clone()
        };

        let opts = MachineOptions {
            max_mem: if is_storage {
                config.max_storage_memory()
            } else {
                config.max_address()
            },
            max_cow_mem: 0,
            dylink_address_hint: dylink_hint,
            heap_address_hint: if is_storage {
                0
            } else {
                config.group.heap_address_hint
            },
            vmem_base_address: detect_gigapage(binary, dylink_hint)?,
            remappings: if is_storage {
                config.group.storage_remappings.clone()
            } else {
                config.group.vmem_remappings.clone()
            },
            verbose_loader: config.group.verbose,
            hugepages: config.group.hugepages,
            transparent_hugepages: config.group.transparent_hugepages,
            split_hugepages: false,
            executable_heap: config.group.vmem_heap_executable || interpreted,
            hugepage_arena_size: config.group.hugepage_arena_size,
            snapshot_file: if is_storage
                || config.group.cold_start_file.is_empty()
            {
                None
            } else {
                Some(config.group.cold_start_file.clone().into())
            },
        };
        let machine = vmm.create_machine(&main_image, opts)?;

        let log = log.new(o!(
            "vm" => if is_storage { "storage-main" } else { "main" },
        ));
        Ok(Self {
            machine,
            config: Arc::clone(config),
            log,
            original_binary: binary.clone(),
            request_id: 0,
            is_debug,
            is_storage,
            is_ephemeral: config.group.ephemeral,
            waiting_for_requests: false,
            is_warming_up: false,
            response_called: 0,
            reset_needed: false,
            binary_type: BinaryType::Static,
            sighandler: 0,
            post_data: 0,
            post_size: 0,
            inputs_allocation: 0,
            fds: FdTable::default(),
            stats: Arc::new(MachineStats::default()),
            prng: XorShift128::from_entropy(),
        })
    }

    /// Forks a request VM off an initialized main VM. When 1:1 storage is
    /// configured, the fork is remote-connected to its dedicated storage VM.
    pub fn fork(
        reqid: u16,
        source: &MachineInstance,
        storage_peer: Option<VmId>,
    ) -> Result<Self, MachineError> {
        let config = &source.config;
        let mut machine = source.machine.fork(&ForkOptions {
            max_mem: config.max_main_memory(),
            max_cow_mem: config.max_req_memory(),
            reset_free_work_mem: config.limit_req_memory(),
            split_hugepages: config.group.split_hugepages,
            hugepage_arena_size: config.group.hugepage_requests_arena,
        })?;
        if let Some(peer) = storage_peer {
            machine.remote_connect(peer, config.group.storage_perm_remote)?;
        }

        Ok(Self {
            machine,
            config: Arc::clone(config),
            log: source.log.new(o!("reqvm" => reqid as usize)),
            original_binary: source.original_binary.clone(),
            request_id: reqid,
            is_debug: source.is_debug,
            is_storage: source.is_storage,
            is_ephemeral: source.is_ephemeral,
            // If we got this far the source was parked waiting for requests.
            waiting_for_requests: true,
            is_warming_up: false,
            response_called: 0,
            reset_needed: false,
            binary_type: source.binary_type,
            sighandler: source.sighandler,
            post_data: 0,
            post_size: 0,
            inputs_allocation: 0,
            fds: FdTable::default(),
            stats: Arc::new(MachineStats::default()),
            prng: source.prng.clone(),
        })
    }

    /// Runs the program through its boot phase until it announces readiness,
    /// then prepares it as a fork source. Returns the time spent in warmup.
    pub fn initialize(
        &mut self,
        prog: &ProgramInstance,
    ) -> Result<Duration, MachineError> {
        // Fast cold start: restore machine and program state from disk.
        if !self.is_storage && self.machine.has_snapshot_state() {
            info!(self.log, "restored cold-start state";
                "file" => %self.config.group.cold_start_file);
            prog.load_state(&self.machine.snapshot_user_area()?);
            self.waiting_for_requests = true;
            return Ok(Duration::ZERO);
        }

        let shm_boundary = self.shared_memory_boundary();
        if self.config.group.shared_memory > 0
            && !self.config.group.vmem_remappings.is_empty()
        {
            return Err(MachineError::Failed(
                "shared memory is incompatible with vmem remappings"
                    .to_string(),
            ));
        }

        let max_main_mem = if self.is_storage {
            self.config.max_storage_memory()
        } else {
            self.config.max_main_memory()
        };
        self.machine.prepare_copy_on_write(max_main_mem, shm_boundary)?;

        self.binary_type = detect_binary_type(&self.original_binary);

        let mut args = Vec::with_capacity(4);
        if self.binary_type == BinaryType::Dynamic {
            args.push(DYNAMIC_LINKER.to_string());
            args.push(self.config.filename.clone());
        } else {
            args.push(self.config.name.clone());
        }
        let extra = if self.is_storage
            && !self.config.group.storage_arguments.is_empty()
        {
            &self.config.group.storage_arguments
        } else {
            &self.config.group.main_arguments
        };
        args.extend(extra.iter().cloned());

        let mut envp = self.config.group.environ.clone();
        envp.push(format!("KVM_NAME={}", self.config.name));
        envp.push(format!("KVM_GROUP={}", self.config.group.name));
        envp.push(format!(
            "KVM_TYPE={}",
            if self.is_storage { "storage" } else { "request" }
        ));
        envp.push(format!("KVM_STATE={}", GUEST_STATE_FILE));
        envp.push(format!("KVM_DEBUG={}", self.is_debug as u8));

        self.machine.setup_linux(&args, &envp)?;

        // Run through main() until the guest parks itself.
        let boot_time = self.config.max_boot_time();
        self.run_guest(prog, RunEntry::Run, boot_time)?;
        if !self.waiting_for_requests {
            return Err(MachineError::Failed(
                "program did not wait for requests".to_string(),
            ));
        }

        // Skip over the trap-out instruction so resumes continue in the
        // guest's request loop.
        let mut regs = self.machine.registers();
        regs.rip += 2;
        self.machine.set_registers(regs);

        let mut warmup_time = Duration::ZERO;
        if !self.is_storage {
            if self.config.group.warmup.is_some() {
                let t0 = Instant::now();
                self.warmup(prog)?;
                warmup_time = t0.elapsed();
            }

            if self.machine.is_remote_connected() {
                return Err(MachineError::Failed(
                    "remote connection still open after warmup".to_string(),
                ));
            }

            // Re-freeze with no working memory; forks pay fault-in only.
            self.machine.prepare_copy_on_write(0, shm_boundary)?;
        }

        // Lower the call stack base below main()'s live frame, skipping the
        // red zone.
        let rsp = (self.machine.registers().rsp - 128) & !0xF;
        self.machine.set_stack_address(rsp);

        if !self.is_storage && !self.config.group.cold_start_file.is_empty() {
            let state = prog.save_state();
            self.machine.save_snapshot_state(&state)?;
            info!(self.log, "saved cold-start state";
                "file" => %self.config.group.cold_start_file);
            prog.store_state_on_reset();
        }

        Ok(warmup_time)
    }

    fn warmup(&mut self, prog: &ProgramInstance) -> Result<(), MachineError> {
        let warmup = match self.config.group.warmup.clone() {
            Some(w) if !w.method.is_empty() && !w.url.is_empty() => w,
            _ => return Ok(()),
        };
        self.is_warming_up = true;
        let result = crate::dispatch::run_warmup(self, prog, &warmup);
        self.is_warming_up = false;
        if let Err(e) = result {
            // Warmup is best-effort; a failing warmup leaves boot state
            // intact.
            info!(self.log, "warmup failed"; "error" => %e);
        }
        Ok(())
    }

    /// Drives the guest until it halts, servicing trap-outs along the way.
    pub(crate) fn run_guest(
        &mut self,
        prog: &ProgramInstance,
        entry: RunEntry,
        timeout: Duration,
    ) -> Result<(), MachineError> {
        let deadline = Instant::now() + timeout;
        let mut exit: VmExit = match entry {
            RunEntry::Run => self.machine.run(timeout)?,
            RunEntry::Resume => self.machine.vmresume(timeout)?,
            RunEntry::Call { addr, stack, ref args } => {
                self.machine.timed_vmcall(addr, stack, args, timeout)?
            }
        };
        loop {
            match exit.kind {
                VmExitKind::Halted => return Ok(()),
                VmExitKind::Vmcall(nr) => {
                    match syscalls::handle(self, prog, nr)? {
                        Flow::Halt => return Ok(()),
                        Flow::Continue => {
                            let remaining = deadline
                                .saturating_duration_since(Instant::now());
                            if remaining.is_zero() {
                                return Err(MachineError::Timeout {
                                    seconds: timeout.as_secs_f64(),
                                });
                            }
                            exit = self.machine.vmresume(remaining)?;
                        }
                    }
                }
            }
        }
    }

    /// Clears per-request host state (file descriptors and the like) before
    /// the slot is returned to its queue.
    pub fn tail_reset(&mut self) {
        self.fds.clear();
    }

    pub fn is_reset_needed(&self) -> bool {
        self.reset_needed || self.is_ephemeral
    }

    /// Resets this fork back to `source` according to the reset policy: a
    /// crashed or flagged VM is wiped fully; an ephemeral VM otherwise keeps
    /// its working memory when the tenant opted into that.
    pub fn reset_to(
        &mut self,
        source: &MachineInstance,
    ) -> Result<(), MachineError> {
        if !self.is_reset_needed() {
            return Ok(());
        }
        let _timer = crate::stats::ScopedTimer::new(&self.stats.vm_reset_time);
        let keep = !self.reset_needed
            && self.config.group.ephemeral_keep_working_memory;
        let full = self.machine.reset_to(
            source.machine.id(),
            &ResetOptions {
                max_mem: self.config.max_main_memory(),
                max_cow_mem: self.config.max_req_memory(),
                reset_free_work_mem: self.config.limit_req_memory(),
                reset_copy_all_registers: true,
                reset_keep_all_work_memory: keep,
            },
        )?;
        self.stats.resets.inc();
        if full {
            self.stats.full_resets.inc();
        }

        self.waiting_for_requests = source.waiting_for_requests;
        // The POST area and the persistent inputs stack are gone.
        self.post_data = 0;
        self.post_size = 0;
        self.inputs_allocation = 0;
        self.sighandler = source.sighandler;
        self.response_called = 0;
        self.reset_needed = false;
        Ok(())
    }

    /// Grow-only guest arena for the current POST body.
    pub fn allocate_post_data(
        &mut self,
        bytes: u64,
    ) -> Result<u64, MachineError> {
        if self.post_size < bytes {
            if self.post_size > 0 {
                self.machine.mmap_unmap(self.post_data, self.post_size)?;
            }
            self.post_data = self.machine.mmap_allocate(bytes)?;
            self.post_size = bytes;
        }
        Ok(self.post_data)
    }

    pub(crate) fn inputs_allocation(&self) -> u64 {
        self.inputs_allocation
    }

    pub(crate) fn set_inputs_allocation(&mut self, addr: u64) {
        self.inputs_allocation = addr;
    }

    pub(crate) fn draw_prng(&mut self) -> [u64; 2] {
        [self.prng.next_u64(), self.prng.next_u64()]
    }

    pub fn machine(&self) -> &dyn Machine {
        &*self.machine
    }

    pub fn machine_mut(&mut self) -> &mut dyn Machine {
        &mut *self.machine
    }

    pub fn config(&self) -> &Arc<TenantConfig> {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    pub fn stats(&self) -> &Arc<MachineStats> {
        &self.stats
    }

    pub fn binary_type(&self) -> BinaryType {
        self.binary_type
    }

    pub fn is_storage(&self) -> bool {
        self.is_storage
    }

    pub fn is_debug(&self) -> bool {
        self.is_debug
    }

    pub fn is_ephemeral(&self) -> bool {
        self.is_ephemeral
    }

    pub(crate) fn set_ephemeral(&mut self, ephemeral: bool) {
        self.is_ephemeral = ephemeral;
    }

    pub fn is_warming_up(&self) -> bool {
        self.is_warming_up
    }

    pub fn is_waiting_for_requests(&self) -> bool {
        self.waiting_for_requests
    }

    pub(crate) fn wait_for_requests(&mut self) {
        self.waiting_for_requests = true;
    }

    pub(crate) fn reset_wait_for_requests(&mut self) {
        self.waiting_for_requests = false;
    }

    pub fn begin_call(&mut self) {
        self.response_called = 0;
    }

    pub(crate) fn finish_call(&mut self, n: u8) {
        self.response_called = n;
    }

    /// Gate for response validity: a crash cannot accidentally present a
    /// stale response because the emitting trap-out sets this explicitly.
    pub fn response_called(&self, n: u8) -> bool {
        self.response_called == n
    }

    pub fn reset_needed_now(&mut self) {
        self.reset_needed = true;
    }

    fn shared_memory_boundary(&self) -> u64 {
        if self.config.group.shared_memory > 0 {
            self.config.max_address() - self.config.group.shared_memory
        } else {
            u64::MAX
        }
    }

    /// Prints guest output through the instance log.
    pub(crate) fn guest_print(&self, text: &str) {
        let trimmed = text.trim_end_matches('\n');
        if trimmed.is_empty() {
            return;
        }
        info!(self.log, "guest: {}", trimmed);
        if self.config.group.print_stdout {
            println!(">>> [{}] {}", self.name(), trimmed);
        }
    }

    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }
}

/// How to enter the guest for a run.
pub(crate) enum RunEntry {
    /// First entry after `setup_linux`.
    Run,
    /// Continue from the current register state.
    Resume,
    /// Host-initiated function call.
    Call { addr: u64, stack: u64, args: Vec<u64> },
}

#[cfg(test)]
mod test {
    use super::*;

    fn elf_with(e_type: u16, entry: u64, interp: bool) -> Vec<u8> {
        // A minimal ELF64 header plus one program header.
        let mut b = vec![0u8; 64 + 56];
        b[0..4].copy_from_slice(b"\x7fELF");
        b[16..18].copy_from_slice(&e_type.to_le_bytes());
        b[24..32].copy_from_slice(&entry.to_le_bytes());
        b[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        b[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        b[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum
        let p_type: u32 = if interp { 3 } else { 1 };
        b[64..68].copy_from_slice(&p_type.to_le_bytes());
        b
    }

    #[test]
    fn binary_type_detection() {
        let stat = BinaryStorage::new(elf_with(2, 0x400000, false));
        let pie = BinaryStorage::new(elf_with(3, 0x1000, false));
        let dynl = BinaryStorage::new(elf_with(3, 0x1000, true));
        let script = BinaryStorage::from(&b"emu:hello"[..]);
        assert_eq!(detect_binary_type(&stat), BinaryType::Static);
        assert_eq!(detect_binary_type(&pie), BinaryType::StaticPie);
        assert_eq!(detect_binary_type(&dynl), BinaryType::Dynamic);
        assert_eq!(detect_binary_type(&script), BinaryType::Static);
    }

    #[test]
    fn gigapage_detection() {
        let giga = 1u64 << 30;
        // Static image: derived from the entry point.
        let stat = BinaryStorage::new(elf_with(2, 2 * giga + 0x1234, false));
        assert_eq!(detect_gigapage(&stat, 0).unwrap(), 2 * giga);
        // Dynamic image honors the hint, gigapage-aligned.
        let pie = BinaryStorage::new(elf_with(3, 0x1000, false));
        assert_eq!(
            detect_gigapage(&pie, 3 * giga + 0x9999).unwrap(),
            3 * giga
        );
        // Hints below 1 GiB fall back to the entry point.
        assert_eq!(detect_gigapage(&pie, 0x1000).unwrap(), 0);
        // Entry points above 64 GiB are rejected.
        let bad = BinaryStorage::new(elf_with(2, 65 * giga, false));
        assert!(detect_gigapage(&bad, 0).is_err());
    }

    #[test]
    fn prng_stream_is_deterministic_per_state() {
        let mut a = XorShift128 { s: [1, 2] };
        let mut b = a.clone();
        let draws: Vec<u64> = (0..4).map(|_| a.next_u64()).collect();
        let again: Vec<u64> = (0..4).map(|_| b.next_u64()).collect();
        assert_eq!(draws, again);
        assert_ne!(draws[0], draws[1]);
    }

    use crate::vmm::emulate::{EmuVmm, GuestLogic, GuestView, StepResult};

    #[derive(Clone)]
    struct Idle;
    impl GuestLogic for Idle {
        fn step(&mut self, _vm: &mut GuestView<'_>) -> StepResult {
            StepResult::Done
        }
        fn clone_box(&self) -> Box<dyn GuestLogic> {
            Box::new(self.clone())
        }
    }

    fn fork_pair(
        keep_working_memory: bool,
    ) -> (MachineInstance, MachineInstance) {
        let vmm = EmuVmm::new();
        vmm.register_guest("idle", || Idle);
        let mut group = crate::config::TenantGroup::new("compute");
        group.ephemeral_keep_working_memory = keep_working_memory;
        let config = Arc::new(crate::config::TenantConfig::new("t", group));
        let log = Logger::root(slog::Discard, o!());
        let main = MachineInstance::new_main(
            &BinaryStorage::from(&b"emu:idle"[..]),
            &config,
            &*vmm,
            false,
            false,
            &log,
        )
        .unwrap();
        let fork = MachineInstance::fork(0, &main, None).unwrap();
        (main, fork)
    }

    #[test]
    fn flagged_reset_is_full_even_with_keep_hint() {
        let (main, mut fork) = fork_pair(true);
        fork.reset_needed_now();
        fork.reset_to(&main).unwrap();
        assert_eq!(fork.stats().resets.get(), 1);
        assert_eq!(fork.stats().full_resets.get(), 1);
    }

    #[test]
    fn keep_hint_avoids_full_reset_for_plain_ephemeral() {
        let (main, mut fork) = fork_pair(true);
        // Ephemeral default makes a reset required, but nothing is flagged.
        fork.reset_to(&main).unwrap();
        assert_eq!(fork.stats().resets.get(), 1);
        assert_eq!(fork.stats().full_resets.get(), 0);
    }

    #[test]
    fn reset_is_idempotent() {
        let (main, mut fork) = fork_pair(false);
        fork.machine_mut().copy_to_guest(0x9000, b"dirty").unwrap();
        fork.reset_to(&main).unwrap();
        let regs = fork.machine().registers();
        let mem = fork.machine().copy_from_guest(0x9000, 5).unwrap();
        fork.reset_to(&main).unwrap();
        assert_eq!(fork.machine().registers(), regs);
        assert_eq!(fork.machine().copy_from_guest(0x9000, 5).unwrap(), mem);
        assert_eq!(mem, vec![0u8; 5]);
        assert_eq!(fork.stats().resets.get(), 2);
    }

    #[test]
    fn post_arena_grows_only() {
        let (_main, mut fork) = fork_pair(false);
        let first = fork.allocate_post_data(4096).unwrap();
        // A smaller body reuses the existing region.
        assert_eq!(fork.allocate_post_data(16).unwrap(), first);
        // A larger one remaps.
        let bigger = fork.allocate_post_data(32 * 4096).unwrap();
        assert_ne!(bigger, first);
        assert_eq!(fork.allocate_post_data(4096).unwrap(), bigger);
    }
}
