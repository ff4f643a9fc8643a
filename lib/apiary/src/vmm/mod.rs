// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hypervisor capability consumed by the engine.
//!
//! The engine never talks to a hypervisor directly. It drives a [`Machine`]:
//! boot it, run it until the guest traps out, inspect registers and guest
//! memory, fork it copy-on-write, and reset it back to its fork source.
//! Drivers implement [`Vmm`] to mint machines from program images.
//!
//! A guest communicates with the host by executing a trap instruction with a
//! scalar call number in the ABI result register. That surfaces here as a
//! [`VmExit`] with [`VmExitKind::Vmcall`]; the host handles the call and
//! resumes the machine. Cross-machine operations (reset-to-source, remote
//! connect) take a [`VmId`] rather than a reference, so no object cycles
//! exist between machines and their owners.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub mod emulate;

/// Guest page granularity used for working-memory accounting.
pub const PAGE_SIZE: u64 = 4096;

/// Identifies a machine within its driver. Ids are never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmId(pub u64);

/// x86-64 register file, as visible to the host while the vCPU is halted.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// Why a machine stopped running.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VmExitKind {
    /// The guest executed the trap-out instruction; the call number was in
    /// the ABI result register.
    Vmcall(u32),
    /// The guest ran to completion of the current entry (function return or
    /// explicit stop) without trapping out.
    Halted,
}

/// Describes the reason for exiting execution of a vCPU.
#[derive(Debug, Clone, Copy)]
pub struct VmExit {
    /// Guest instruction pointer at the time of exit.
    pub rip: u64,
    pub kind: VmExitKind,
}

/// A fixed virtual address region established at machine construction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VirtualRemapping {
    pub phys: u64,
    pub virt: u64,
    pub size: u64,
    pub writable: bool,
    pub executable: bool,
    pub blackout: bool,
}

/// Options for constructing a main machine from a program image.
#[derive(Clone, Debug, Default)]
pub struct MachineOptions {
    pub max_mem: u64,
    pub max_cow_mem: u64,
    pub dylink_address_hint: u64,
    pub heap_address_hint: u64,
    pub vmem_base_address: u64,
    pub remappings: Vec<VirtualRemapping>,
    pub verbose_loader: bool,
    pub hugepages: bool,
    pub transparent_hugepages: bool,
    pub split_hugepages: bool,
    pub executable_heap: bool,
    pub hugepage_arena_size: u64,
    /// When set and the file exists, the machine restores itself from the
    /// snapshot instead of loading the image.
    pub snapshot_file: Option<PathBuf>,
}

/// Options for forking a request machine off a prepared main machine.
#[derive(Clone, Debug, Default)]
pub struct ForkOptions {
    pub max_mem: u64,
    pub max_cow_mem: u64,
    pub reset_free_work_mem: u64,
    pub split_hugepages: bool,
    pub hugepage_arena_size: u64,
}

/// Options for resetting a fork back to its source.
#[derive(Clone, Debug, Default)]
pub struct ResetOptions {
    pub max_mem: u64,
    pub max_cow_mem: u64,
    pub reset_free_work_mem: u64,
    pub reset_copy_all_registers: bool,
    /// Keep the accumulated working memory across the reset. Contents are
    /// still restored to the source's view; only the backing allocation
    /// survives. Ignored (treated as false) by a full reset.
    pub reset_keep_all_work_memory: bool,
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("vm run timed out after {seconds}s")]
    Timeout { seconds: f64 },

    #[error("machine exception: {msg} (data: {data:#x})")]
    Fault { msg: String, data: u64 },

    #[error("guest memory access out of bounds: {addr:#x}+{len:#x}")]
    OutOfBounds { addr: u64, len: u64 },

    #[error("no loadable guest in image: {0}")]
    UnknownImage(String),

    #[error("no such vm: {0:?}")]
    NoSuchVm(VmId),

    #[error("operation unsupported by driver: {0}")]
    Unsupported(&'static str),

    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

impl MachineError {
    /// True for deadline expiries, which are accounted separately from other
    /// guest faults.
    pub fn is_timeout(&self) -> bool {
        matches!(self, MachineError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, MachineError>;

/// One virtual machine. All methods are called with the vCPU halted; the
/// driver guarantees guest memory is quiescent while the host touches it.
pub trait Machine: Send {
    fn id(&self) -> VmId;

    /// Builds the guest stack, auxiliary vector, environment and program
    /// arguments, leaving the machine ready to run through its entry point.
    fn setup_linux(&mut self, argv: &[String], envp: &[String]) -> Result<()>;

    /// Runs the guest from its current state until the next trap-out or
    /// halt, bounded by `deadline`.
    fn run(&mut self, deadline: Duration) -> Result<VmExit>;

    /// Resumes the guest after a trap-out was handled.
    fn vmresume(&mut self, deadline: Duration) -> Result<VmExit>;

    /// Calls a guest function at `addr` with up to six integer arguments in
    /// the ABI argument registers and the stack pointer set to `stack`.
    fn timed_vmcall(
        &mut self,
        addr: u64,
        stack: u64,
        args: &[u64],
        deadline: Duration,
    ) -> Result<VmExit>;

    fn registers(&self) -> Registers;
    fn set_registers(&mut self, regs: Registers);

    /// Freezes the current memory image as the fork source and constrains
    /// subsequent writes to at most `max_work_mem` bytes of working memory.
    /// Addresses at or above `shared_boundary` are left shared (not
    /// copy-on-write).
    fn prepare_copy_on_write(
        &mut self,
        max_work_mem: u64,
        shared_boundary: u64,
    ) -> Result<()>;

    /// Forks a request machine off this (prepared) machine.
    fn fork(&self, opts: &ForkOptions) -> Result<Box<dyn Machine>>;

    /// Resets this fork back to `source`. Returns whether a full
    /// (page-table-wiping) reset was performed.
    fn reset_to(&mut self, source: VmId, opts: &ResetOptions) -> Result<bool>;

    fn copy_to_guest(&mut self, addr: u64, data: &[u8]) -> Result<()>;
    fn copy_from_guest(&self, addr: u64, len: u64) -> Result<Vec<u8>>;

    /// Reads `len` guest bytes as a lossy UTF-8 string.
    fn buffer_to_string(&self, addr: u64, len: u64) -> Result<String> {
        let bytes = self.copy_from_guest(addr, len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Grow-only guest allocation outside the working stack.
    fn mmap_allocate(&mut self, size: u64) -> Result<u64>;
    fn mmap_unmap(&mut self, addr: u64, size: u64) -> Result<()>;

    /// Base of the stack used for host-initiated guest calls.
    fn stack_address(&self) -> u64;
    fn set_stack_address(&mut self, addr: u64);

    /// Lowest mapped virtual address of the loaded image.
    fn start_address(&self) -> u64;

    /// Links this machine to a peer so the guest may execute in the peer's
    /// address space through the storage-call mechanism.
    fn remote_connect(&mut self, peer: VmId, permanent: bool) -> Result<()>;

    /// Whether the guest is currently engaged with its remote peer.
    fn is_remote_connected(&self) -> bool;
    fn remote(&self) -> Option<VmId>;

    /// Drives an engaged remote call to completion so the peer unwinds its
    /// stack, bounded by `deadline`. An error leaves the connection engaged.
    fn remote_return(&mut self, deadline: Duration) -> Result<()>;

    /// Whether this machine was restored from a snapshot file.
    fn has_snapshot_state(&self) -> bool;

    /// The caller-owned state area carried inside the snapshot.
    fn snapshot_user_area(&self) -> Result<Vec<u8>>;

    /// Writes the machine state and `user_area` to the configured snapshot
    /// file.
    fn save_snapshot_state(&mut self, user_area: &[u8]) -> Result<()>;
}

/// A driver capable of minting machines from program images.
pub trait Vmm: Send + Sync {
    fn create_machine(
        &self,
        binary: &crate::binary::BinaryStorage,
        opts: MachineOptions,
    ) -> Result<Box<dyn Machine>>;
}

/// Pushes `data` onto a descending guest stack, 8-byte aligned, and returns
/// the guest address of the copy.
pub fn stack_push(
    m: &mut dyn Machine,
    sp: &mut u64,
    data: &[u8],
) -> Result<u64> {
    *sp = sp
        .checked_sub(data.len() as u64)
        .ok_or(MachineError::OutOfBounds { addr: *sp, len: data.len() as u64 })?
        & !0x7;
    m.copy_to_guest(*sp, data)?;
    Ok(*sp)
}

/// Pushes a NUL-terminated string onto a descending guest stack.
pub fn stack_push_cstr(
    m: &mut dyn Machine,
    sp: &mut u64,
    s: &str,
) -> Result<u64> {
    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    stack_push(m, sp, &bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_kinds() {
        let e = VmExit { rip: 0x1000, kind: VmExitKind::Vmcall(0x10010) };
        assert!(matches!(e.kind, VmExitKind::Vmcall(0x10010)));
        assert!(MachineError::Timeout { seconds: 1.0 }.is_timeout());
        assert!(!MachineError::Failed("x".into()).is_timeout());
    }
}
