// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Userspace implementation of the machine capability.
//!
//! `EmuVmm` mints machines whose "guests" are host-side state machines
//! ([`GuestLogic`]) registered on the driver and selected by image content:
//! an image whose bytes read `emu:<name>` boots the guest registered under
//! `<name>`. The driver models the parts of a hypervisor the engine can
//! observe: sparse guest memory with copy-on-write forking, register state,
//! working-memory accounting, remote-connect bookkeeping, and snapshot
//! save/restore. It backs the test suite and development on hosts without a
//! hardware driver; the real KVM driver plugs in through the same traits.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{
    ForkOptions, Machine, MachineError, MachineOptions, Registers,
    ResetOptions, Result, VmExit, VmExitKind, VmId, Vmm, PAGE_SIZE,
};
use crate::binary::BinaryStorage;

const SNAPSHOT_MAGIC: u64 = 0x4150_4941_5259_5353;
const SNAPSHOT_VERSION: u32 = 1;

type Page = Box<[u8; PAGE_SIZE as usize]>;

fn zero_page() -> Page {
    Box::new([0u8; PAGE_SIZE as usize])
}

/// What a guest does when stepped.
pub enum StepResult {
    /// Execute the trap-out instruction with the given call number. The
    /// guest must have set up its registers through the view first.
    Trap(u32),
    /// The current entry ran to completion.
    Done,
    /// Burn guest CPU time.
    Sleep(Duration),
    /// Raise a machine exception.
    Fault(String),
}

/// Host-side guest behavior. One logic instance exists per machine; forks
/// and resets clone the source's logic so a fork picks up exactly where its
/// source was parked.
pub trait GuestLogic: Send {
    fn step(&mut self, vm: &mut GuestView<'_>) -> StepResult;
    fn clone_box(&self) -> Box<dyn GuestLogic>;

    /// Invoked instead of the boot phase when the machine was restored from
    /// a snapshot; implementations should jump to their serving state.
    fn restored(&mut self) {}
}

pub type GuestFactory = Arc<dyn Fn() -> Box<dyn GuestLogic> + Send + Sync>;

/// The guest's window onto its own machine while it runs.
pub struct GuestView<'a> {
    regs: &'a mut Registers,
    base: &'a HashMap<u64, Page>,
    overlay: &'a mut HashMap<u64, Page>,
    envp: &'a [String],
    remote_engaged: &'a mut bool,
}

impl GuestView<'_> {
    pub fn regs(&self) -> &Registers {
        self.regs
    }

    pub fn regs_mut(&mut self) -> &mut Registers {
        self.regs
    }

    /// Reads guest memory; unmapped pages read as zeroes.
    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut off = 0usize;
        while off < len {
            let cur = addr.wrapping_add(off as u64);
            let page = cur / PAGE_SIZE * PAGE_SIZE;
            let in_page = (cur - page) as usize;
            let take =
                (PAGE_SIZE as usize - in_page).min(len - off);
            let src = self
                .overlay
                .get(&page)
                .or_else(|| self.base.get(&page));
            if let Some(p) = src {
                out[off..off + take]
                    .copy_from_slice(&p[in_page..in_page + take]);
            }
            off += take;
        }
        out
    }

    /// Writes guest memory, faulting pages into the working set.
    pub fn write(&mut self, addr: u64, data: &[u8]) {
        write_pages(self.base, self.overlay, addr, data);
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        let b = self.read(addr, 8);
        u64::from_le_bytes(b.try_into().unwrap())
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        self.write(addr, &value.to_le_bytes());
    }

    /// Looks up a guest environment variable set by `setup_linux`.
    pub fn env(&self, key: &str) -> Option<String> {
        let prefix = format!("{}=", key);
        self.envp
            .iter()
            .find(|e| e.starts_with(&prefix))
            .map(|e| e[prefix.len()..].to_string())
    }

    /// Marks the machine as executing (or done executing) in its remote
    /// peer's address space.
    pub fn set_remote_engaged(&mut self, engaged: bool) {
        *self.remote_engaged = engaged;
    }
}

fn write_pages(
    base: &HashMap<u64, Page>,
    overlay: &mut HashMap<u64, Page>,
    addr: u64,
    data: &[u8],
) {
    let mut off = 0usize;
    while off < data.len() {
        let cur = addr.wrapping_add(off as u64);
        let page = cur / PAGE_SIZE * PAGE_SIZE;
        let in_page = (cur - page) as usize;
        let take = (PAGE_SIZE as usize - in_page).min(data.len() - off);
        let p = overlay.entry(page).or_insert_with(|| {
            base.get(&page).cloned().unwrap_or_else(zero_page)
        });
        p[in_page..in_page + take].copy_from_slice(&data[off..off + take]);
        off += take;
    }
}

struct Core {
    regs: Registers,
    /// Frozen fork-source image; shared between a main machine and its
    /// forks.
    base: Arc<HashMap<u64, Page>>,
    /// Working memory accumulated since the last freeze or reset.
    overlay: HashMap<u64, Page>,
    logic: Box<dyn GuestLogic>,
    stack: u64,
    start_addr: u64,
    mmap_cursor: u64,
    max_work_mem: u64,
    remote: Option<VmId>,
    remote_permanent: bool,
    remote_engaged: bool,
    snapshot_file: Option<std::path::PathBuf>,
    from_snapshot: bool,
    user_area: Vec<u8>,
    argv: Vec<String>,
    envp: Vec<String>,
}

impl Core {
    fn freeze(&mut self) {
        if !self.overlay.is_empty() {
            let mut merged: HashMap<u64, Page> = (*self.base).clone();
            merged.extend(self.overlay.drain());
            self.base = Arc::new(merged);
        }
    }

    fn merged_page(&self, page: u64) -> Option<&Page> {
        self.overlay.get(&page).or_else(|| self.base.get(&page))
    }

    fn read(&self, addr: u64, len: u64) -> Result<Vec<u8>> {
        if addr.checked_add(len).is_none() {
            return Err(MachineError::OutOfBounds { addr, len });
        }
        let mut out = vec![0u8; len as usize];
        let mut off = 0u64;
        while off < len {
            let cur = addr + off;
            let page = cur / PAGE_SIZE * PAGE_SIZE;
            let in_page = (cur - page) as usize;
            let take = (PAGE_SIZE - in_page as u64).min(len - off) as usize;
            if let Some(p) = self.merged_page(page) {
                out[off as usize..off as usize + take]
                    .copy_from_slice(&p[in_page..in_page + take]);
            }
            off += take as u64;
        }
        Ok(out)
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        if addr.checked_add(data.len() as u64).is_none() {
            return Err(MachineError::OutOfBounds {
                addr,
                len: data.len() as u64,
            });
        }
        write_pages(&self.base, &mut self.overlay, addr, data);
        if self.max_work_mem > 0 {
            let used = self.overlay.len() as u64 * PAGE_SIZE;
            if used > self.max_work_mem {
                return Err(MachineError::Fault {
                    msg: format!(
                        "working memory limit exceeded ({} > {})",
                        used, self.max_work_mem
                    ),
                    data: addr,
                });
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct World {
    next_id: AtomicU64,
    cores: Mutex<HashMap<VmId, Arc<Mutex<Core>>>>,
}

impl World {
    fn core(&self, id: VmId) -> Result<Arc<Mutex<Core>>> {
        self.cores
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(MachineError::NoSuchVm(id))
    }

    fn insert(&self, core: Core) -> (VmId, Arc<Mutex<Core>>) {
        let id = VmId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let core = Arc::new(Mutex::new(core));
        self.cores.lock().unwrap().insert(id, Arc::clone(&core));
        (id, core)
    }
}

/// The userspace driver.
pub struct EmuVmm {
    world: Arc<World>,
    guests: RwLock<HashMap<String, GuestFactory>>,
}

impl EmuVmm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            world: Arc::new(World::default()),
            guests: RwLock::new(HashMap::new()),
        })
    }

    /// A driver preloaded with the built-in `hello` guest, which answers
    /// every request with 200 `text/plain` "Hello World".
    pub fn with_demo_guests() -> Arc<Self> {
        let vmm = Self::new();
        vmm.register_guest("hello", HelloGuest::default);
        vmm
    }

    pub fn register_guest<F, G>(&self, name: &str, factory: F)
    where
        F: Fn() -> G + Send + Sync + 'static,
        G: GuestLogic + 'static,
    {
        let factory: GuestFactory =
            Arc::new(move || Box::new(factory()) as Box<dyn GuestLogic>);
        self.guests.write().unwrap().insert(name.to_string(), factory);
    }

    fn logic_for(&self, binary: &BinaryStorage) -> Result<Box<dyn GuestLogic>> {
        let text = std::str::from_utf8(binary.as_bytes())
            .map_err(|_| {
                MachineError::UnknownImage(
                    "emulation driver cannot load hardware images".to_string(),
                )
            })?
            .trim();
        let name = text.strip_prefix("emu:").ok_or_else(|| {
            MachineError::UnknownImage(format!(
                "not an emulation image: {:.32}",
                text
            ))
        })?;
        let guests = self.guests.read().unwrap();
        let factory = guests.get(name).ok_or_else(|| {
            MachineError::UnknownImage(format!("no guest named '{}'", name))
        })?;
        Ok(factory())
    }
}

impl Vmm for EmuVmm {
    fn create_machine(
        &self,
        binary: &BinaryStorage,
        opts: MachineOptions,
    ) -> Result<Box<dyn Machine>> {
        if let Some(path) = opts.snapshot_file.as_ref() {
            if path.exists() {
                let mut logic = self.logic_for(binary)?;
                logic.restored();
                let mut core = load_snapshot(path, logic)?;
                core.snapshot_file = opts.snapshot_file.clone();
                core.max_work_mem = opts.max_cow_mem;
                let (id, core) = self.world.insert(core);
                return Ok(Box::new(EmuMachine {
                    world: Arc::clone(&self.world),
                    id,
                    core,
                }));
            }
        }

        let logic = self.logic_for(binary)?;
        let core = Core {
            regs: Registers {
                rip: opts.vmem_base_address.max(0x1000),
                rsp: STACK_BASE,
                ..Default::default()
            },
            base: Arc::new(HashMap::new()),
            overlay: HashMap::new(),
            logic,
            stack: STACK_BASE,
            start_addr: opts.vmem_base_address,
            mmap_cursor: MMAP_BASE,
            max_work_mem: 0,
            remote: None,
            remote_permanent: false,
            remote_engaged: false,
            snapshot_file: opts.snapshot_file.clone(),
            from_snapshot: false,
            user_area: Vec::new(),
            argv: Vec::new(),
            envp: Vec::new(),
        };
        let (id, core) = self.world.insert(core);
        Ok(Box::new(EmuMachine { world: Arc::clone(&self.world), id, core }))
    }
}

const STACK_BASE: u64 = 0x0C00_0000;
const MMAP_BASE: u64 = 0x1_0000_0000;

pub struct EmuMachine {
    world: Arc<World>,
    id: VmId,
    core: Arc<Mutex<Core>>,
}

impl EmuMachine {
    fn run_core(&mut self, deadline: Duration) -> Result<VmExit> {
        let start = Instant::now();
        let mut core = self.core.lock().unwrap();
        loop {
            if start.elapsed() >= deadline {
                return Err(MachineError::Timeout {
                    seconds: deadline.as_secs_f64(),
                });
            }
            let step = {
                let Core {
                    regs, base, overlay, logic, envp, remote_engaged, ..
                } = &mut *core;
                let mut view = GuestView {
                    regs,
                    base: &**base,
                    overlay,
                    envp: envp.as_slice(),
                    remote_engaged,
                };
                logic.step(&mut view)
            };
            match step {
                StepResult::Trap(nr) => {
                    return Ok(VmExit {
                        rip: core.regs.rip,
                        kind: VmExitKind::Vmcall(nr),
                    });
                }
                StepResult::Done => {
                    return Ok(VmExit {
                        rip: core.regs.rip,
                        kind: VmExitKind::Halted,
                    });
                }
                StepResult::Sleep(d) => {
                    let remaining =
                        deadline.saturating_sub(start.elapsed());
                    if d >= remaining {
                        std::thread::sleep(remaining);
                        return Err(MachineError::Timeout {
                            seconds: deadline.as_secs_f64(),
                        });
                    }
                    std::thread::sleep(d);
                }
                StepResult::Fault(msg) => {
                    let data = core.regs.rip;
                    return Err(MachineError::Fault { msg, data });
                }
            }
        }
    }
}

impl Machine for EmuMachine {
    fn id(&self) -> VmId {
        self.id
    }

    fn setup_linux(&mut self, argv: &[String], envp: &[String]) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        core.argv = argv.to_vec();
        core.envp = envp.to_vec();
        Ok(())
    }

    fn run(&mut self, deadline: Duration) -> Result<VmExit> {
        self.run_core(deadline)
    }

    fn vmresume(&mut self, deadline: Duration) -> Result<VmExit> {
        self.run_core(deadline)
    }

    fn timed_vmcall(
        &mut self,
        addr: u64,
        stack: u64,
        args: &[u64],
        deadline: Duration,
    ) -> Result<VmExit> {
        {
            let mut core = self.core.lock().unwrap();
            let regs = &mut core.regs;
            regs.rip = addr;
            regs.rsp = stack & !0xF;
            regs.rax = 0;
            let dst = [
                &mut regs.rdi,
                &mut regs.rsi,
                &mut regs.rdx,
                &mut regs.rcx,
                &mut regs.r8,
                &mut regs.r9,
            ];
            for (slot, arg) in dst.into_iter().zip(args.iter()) {
                *slot = *arg;
            }
        }
        self.run_core(deadline)
    }

    fn registers(&self) -> Registers {
        self.core.lock().unwrap().regs
    }

    fn set_registers(&mut self, regs: Registers) {
        self.core.lock().unwrap().regs = regs;
    }

    fn prepare_copy_on_write(
        &mut self,
        max_work_mem: u64,
        _shared_boundary: u64,
    ) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        core.freeze();
        core.max_work_mem = max_work_mem;
        Ok(())
    }

    fn fork(&self, opts: &ForkOptions) -> Result<Box<dyn Machine>> {
        let mut core = self.core.lock().unwrap();
        core.freeze();
        let child = Core {
            regs: core.regs,
            base: Arc::clone(&core.base),
            overlay: HashMap::new(),
            logic: core.logic.clone_box(),
            stack: core.stack,
            start_addr: core.start_addr,
            mmap_cursor: core.mmap_cursor,
            max_work_mem: opts.max_cow_mem,
            remote: None,
            remote_permanent: false,
            remote_engaged: false,
            snapshot_file: None,
            from_snapshot: false,
            user_area: core.user_area.clone(),
            argv: core.argv.clone(),
            envp: core.envp.clone(),
        };
        let (id, child) = self.world.insert(child);
        Ok(Box::new(EmuMachine {
            world: Arc::clone(&self.world),
            id,
            core: child,
        }))
    }

    fn reset_to(&mut self, source: VmId, opts: &ResetOptions) -> Result<bool> {
        if source == self.id {
            return Err(MachineError::Unsupported("reset to self"));
        }
        let src = self.world.core(source)?;
        // Consistent lock order by id avoids deadlocking against a
        // concurrent reset in the other direction.
        let (mut me, mut other);
        if source < self.id {
            other = src.lock().unwrap();
            me = self.core.lock().unwrap();
        } else {
            me = self.core.lock().unwrap();
            other = src.lock().unwrap();
        }
        other.freeze();

        let keep = opts.reset_keep_all_work_memory;
        let full = !keep;
        if full {
            me.overlay.clear();
        } else {
            // Restore contents but keep the working pages allocated.
            let pages: Vec<u64> = me.overlay.keys().copied().collect();
            for page in pages {
                let fresh = other
                    .base
                    .get(&page)
                    .cloned()
                    .unwrap_or_else(zero_page);
                me.overlay.insert(page, fresh);
            }
        }
        me.base = Arc::clone(&other.base);
        if opts.reset_copy_all_registers {
            me.regs = other.regs;
        }
        me.logic = other.logic.clone_box();
        me.stack = other.stack;
        me.mmap_cursor = other.mmap_cursor;
        me.remote_engaged = false;
        me.max_work_mem = opts.max_cow_mem;
        Ok(full)
    }

    fn copy_to_guest(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.core.lock().unwrap().write(addr, data)
    }

    fn copy_from_guest(&self, addr: u64, len: u64) -> Result<Vec<u8>> {
        self.core.lock().unwrap().read(addr, len)
    }

    fn mmap_allocate(&mut self, size: u64) -> Result<u64> {
        let mut core = self.core.lock().unwrap();
        let addr = core.mmap_cursor;
        let size = (size + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE;
        core.mmap_cursor += size.max(PAGE_SIZE);
        Ok(addr)
    }

    fn mmap_unmap(&mut self, addr: u64, size: u64) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        let end = addr + (size + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE;
        let mut page = addr / PAGE_SIZE * PAGE_SIZE;
        while page < end {
            core.overlay.remove(&page);
            page += PAGE_SIZE;
        }
        Ok(())
    }

    fn stack_address(&self) -> u64 {
        self.core.lock().unwrap().stack
    }

    fn set_stack_address(&mut self, addr: u64) {
        self.core.lock().unwrap().stack = addr;
    }

    fn start_address(&self) -> u64 {
        self.core.lock().unwrap().start_addr
    }

    fn remote_connect(&mut self, peer: VmId, permanent: bool) -> Result<()> {
        // The peer must belong to this driver.
        let _ = self.world.core(peer)?;
        let mut core = self.core.lock().unwrap();
        core.remote = Some(peer);
        core.remote_permanent = permanent;
        Ok(())
    }

    fn is_remote_connected(&self) -> bool {
        self.core.lock().unwrap().remote_engaged
    }

    fn remote(&self) -> Option<VmId> {
        self.core.lock().unwrap().remote
    }

    fn remote_return(&mut self, _deadline: Duration) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        core.remote_engaged = false;
        if !core.remote_permanent {
            core.remote = None;
        }
        Ok(())
    }

    fn has_snapshot_state(&self) -> bool {
        self.core.lock().unwrap().from_snapshot
    }

    fn snapshot_user_area(&self) -> Result<Vec<u8>> {
        Ok(self.core.lock().unwrap().user_area.clone())
    }

    fn save_snapshot_state(&mut self, user_area: &[u8]) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        core.user_area = user_area.to_vec();
        let path = core
            .snapshot_file
            .clone()
            .ok_or(MachineError::Unsupported("no snapshot file configured"))?;
        save_snapshot(&path, &core)
    }
}

impl Drop for EmuMachine {
    fn drop(&mut self) {
        self.world.cores.lock().unwrap().remove(&self.id);
    }
}

fn save_snapshot(path: &Path, core: &Core) -> Result<()> {
    let mut out = Vec::new();
    out.write_u64::<LittleEndian>(SNAPSHOT_MAGIC)?;
    out.write_u32::<LittleEndian>(SNAPSHOT_VERSION)?;
    for v in registers_as_array(&core.regs) {
        out.write_u64::<LittleEndian>(v)?;
    }
    out.write_u64::<LittleEndian>(core.stack)?;
    out.write_u64::<LittleEndian>(core.start_addr)?;
    out.write_u64::<LittleEndian>(core.mmap_cursor)?;
    out.write_u32::<LittleEndian>(core.user_area.len() as u32)?;
    out.write_all(&core.user_area)?;

    // Overlay pages shadow their frozen base pages.
    let mut pages: std::collections::BTreeMap<u64, &Page> =
        core.base.iter().map(|(a, p)| (*a, p)).collect();
    for (a, p) in core.overlay.iter() {
        pages.insert(*a, p);
    }
    out.write_u32::<LittleEndian>(pages.len() as u32)?;
    for (addr, page) in pages {
        out.write_u64::<LittleEndian>(addr)?;
        out.write_all(&page[..])?;
    }
    std::fs::write(path, out)?;
    Ok(())
}

fn load_snapshot(path: &Path, logic: Box<dyn GuestLogic>) -> Result<Core> {
    let data = std::fs::read(path)?;
    let mut rd = &data[..];
    if rd.read_u64::<LittleEndian>()? != SNAPSHOT_MAGIC {
        return Err(MachineError::Failed(format!(
            "bad snapshot magic in {}",
            path.display()
        )));
    }
    if rd.read_u32::<LittleEndian>()? != SNAPSHOT_VERSION {
        return Err(MachineError::Failed("snapshot version mismatch".into()));
    }
    let mut regvals = [0u64; 18];
    for v in regvals.iter_mut() {
        *v = rd.read_u64::<LittleEndian>()?;
    }
    let stack = rd.read_u64::<LittleEndian>()?;
    let start_addr = rd.read_u64::<LittleEndian>()?;
    let mmap_cursor = rd.read_u64::<LittleEndian>()?;
    let ua_len = rd.read_u32::<LittleEndian>()? as usize;
    let mut user_area = vec![0u8; ua_len];
    rd.read_exact(&mut user_area)?;
    let n_pages = rd.read_u32::<LittleEndian>()?;
    let mut base = HashMap::new();
    for _ in 0..n_pages {
        let addr = rd.read_u64::<LittleEndian>()?;
        let mut page = zero_page();
        rd.read_exact(&mut page[..])?;
        base.insert(addr, page);
    }

    Ok(Core {
        regs: registers_from_array(&regvals),
        base: Arc::new(base),
        overlay: HashMap::new(),
        logic,
        stack,
        start_addr,
        mmap_cursor,
        max_work_mem: 0,
        remote: None,
        remote_permanent: false,
        remote_engaged: false,
        snapshot_file: None,
        from_snapshot: true,
        user_area,
        argv: Vec::new(),
        envp: Vec::new(),
    })
}

fn registers_as_array(r: &Registers) -> [u64; 18] {
    [
        r.rax, r.rbx, r.rcx, r.rdx, r.rsi, r.rdi, r.rsp, r.rbp, r.r8, r.r9,
        r.r10, r.r11, r.r12, r.r13, r.r14, r.r15, r.rip, r.rflags,
    ]
}

fn registers_from_array(v: &[u64; 18]) -> Registers {
    Registers {
        rax: v[0],
        rbx: v[1],
        rcx: v[2],
        rdx: v[3],
        rsi: v[4],
        rdi: v[5],
        rsp: v[6],
        rbp: v[7],
        r8: v[8],
        r9: v[9],
        r10: v[10],
        r11: v[11],
        r12: v[12],
        r13: v[13],
        r14: v[14],
        r15: v[15],
        rip: v[16],
        rflags: v[17],
    }
}

/// The built-in demo guest: an event-driven handler answering every request
/// with 200 "Hello World".
#[derive(Clone, Default)]
struct HelloGuest {
    serving: bool,
}

impl HelloGuest {
    const INPUTS: u64 = 0x20000;
    const BODY: u64 = 0x30000;
}

impl GuestLogic for HelloGuest {
    fn step(&mut self, vm: &mut GuestView<'_>) -> StepResult {
        use crate::syscalls::nr;
        if !self.serving {
            self.serving = true;
            vm.regs_mut().rdi = Self::INPUTS;
            return StepResult::Trap(nr::WAIT_FOR_REQUESTS);
        }
        let body = b"Hello World";
        let ctype = b"text/plain\0";
        vm.write(Self::BODY, body);
        vm.write(Self::BODY + 0x100, ctype);
        let regs = vm.regs_mut();
        regs.rdi = 200;
        regs.rsi = Self::BODY + 0x100;
        regs.rdx = (ctype.len() - 1) as u64;
        regs.rcx = Self::BODY;
        regs.r8 = body.len() as u64;
        StepResult::Trap(nr::BACKEND_RESPONSE)
    }

    fn clone_box(&self) -> Box<dyn GuestLogic> {
        Box::new(self.clone())
    }

    fn restored(&mut self) {
        self.serving = true;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Clone)]
    struct Counter {
        n: u64,
    }
    impl GuestLogic for Counter {
        fn step(&mut self, vm: &mut GuestView<'_>) -> StepResult {
            self.n += 1;
            vm.write_u64(0x1000, self.n);
            vm.regs_mut().rax = self.n;
            StepResult::Trap(0x7F000)
        }
        fn clone_box(&self) -> Box<dyn GuestLogic> {
            Box::new(self.clone())
        }
    }

    fn driver() -> Arc<EmuVmm> {
        let vmm = EmuVmm::new();
        vmm.register_guest("counter", || Counter { n: 0 });
        vmm
    }

    fn machine(vmm: &EmuVmm) -> Box<dyn Machine> {
        vmm.create_machine(
            &BinaryStorage::from(&b"emu:counter"[..]),
            MachineOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn memory_roundtrip() {
        let vmm = driver();
        let mut m = machine(&vmm);
        let data: Vec<u8> = (0..9000).map(|i| (i % 251) as u8).collect();
        // Spans three pages, unaligned on purpose.
        m.copy_to_guest(0x1ffe, &data).unwrap();
        assert_eq!(m.copy_from_guest(0x1ffe, 9000).unwrap(), data);
        // Unmapped memory reads as zeroes.
        assert_eq!(m.copy_from_guest(0x900000, 16).unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn fork_sees_source_and_diverges() {
        let vmm = driver();
        let mut main = machine(&vmm);
        main.copy_to_guest(0x4000, b"shared").unwrap();
        main.prepare_copy_on_write(0, u64::MAX).unwrap();

        let mut fork = main.fork(&ForkOptions::default()).unwrap();
        assert_eq!(fork.copy_from_guest(0x4000, 6).unwrap(), b"shared");

        fork.copy_to_guest(0x4000, b"child!").unwrap();
        assert_eq!(main.copy_from_guest(0x4000, 6).unwrap(), b"shared");
        assert_eq!(fork.copy_from_guest(0x4000, 6).unwrap(), b"child!");

        let full = fork
            .reset_to(
                main.id(),
                &ResetOptions {
                    reset_copy_all_registers: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(full);
        assert_eq!(fork.copy_from_guest(0x4000, 6).unwrap(), b"shared");
    }

    #[test]
    fn keep_working_memory_reset_restores_contents() {
        let vmm = driver();
        let mut main = machine(&vmm);
        main.prepare_copy_on_write(0, u64::MAX).unwrap();
        let mut fork = main.fork(&ForkOptions::default()).unwrap();
        fork.copy_to_guest(0x8000, b"scratch").unwrap();

        let full = fork
            .reset_to(
                main.id(),
                &ResetOptions {
                    reset_copy_all_registers: true,
                    reset_keep_all_work_memory: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!full);
        assert_eq!(
            fork.copy_from_guest(0x8000, 7).unwrap(),
            vec![0u8; 7],
            "kept pages must still be restored to the source view"
        );
    }

    #[test]
    fn guest_steps_and_logic_forks() {
        let vmm = driver();
        let mut main = machine(&vmm);
        let exit = main.run(Duration::from_secs(1)).unwrap();
        assert!(matches!(exit.kind, VmExitKind::Vmcall(0x7F000)));
        assert_eq!(main.registers().rax, 1);

        main.prepare_copy_on_write(0, u64::MAX).unwrap();
        let mut fork = main.fork(&ForkOptions::default()).unwrap();
        let exit = fork.vmresume(Duration::from_secs(1)).unwrap();
        assert!(matches!(exit.kind, VmExitKind::Vmcall(_)));
        // The fork continued from the source's counter value.
        assert_eq!(fork.registers().rax, 2);
        assert_eq!(main.registers().rax, 1);
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = std::env::temp_dir()
            .join(format!("apiary-emusnap-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("snap.bin");
        let _ = std::fs::remove_file(&file);

        let vmm = driver();
        let opts = MachineOptions {
            snapshot_file: Some(file.clone()),
            ..Default::default()
        };
        let mut m = vmm
            .create_machine(&BinaryStorage::from(&b"emu:counter"[..]), opts.clone())
            .unwrap();
        assert!(!m.has_snapshot_state());
        m.copy_to_guest(0x6000, b"persist").unwrap();
        m.save_snapshot_state(b"user-area").unwrap();
        drop(m);

        let m2 = vmm
            .create_machine(&BinaryStorage::from(&b"emu:counter"[..]), opts)
            .unwrap();
        assert!(m2.has_snapshot_state());
        assert_eq!(m2.snapshot_user_area().unwrap(), b"user-area");
        assert_eq!(m2.copy_from_guest(0x6000, 7).unwrap(), b"persist");

        let _ = std::fs::remove_file(&file);
    }

    #[test]
    fn sleep_past_deadline_times_out() {
        #[derive(Clone)]
        struct Spinner;
        impl GuestLogic for Spinner {
            fn step(&mut self, _vm: &mut GuestView<'_>) -> StepResult {
                StepResult::Sleep(Duration::from_secs(5))
            }
            fn clone_box(&self) -> Box<dyn GuestLogic> {
                Box::new(self.clone())
            }
        }
        let vmm = EmuVmm::new();
        vmm.register_guest("spin", || Spinner);
        let mut m = vmm
            .create_machine(
                &BinaryStorage::from(&b"emu:spin"[..]),
                MachineOptions::default(),
            )
            .unwrap();
        let err = m.run(Duration::from_millis(20)).unwrap_err();
        assert!(err.is_timeout());
    }
}
