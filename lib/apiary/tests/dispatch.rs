// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end dispatch tests against scripted guests on the userspace
//! driver: reserve, marshal, resume, harvest, reset.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use slog::{o, Logger};
use zerocopy::FromBytes;

use apiary::config::{TenantConfig, TenantGroup};
use apiary::dispatch::{dispatch, BackendInputs, Request};
use apiary::syscalls::nr;
use apiary::tenant::TenantInstance;
use apiary::update::LiveUpdateParams;
use apiary::vmm::emulate::{EmuVmm, GuestLogic, GuestView, StepResult};
use apiary::vmm::Registers;

const INPUTS: u64 = 0x20000;
const SCRATCH: u64 = 0x30000;
const STORAGE_FUNC: u64 = 0x5000;
const SER_FUNC: u64 = 0x6000;
const DESER_FUNC: u64 = 0x6100;
const STORED_AT: u64 = 0x70000;

fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Writes a guest-selector image to a temp file and returns its path.
fn write_image(tag: &str, guest: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join(format!("apiary-e2e-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.img", tag));
    std::fs::write(&path, format!("emu:{}", guest)).unwrap();
    path
}

fn make_tenant(
    vmm: Arc<EmuVmm>,
    tag: &str,
    guest: &str,
    configure: impl FnOnce(&mut TenantGroup),
) -> Arc<TenantInstance> {
    let mut group = TenantGroup::new("compute");
    group.max_concurrency = 1;
    group.max_queue_time = 2.0;
    configure(&mut group);
    let mut config = TenantConfig::new(format!("{}.test", tag), group);
    config.filename =
        write_image(tag, guest).to_string_lossy().into_owned();
    config.allowed_file = format!("{}.state", config.filename);

    let tenant = TenantInstance::new(config, vmm, &test_logger(), true);
    // Fail fast if the program cannot come up.
    tenant
        .ref_program(false)
        .expect("program should initialize");
    tenant
}

fn respond(
    vm: &mut GuestView<'_>,
    status: u64,
    body: &[u8],
    body_at: u64,
) -> StepResult {
    let ctype = b"text/plain\0";
    vm.write(body_at, body);
    vm.write(body_at + 0x800, ctype);
    let regs = vm.regs_mut();
    regs.rdi = status;
    regs.rsi = body_at + 0x800;
    regs.rdx = (ctype.len() - 1) as u64;
    regs.rcx = body_at;
    regs.r8 = body.len() as u64;
    StepResult::Trap(nr::BACKEND_RESPONSE)
}

fn park(vm: &mut GuestView<'_>) -> StepResult {
    vm.regs_mut().rdi = INPUTS;
    StepResult::Trap(nr::WAIT_FOR_REQUESTS)
}

fn read_inputs(vm: &GuestView<'_>) -> BackendInputs {
    let bytes = vm.read(INPUTS, std::mem::size_of::<BackendInputs>());
    BackendInputs::read_from(bytes.as_slice()).unwrap()
}

/// Event-driven guest echoing POST bodies and greeting GETs; asserts the
/// empty-body marshaling contract on the way.
#[derive(Clone, Default)]
struct EchoGuest {
    parked: bool,
}

impl GuestLogic for EchoGuest {
    fn step(&mut self, vm: &mut GuestView<'_>) -> StepResult {
        if !self.parked {
            self.parked = true;
            return park(vm);
        }
        self.parked = false;
        let inputs = read_inputs(vm);
        if inputs.data_len == 0 {
            if inputs.data != 0 {
                return StepResult::Fault(
                    "empty body must have a null data pointer".to_string(),
                );
            }
            // The content type must still be a readable, empty string.
            if vm.read(inputs.ctype, 1)[0] != 0 {
                return StepResult::Fault(
                    "empty body content type must point at NUL".to_string(),
                );
            }
            return respond(vm, 200, b"Hello World", SCRATCH);
        }
        let body = vm.read(inputs.data, inputs.data_len as usize);
        respond(vm, 200, &body, SCRATCH)
    }

    fn clone_box(&self) -> Box<dyn GuestLogic> {
        Box::new(self.clone())
    }
}

/// Keeps per-VM state across requests; used to observe reset policy.
#[derive(Clone, Default)]
struct CountingGuest {
    parked: bool,
    served: u64,
}

impl GuestLogic for CountingGuest {
    fn step(&mut self, vm: &mut GuestView<'_>) -> StepResult {
        if !self.parked {
            self.parked = true;
            return park(vm);
        }
        self.parked = false;
        self.served += 1;
        let body = format!("count={}", self.served);
        respond(vm, 200, body.as_bytes(), SCRATCH)
    }

    fn clone_box(&self) -> Box<dyn GuestLogic> {
        Box::new(self.clone())
    }
}

/// Serves strictly slower with every request, so a warmup replay never
/// improves after its first iteration.
#[derive(Clone, Default)]
struct SlowerEachTimeGuest {
    parked: bool,
    slept: bool,
    served: u64,
}

impl GuestLogic for SlowerEachTimeGuest {
    fn step(&mut self, vm: &mut GuestView<'_>) -> StepResult {
        if !self.parked {
            self.parked = true;
            return park(vm);
        }
        if !self.slept {
            self.slept = true;
            let shift = 2 * self.served.min(3) as u32;
            return StepResult::Sleep(Duration::from_millis(10 << shift));
        }
        self.slept = false;
        self.parked = false;
        self.served += 1;
        let body = format!("count={}", self.served);
        respond(vm, 200, body.as_bytes(), SCRATCH)
    }

    fn clone_box(&self) -> Box<dyn GuestLogic> {
        Box::new(self.clone())
    }
}

/// Spins past the request deadline on `/spin`, serves normally otherwise.
#[derive(Clone, Default)]
struct SpinGuest {
    parked: bool,
    spins: u32,
}

impl GuestLogic for SpinGuest {
    fn step(&mut self, vm: &mut GuestView<'_>) -> StepResult {
        if !self.parked {
            self.parked = true;
            return park(vm);
        }
        let inputs = read_inputs(vm);
        let url = vm.read(inputs.url, inputs.url_len as usize);
        if url == b"/spin" {
            if self.spins < 8 {
                self.spins += 1;
                return StepResult::Sleep(Duration::from_millis(50));
            }
            self.spins = 0;
        }
        self.parked = false;
        respond(vm, 200, b"ok", SCRATCH)
    }

    fn clone_box(&self) -> Box<dyn GuestLogic> {
        Box::new(self.clone())
    }
}

/// Storage-side guest: registers one callable entry point and echoes the
/// caller's buffer back through `STORAGE_RETURN`.
#[derive(Clone, Default)]
struct StorageGuest {
    booted: bool,
    in_call: bool,
}

impl GuestLogic for StorageGuest {
    fn step(&mut self, vm: &mut GuestView<'_>) -> StepResult {
        let rip = vm.regs().rip;
        if rip == STORAGE_FUNC {
            if self.in_call {
                // Cleanup resume after STORAGE_RETURN.
                self.in_call = false;
                return StepResult::Done;
            }
            self.in_call = true;
            let desc_addr = vm.regs().rsi;
            let buf_addr = vm.read_u64(desc_addr);
            let buf_len = vm.read_u64(desc_addr + 8);
            let bytes = vm.read(buf_addr, buf_len as usize);
            vm.write(0x50000, &bytes);
            let regs = vm.regs_mut();
            regs.rdi = 0x50000;
            regs.rsi = bytes.len() as u64;
            return StepResult::Trap(nr::STORAGE_RETURN);
        }
        if !self.booted {
            self.booted = true;
            // Seed memory request VMs can harvest from in remote mode.
            vm.write(STORED_AT, b"peer-data");
            vm.write(STORED_AT + 0x800, b"text/plain\0");
            vm.regs_mut().rdi = STORAGE_FUNC;
            return StepResult::Trap(nr::STORAGE_ALLOW);
        }
        vm.regs_mut().rdi = INPUTS;
        StepResult::Trap(nr::WAIT_FOR_REQUESTS)
    }

    fn clone_box(&self) -> Box<dyn GuestLogic> {
        Box::new(self.clone())
    }
}

/// Request-side guest that round-trips a buffer through the storage VM.
#[derive(Clone, Default)]
struct StorageCaller {
    parked: bool,
    called: bool,
}

impl GuestLogic for StorageCaller {
    fn step(&mut self, vm: &mut GuestView<'_>) -> StepResult {
        if !self.parked {
            self.parked = true;
            return park(vm);
        }
        if !self.called {
            self.called = true;
            vm.write(0x21000, b"hello");
            vm.write_u64(0x22000, 0x21000);
            vm.write_u64(0x22008, 5);
            let regs = vm.regs_mut();
            regs.rdi = STORAGE_FUNC;
            regs.rsi = 1;
            regs.rdx = 0x22000;
            regs.rcx = 0x23000;
            regs.r8 = 8;
            return StepResult::Trap(nr::STORAGE_CALLV);
        }
        self.parked = false;
        self.called = false;
        let retval = vm.regs().rax as i64;
        if retval != 5 {
            return StepResult::Fault(format!(
                "storage call returned {}",
                retval
            ));
        }
        let body = vm.read(0x23000, 5);
        respond(vm, 200, &body, SCRATCH)
    }

    fn clone_box(&self) -> Box<dyn GuestLogic> {
        Box::new(self.clone())
    }
}

/// Request-side guest that emits its response from the storage peer's
/// memory while remote-engaged.
#[derive(Clone, Default)]
struct RemoteResponder {
    parked: bool,
}

impl GuestLogic for RemoteResponder {
    fn step(&mut self, vm: &mut GuestView<'_>) -> StepResult {
        if !self.parked {
            self.parked = true;
            return park(vm);
        }
        self.parked = false;
        vm.set_remote_engaged(true);
        let regs = vm.regs_mut();
        regs.rdi = 200;
        regs.rsi = STORED_AT + 0x800;
        regs.rdx = 10;
        regs.rcx = STORED_AT;
        regs.r8 = 9;
        StepResult::Trap(nr::BACKEND_RESPONSE)
    }

    fn clone_box(&self) -> Box<dyn GuestLogic> {
        Box::new(self.clone())
    }
}

/// Storage guest registering live-update serialize/deserialize handlers.
#[derive(Clone, Default)]
struct TransferStorageGuest {
    phase: u8,
    deserialized: bool,
}

impl GuestLogic for TransferStorageGuest {
    fn step(&mut self, vm: &mut GuestView<'_>) -> StepResult {
        let rip = vm.regs().rip;
        if rip == SER_FUNC {
            vm.write(0x60000, b"state-42");
            let regs = vm.regs_mut();
            regs.rdi = 0x60000;
            regs.rsi = 8;
            return StepResult::Done;
        }
        if rip == DESER_FUNC {
            if self.deserialized {
                // Resumed after the host copied the state in.
                self.deserialized = false;
                return StepResult::Done;
            }
            self.deserialized = true;
            let regs = vm.regs_mut();
            regs.rdi = 0x61000;
            regs.rsi = 8;
            return StepResult::Done;
        }
        match self.phase {
            0 => {
                self.phase = 1;
                let regs = vm.regs_mut();
                regs.rdi = 6; // LIVEUPD_SERIALIZE
                regs.rsi = SER_FUNC;
                StepResult::Trap(nr::REGISTER_FUNC)
            }
            1 => {
                self.phase = 2;
                let regs = vm.regs_mut();
                regs.rdi = 7; // LIVEUPD_DESERIALIZE
                regs.rsi = DESER_FUNC;
                StepResult::Trap(nr::REGISTER_FUNC)
            }
            _ => {
                vm.regs_mut().rdi = INPUTS;
                StepResult::Trap(nr::WAIT_FOR_REQUESTS)
            }
        }
    }

    fn clone_box(&self) -> Box<dyn GuestLogic> {
        Box::new(self.clone())
    }
}

/// Fixed-body guest used as a second program version.
#[derive(Clone)]
struct VersionGuest {
    parked: bool,
    body: &'static str,
}

impl GuestLogic for VersionGuest {
    fn step(&mut self, vm: &mut GuestView<'_>) -> StepResult {
        if !self.parked {
            self.parked = true;
            return park(vm);
        }
        self.parked = false;
        respond(vm, 200, self.body.as_bytes(), SCRATCH)
    }

    fn clone_box(&self) -> Box<dyn GuestLogic> {
        Box::new(self.clone())
    }
}

/// Guest serving through a registered ON_GET handler instead of the
/// event-driven request loop.
#[derive(Clone, Default)]
struct OnGetGuest {
    registered: bool,
}

const ON_GET_ADDR: u64 = 0x4000;

impl GuestLogic for OnGetGuest {
    fn step(&mut self, vm: &mut GuestView<'_>) -> StepResult {
        if vm.regs().rip == ON_GET_ADDR {
            // First argument register carries the path string.
            let path_ptr = vm.regs().rdi;
            let mut path = Vec::new();
            let mut at = path_ptr;
            loop {
                let b = vm.read(at, 1)[0];
                if b == 0 || path.len() > 256 {
                    break;
                }
                path.push(b);
                at += 1;
            }
            let body = format!("handled {}", String::from_utf8_lossy(&path));
            return respond(vm, 200, body.as_bytes(), SCRATCH);
        }
        if !self.registered {
            self.registered = true;
            let regs = vm.regs_mut();
            regs.rdi = 1; // ON_GET
            regs.rsi = ON_GET_ADDR;
            return StepResult::Trap(nr::REGISTER_FUNC);
        }
        vm.regs_mut().rdi = INPUTS;
        StepResult::Trap(nr::WAIT_FOR_REQUESTS)
    }

    fn clone_box(&self) -> Box<dyn GuestLogic> {
        Box::new(self.clone())
    }
}

fn driver() -> Arc<EmuVmm> {
    let vmm = EmuVmm::new();
    vmm.register_guest("echo", EchoGuest::default);
    vmm.register_guest("count", CountingGuest::default);
    vmm.register_guest("warm", SlowerEachTimeGuest::default);
    vmm.register_guest("spin", SpinGuest::default);
    vmm.register_guest("storage", StorageGuest::default);
    vmm.register_guest("caller", StorageCaller::default);
    vmm.register_guest("remote", RemoteResponder::default);
    vmm.register_guest("transfer", TransferStorageGuest::default);
    vmm.register_guest("app-v2", || VersionGuest { parked: false, body: "v2" });
    vmm.register_guest("on-get", OnGetGuest::default);
    vmm
}

#[test]
fn get_returns_guest_response() {
    let tenant = make_tenant(driver(), "hello", "echo", |_| {});
    let prog = tenant.current_program().unwrap();

    let resp = dispatch(&tenant, Request::get("/hello"));
    assert_eq!(resp.status, 200);
    assert_eq!(resp.content_type, "text/plain");
    assert_eq!(resp.body, b"Hello World");

    let stats = Arc::clone(prog.pool_items()[0].stats().unwrap());
    assert_eq!(stats.status_2xx.get(), 1);
    assert_eq!(stats.invocations.get(), 1);
    // Conservation: the slot is back in its queue after the dispatch.
    assert_eq!(prog.idle_vm_count(), 1);
    // Ephemeral tenants reset after every request.
    assert_eq!(stats.resets.get(), 1);
}

#[test]
fn post_echo_roundtrip_counts_bytes() {
    let tenant = make_tenant(driver(), "echo", "echo", |_| {});
    let prog = tenant.current_program().unwrap();

    let resp =
        dispatch(&tenant, Request::post("/echo", "text/plain", b"ping".to_vec()));
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"ping");

    let stats = Arc::clone(prog.pool_items()[0].stats().unwrap());
    assert_eq!(stats.input_bytes.get(), 4);
    assert_eq!(stats.output_bytes.get(), 4);
}

#[test]
fn program_refcount_returns_after_dispatch() {
    let tenant = make_tenant(driver(), "refs", "echo", |_| {});
    let prog = tenant.current_program().unwrap();
    let before = Arc::strong_count(&prog);
    let resp = dispatch(&tenant, Request::get("/"));
    assert_eq!(resp.status, 200);
    assert_eq!(Arc::strong_count(&prog), before);
}

#[test]
fn timeout_returns_500_and_recovers() {
    let tenant = make_tenant(driver(), "spin", "spin", |group| {
        group.max_req_time = 0.1;
    });
    let prog = tenant.current_program().unwrap();

    let resp = dispatch(&tenant, Request::get("/spin"));
    assert_eq!(resp.status, 500);
    let stats = Arc::clone(prog.pool_items()[0].stats().unwrap());
    assert_eq!(stats.timeouts.get(), 1);
    assert_eq!(stats.exceptions.get(), 1);

    // The full reset restored the VM; the next request succeeds.
    let resp = dispatch(&tenant, Request::get("/ok"));
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"ok");
    assert!(stats.full_resets.get() >= 1);
}

#[test]
fn storage_call_roundtrips_buffers() {
    let vmm = driver();
    let mut group = TenantGroup::new("compute");
    group.max_concurrency = 1;
    group.has_storage = true;
    group.storage_serialized = true;
    let mut config = TenantConfig::new("store.test", group);
    config.filename =
        write_image("store-req", "caller").to_string_lossy().into_owned();
    config.storage_filename =
        write_image("store-side", "storage").to_string_lossy().into_owned();
    let tenant = TenantInstance::new(config, vmm, &test_logger(), true);
    tenant.ref_program(false).expect("program should initialize");

    let prog = tenant.current_program().unwrap();
    let resp = dispatch(&tenant, Request::get("/call"));
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"hello", "buffer must round-trip byte-for-byte");

    let storage_stats =
        prog.storage().unwrap().main_stats().unwrap();
    assert_eq!(storage_stats.output_bytes.get(), 5);
    assert_eq!(storage_stats.input_bytes.get(), 5);
    assert_eq!(storage_stats.invocations.get(), 1);
    let req_stats = Arc::clone(prog.pool_items()[0].stats().unwrap());
    assert_eq!(req_stats.remote_calls.get(), 1);
}

#[test]
fn concurrent_storage_calls_are_serialized() {
    let vmm = driver();
    let mut group = TenantGroup::new("compute");
    group.max_concurrency = 2;
    group.has_storage = true;
    group.storage_serialized = true;
    let mut config = TenantConfig::new("storeconc.test", group);
    config.filename =
        write_image("storeconc-req", "caller").to_string_lossy().into_owned();
    config.storage_filename = write_image("storeconc-side", "storage")
        .to_string_lossy()
        .into_owned();
    let tenant = TenantInstance::new(config, vmm, &test_logger(), true);
    tenant.ref_program(false).expect("program should initialize");
    let prog = tenant.current_program().unwrap();

    let mut workers = Vec::new();
    for _ in 0..2 {
        let t = Arc::clone(&tenant);
        workers.push(std::thread::spawn(move || {
            dispatch(&t, Request::get("/call"))
        }));
    }
    for worker in workers {
        let resp = worker.join().unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hello");
    }
    let storage_stats = prog.storage().unwrap().main_stats().unwrap();
    assert_eq!(storage_stats.invocations.get(), 2);
    assert_eq!(storage_stats.input_bytes.get(), 10);
    assert_eq!(storage_stats.output_bytes.get(), 10);
}

#[test]
fn reservation_timeout_when_pool_exhausted() {
    let tenant = make_tenant(driver(), "busy", "spin", |group| {
        group.max_req_time = 2.0;
        group.max_queue_time = 0.0;
    });
    let prog = tenant.current_program().unwrap();

    let t2 = Arc::clone(&tenant);
    let slow = std::thread::spawn(move || {
        // Holds the only VM for ~400ms before responding.
        dispatch(&t2, Request::get("/spin"))
    });
    std::thread::sleep(Duration::from_millis(100));

    let resp = dispatch(&tenant, Request::get("/fast"));
    assert_eq!(resp.status, 500);
    assert_eq!(prog.stats.reservation_timeouts.get(), 1);

    let slow_resp = slow.join().unwrap();
    assert_eq!(slow_resp.status, 200);
}

#[test]
fn non_ephemeral_vm_keeps_working_state() {
    let tenant = make_tenant(driver(), "count", "count", |group| {
        group.ephemeral = false;
    });
    let prog = tenant.current_program().unwrap();

    let first = dispatch(&tenant, Request::get("/"));
    let second = dispatch(&tenant, Request::get("/"));
    assert_eq!(first.body, b"count=1");
    assert_eq!(second.body, b"count=2", "state must survive without a reset");
    let stats = Arc::clone(prog.pool_items()[0].stats().unwrap());
    assert_eq!(stats.resets.get(), 0);
}

#[test]
fn ephemeral_vm_forgets_working_state() {
    let tenant = make_tenant(driver(), "wiped", "count", |_| {});
    let first = dispatch(&tenant, Request::get("/"));
    let second = dispatch(&tenant, Request::get("/"));
    assert_eq!(first.body, b"count=1");
    assert_eq!(second.body, b"count=1", "reset must restore the fork source");
}

#[test]
fn too_many_headers_is_rejected_before_resume() {
    let tenant = make_tenant(driver(), "headers", "echo", |_| {});
    let mut req = Request::get("/");
    for i in 0..65 {
        req.headers.push((format!("X-H-{}", i), "v".to_string()));
    }
    assert_eq!(dispatch(&tenant, req).status, 500);

    // At the cap, the request goes through.
    let mut req = Request::get("/");
    for i in 0..64 {
        req.headers.push((format!("X-H-{}", i), "v".to_string()));
    }
    assert_eq!(dispatch(&tenant, req).status, 200);
}

#[test]
fn on_get_handler_takes_priority_over_request_loop() {
    let tenant = make_tenant(driver(), "onget", "on-get", |_| {});
    let resp = dispatch(&tenant, Request::get("/fast-path"));
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"handled /fast-path");
}

#[test]
fn remote_engaged_response_harvests_from_peer() {
    let vmm = driver();
    let mut group = TenantGroup::new("compute");
    group.max_concurrency = 1;
    group.has_storage = true;
    group.storage_1_to_1 = true;
    let mut config = TenantConfig::new("remote.test", group);
    config.filename =
        write_image("remote-req", "remote").to_string_lossy().into_owned();
    config.storage_filename =
        write_image("remote-stor", "storage").to_string_lossy().into_owned();
    let tenant = TenantInstance::new(config, vmm, &test_logger(), true);
    tenant.ref_program(false).expect("program should initialize");

    let resp = dispatch(&tenant, Request::get("/"));
    assert_eq!(resp.status, 200);
    assert_eq!(
        resp.body, b"peer-data",
        "the response body lives in the storage peer's memory"
    );
    assert_eq!(resp.content_type, "text/plain");
}

#[test]
fn live_update_swaps_program() {
    let tenant = make_tenant(driver(), "upd", "echo", |_| {});
    let v1 = tenant.current_program().unwrap();
    assert_eq!(v1.stats.live_updates.get(), 0);

    let result = tenant.live_update(LiveUpdateParams {
        binary: b"emu:app-v2".to_vec(),
        storage_binary: None,
        is_debug: false,
    });
    assert!(result.success, "{}", result.text);

    let v2 = tenant.current_program().unwrap();
    assert!(!Arc::ptr_eq(&v1, &v2));
    assert_eq!(v2.stats.live_updates.get(), 1);

    let resp = dispatch(&tenant, Request::get("/"));
    assert_eq!(resp.body, b"v2");
}

#[test]
fn live_update_transfers_storage_state() {
    let vmm = driver();
    let mut group = TenantGroup::new("compute");
    group.max_concurrency = 1;
    group.has_storage = true;
    let mut config = TenantConfig::new("xfer.test", group);
    config.filename =
        write_image("xfer-req", "echo").to_string_lossy().into_owned();
    config.storage_filename =
        write_image("xfer-stor", "transfer").to_string_lossy().into_owned();
    let tenant =
        TenantInstance::new(config, vmm.clone(), &test_logger(), true);
    tenant.ref_program(false).expect("program should initialize");

    // The replacement ships the same storage program, so both transfer
    // entry points are registered on both sides.
    let storage_image = std::fs::read(write_image("xfer-stor", "transfer"))
        .unwrap();
    let result = tenant.live_update(LiveUpdateParams {
        binary: b"emu:app-v2".to_vec(),
        storage_binary: Some(storage_image),
        is_debug: false,
    });
    assert!(result.success, "{}", result.text);

    let v2 = tenant.current_program().unwrap();
    assert_eq!(v2.stats.live_updates.get(), 1);
    assert_eq!(
        v2.stats.live_update_transfer_bytes.get(),
        8,
        "the serializer reported eight bytes"
    );
}

#[test]
fn warmup_replays_until_improvement_stops() {
    let vmm = driver();
    let tenant = make_tenant(vmm, "warm", "warm", |group| {
        group.ephemeral = false;
        group.warmup = Some(apiary::config::Warmup {
            url: "/warm".to_string(),
            method: "GET".to_string(),
            headers: vec![],
            num_requests: 3,
        });
    });

    // The guest slows down monotonically, so only the first replay improves
    // the best time and warmup ends after `num_requests` stalled replays:
    // four warmup requests total, inherited by the forked VM.
    let resp = dispatch(&tenant, Request::get("/"));
    assert_eq!(resp.body, b"count=5");
}

/// Registers on a mock register file to keep `Registers` in the public API
/// exercised from outside the crate.
#[test]
fn registers_default_is_zeroed() {
    let regs = Registers::default();
    assert_eq!(regs.rip, 0);
    assert_eq!(regs.rax, 0);
}
