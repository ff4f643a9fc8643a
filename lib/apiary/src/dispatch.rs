// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request dispatch.
//!
//! [`dispatch`] is the single synchronous entry point the front end calls:
//! reserve a VM, marshal the HTTP request into guest memory, resume the
//! guest, harvest the response from its registers, release the slot. All
//! failures collapse to a 500 after flagging the VM for a full reset; the
//! reservation guard restores the pool invariants on every path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use slog::{debug, error};
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::config::Warmup;
use crate::instance::{MachineInstance, RunEntry, BACKEND_INPUTS_SIZE};
use crate::program::{ProgramInstance, Reservation};
use crate::state::ProgramEntryIndex;
use crate::stats::ScopedTimer;
use crate::tenant::TenantInstance;
use crate::vmm::{stack_push, stack_push_cstr, MachineError};

/// Headers accepted per request before the dispatch is rejected outright.
pub const MAX_BACKEND_HEADERS: usize = 64;

/// Budget for driving a remote-engaged VM back out of its peer.
pub const REMOTE_RETURN_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest response body the harvester will copy out of a guest.
const MAX_RESPONSE_BODY: u64 = 1 << 30;

/// An HTTP request as seen by the engine.
#[derive(Clone, Debug, Default)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self { method: "GET".to_string(), path: path.into(), ..Default::default() }
    }

    pub fn post(
        path: impl Into<String>,
        content_type: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            method: "POST".to_string(),
            path: path.into(),
            headers: vec![("Content-Type".to_string(), content_type.into())],
            body,
            ..Default::default()
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> &str {
        self.header("Content-Type").unwrap_or("")
    }
}

/// An HTTP response as produced by a guest.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl Response {
    pub fn server_error() -> Self {
        Self {
            status: 500,
            content_type: "text/plain".to_string(),
            body: Vec::new(),
        }
    }
}

/// Every way a dispatch can fail. Only a 500 ever reaches the client.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no program loaded")]
    NoProgram,

    #[error("no idle VM within the queue timeout")]
    ReservationTimeout,

    #[error("vm timed out after {0}s")]
    Timeout(f64),

    #[error("guest fault: {0}")]
    GuestFault(String),

    #[error("response contract violated: {0}")]
    ContractViolation(&'static str),

    #[error("too many headers ({0})")]
    TooManyHeaders(usize),

    #[error("request vm stuck in remote execution")]
    RemoteStuck,

    #[error("vm slot is empty")]
    NoVm,
}

impl From<MachineError> for DispatchError {
    fn from(e: MachineError) -> Self {
        match e {
            MachineError::Timeout { seconds } => {
                DispatchError::Timeout(seconds)
            }
            other => DispatchError::GuestFault(other.to_string()),
        }
    }
}

/// Byte-exact request-inputs struct copied to the guest before resume.
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct BackendInputs {
    pub method: u64,
    pub url: u64,
    pub arg: u64,
    pub ctype: u64,
    pub method_len: u16,
    pub url_len: u16,
    pub arg_len: u16,
    pub ctype_len: u16,
    /// Body pointer; zero for an empty body.
    pub data: u64,
    pub data_len: u64,
    pub g_headers: u64,
    pub num_headers: u16,
    /// Bit 0 set marks a warmup request.
    pub info_flags: u16,
    pub reqid: u16,
    pub reserved0: u16,
    pub prng: [u64; 2],
    pub reserved1: [u64; 2],
}

/// One header line in guest memory: `"Name: Value"`, NUL-terminated.
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct BackendHeader {
    pub field: u64,
    pub colon: u32,
    pub field_len: u32,
}

/// Dispatches one request against a tenant, reserving a VM from its pool.
pub fn dispatch(tenant: &TenantInstance, req: Request) -> Response {
    let resv = match tenant.vmreserve(false) {
        Some(resv) => resv,
        None => return Response::server_error(),
    };
    let req = Arc::new(req);
    match serve(&resv, &req) {
        Ok(resp) => resp,
        Err(e) => {
            fail(&resv, &e);
            Response::server_error()
        }
    }
    // The reservation guard drops here, resetting and re-enqueueing the
    // slot on every path.
}

/// A request-VM slot pinned to one front-end worker; used when the runtime
/// runs without per-request reservations. A tenant or program change
/// releases the slot and reserves from the new owner.
#[derive(Default)]
pub struct WorkerSlot {
    resv: Option<Reservation>,
}

impl WorkerSlot {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Dispatches one request using a worker-pinned slot.
pub fn dispatch_pinned(
    slot: &mut WorkerSlot,
    tenant: &TenantInstance,
    req: Request,
) -> Response {
    if let Some(resv) = &slot.resv {
        let stale = resv.program().config().name != tenant.config.name
            || !tenant
                .current_program()
                .map(|p| Arc::ptr_eq(&p, resv.program()))
                .unwrap_or(false);
        if stale {
            slot.resv = None;
        }
    }
    if slot.resv.is_none() {
        slot.resv = tenant.vmreserve(false);
    }
    let resv = match slot.resv.as_ref() {
        Some(resv) => resv,
        None => return Response::server_error(),
    };

    let req = Arc::new(req);
    match serve(resv, &req) {
        Ok(resp) => {
            let prog = Arc::clone(resv.program());
            prog.reset_slot_in_place(resv.slot());
            resp
        }
        Err(e) => {
            fail(resv, &e);
            slot.resv = None;
            Response::server_error()
        }
    }
}

/// Runs the guest for a reserved slot and harvests its response. The
/// request handling itself executes on the slot's bound worker thread.
fn serve(
    resv: &Reservation,
    req: &Arc<Request>,
) -> Result<Response, DispatchError> {
    let slot = Arc::clone(resv.slot());
    let prog = Arc::clone(resv.program());
    let req = Arc::clone(req);
    let task = resv.slot().worker.enqueue(
        move || -> Result<(), DispatchError> {
            let mut guard = slot.inst.lock().unwrap();
            let inst = guard.as_mut().ok_or(DispatchError::NoVm)?;
            let ephemeral = inst.is_ephemeral();
            handle_request(inst, &prog, &req, ephemeral, false)
        },
    );
    task.wait()
        .map_err(|_| DispatchError::GuestFault("vm worker died".to_string()))??;

    harvest(resv)
}

/// Runs the guest's handler for one request. Used by live dispatch and by
/// warmup replay (which sets the warmup flag and never harvests).
pub(crate) fn handle_request(
    inst: &mut MachineInstance,
    prog: &ProgramInstance,
    req: &Request,
    ephemeral: bool,
    warmup: bool,
) -> Result<(), DispatchError> {
    let inst_stats = inst.stats().clone();
    let _cpu = ScopedTimer::new(&inst_stats.request_cpu_time);
    inst.stats().invocations.inc();
    inst.begin_call();
    let timeout = inst.config().max_req_time(false);

    let on_get = prog.entry_at(ProgramEntryIndex::OnGet);
    let on_post = prog.entry_at(ProgramEntryIndex::OnPost);

    if req.method == "GET" && on_get != 0 {
        let mut sp = inst.machine().stack_address();
        let m = inst.machine_mut();
        let path = stack_push_cstr(m, &mut sp, &req.path)?;
        let arg = stack_push_cstr(m, &mut sp, &req.query)?;
        inst.run_guest(
            prog,
            RunEntry::Call {
                addr: on_get,
                stack: sp,
                args: vec![path, arg],
            },
            timeout,
        )?;
    } else if req.method == "POST" && on_post != 0 {
        let body_addr = inst.allocate_post_data(req.body.len() as u64)?;
        inst.machine_mut().copy_to_guest(body_addr, &req.body)?;
        inst.stats().input_bytes.add(req.body.len() as u64);

        let mut sp = inst.machine().stack_address();
        let m = inst.machine_mut();
        let path = stack_push_cstr(m, &mut sp, &req.path)?;
        let arg = stack_push_cstr(m, &mut sp, &req.query)?;
        let ctype = stack_push_cstr(m, &mut sp, req.content_type())?;
        inst.run_guest(
            prog,
            RunEntry::Call {
                addr: on_post,
                stack: sp,
                args: vec![
                    path,
                    arg,
                    ctype,
                    body_addr,
                    req.body.len() as u64,
                ],
            },
            timeout,
        )?;
    } else {
        // Event-driven program: hand it a BackendInputs struct and resume
        // its request loop.
        if !ephemeral && !inst.is_waiting_for_requests() {
            inst.run_guest(prog, RunEntry::Resume, Duration::from_secs(1))?;
            if !inst.is_waiting_for_requests() {
                return Err(DispatchError::GuestFault(
                    "vm did not return to its request loop".to_string(),
                ));
            }
        }
        fill_backend_inputs(inst, req, warmup)?;
        inst.run_guest(prog, RunEntry::Resume, timeout)?;
        if !ephemeral {
            let mut regs = inst.machine().registers();
            regs.rip += 2;
            inst.machine_mut().set_registers(regs);
            inst.reset_wait_for_requests();
        }
    }
    Ok(())
}

/// Marshals the request into the VM's persistent inputs stack and points
/// the guest's waiting argument register at the struct.
fn fill_backend_inputs(
    inst: &mut MachineInstance,
    req: &Request,
    warmup: bool,
) -> Result<(), DispatchError> {
    if req.headers.len() > MAX_BACKEND_HEADERS {
        return Err(DispatchError::TooManyHeaders(req.headers.len()));
    }
    if inst.inputs_allocation() == 0 {
        let base = inst.machine_mut().mmap_allocate(BACKEND_INPUTS_SIZE)?;
        inst.set_inputs_allocation(base + BACKEND_INPUTS_SIZE);
    }
    let stack_floor = inst.inputs_allocation() - BACKEND_INPUTS_SIZE;
    let mut sp = inst.inputs_allocation();
    let mut inputs = BackendInputs::new_zeroed();

    {
        let m = inst.machine_mut();
        inputs.method_len = req.method.len() as u16;
        inputs.method = stack_push_cstr(m, &mut sp, &req.method)?;
        inputs.url_len = req.path.len() as u16;
        inputs.url = stack_push_cstr(m, &mut sp, &req.path)?;
        inputs.arg_len = req.query.len() as u16;
        inputs.arg = stack_push_cstr(m, &mut sp, &req.query)?;
    }

    if !req.body.is_empty() {
        let ctype = req.content_type().to_string();
        let m = inst.machine_mut();
        inputs.ctype_len = ctype.len() as u16;
        inputs.ctype = stack_push_cstr(m, &mut sp, &ctype)?;
        inputs.data = stack_push(m, &mut sp, &req.body)?;
        inputs.data_len = req.body.len() as u64;
        inst.stats().input_bytes.add(req.body.len() as u64);
    } else {
        // Guarantee a readable string: the URL's own terminator.
        inputs.ctype = inputs.url + u64::from(inputs.url_len);
        inputs.ctype_len = 0;
        inputs.data = 0;
        inputs.data_len = 0;
    }

    if req.headers.is_empty() {
        inputs.g_headers = 0;
        inputs.num_headers = 0;
    } else {
        let mut fields = Vec::with_capacity(req.headers.len());
        for (name, value) in &req.headers {
            let line = format!("{}: {}", name, value);
            let m = inst.machine_mut();
            let field = stack_push_cstr(m, &mut sp, &line)?;
            fields.push(BackendHeader {
                field,
                colon: name.len() as u32,
                field_len: line.len() as u32,
            });
        }
        let m = inst.machine_mut();
        inputs.g_headers =
            stack_push(m, &mut sp, fields.as_slice().as_bytes())?;
        inputs.num_headers = req.headers.len() as u16;
    }

    if sp < stack_floor {
        return Err(DispatchError::GuestFault(
            "request inputs exceed the marshaling stack".to_string(),
        ));
    }

    inputs.reqid = inst.request_id();
    inputs.info_flags = warmup as u16;
    inputs.prng = inst.draw_prng();

    // The guest left the destination address in the request-ABI argument
    // register when it parked itself.
    let dst = inst.machine().registers().rdi;
    inst.machine_mut().copy_to_guest(dst, inputs.as_bytes())?;
    Ok(())
}

/// Reads the response out of the VM that emitted it. A remote-engaged VM
/// delivered its response from the storage peer's address space.
fn harvest(resv: &Reservation) -> Result<Response, DispatchError> {
    let prog = resv.program();
    let mut guard = resv.slot().inst.lock().unwrap();
    let inst = guard.as_mut().ok_or(DispatchError::NoVm)?;

    if !inst.response_called(1) {
        return Err(DispatchError::ContractViolation(
            "no response emitted; program crashed?",
        ));
    }
    let regs = inst.machine().registers();
    let status = regs.rdi as u16;
    let ctype_len = regs.rdx & 0xFFFF;
    let body_len = regs.r8;
    if body_len > MAX_RESPONSE_BODY {
        return Err(DispatchError::ContractViolation("response body too large"));
    }

    let (content_type, body) = if inst.machine().is_remote_connected() {
        let peer = inst
            .machine()
            .remote()
            .ok_or(DispatchError::RemoteStuck)?;
        prog.with_storage_vm(peer, |vm| -> Result<_, MachineError> {
            let ctype = vm.machine().buffer_to_string(regs.rsi, ctype_len)?;
            let body = vm.machine().copy_from_guest(regs.rcx, body_len)?;
            Ok((ctype, body))
        })
        .ok_or(DispatchError::RemoteStuck)??
    } else {
        let ctype = inst.machine().buffer_to_string(regs.rsi, ctype_len)?;
        let body = inst.machine().copy_from_guest(regs.rcx, body_len)?;
        (ctype, body)
    };

    inst.stats().output_bytes.add(body.len() as u64);
    inst.stats().count_status(status);

    // Drive the remote call to completion so the peer's stack unwinds; a
    // connection that stays engaged forces a full reset.
    if inst.machine().is_remote_connected() {
        let done = inst
            .machine_mut()
            .remote_return(REMOTE_RETURN_TIMEOUT)
            .is_ok();
        if !done || inst.machine().is_remote_connected() {
            inst.reset_needed_now();
        }
    }

    Ok(Response { status, content_type, body })
}

/// Error accounting and reset flagging shared by every failure path.
fn fail(resv: &Reservation, err: &DispatchError) {
    let mut guard = resv.slot().inst.lock().unwrap();
    if let Some(inst) = guard.as_mut() {
        if matches!(err, DispatchError::Timeout(_)) {
            inst.stats().timeouts.inc();
        }
        inst.stats().exceptions.inc();
        inst.reset_needed_now();
        let rip = inst.machine().registers().rip;
        error!(inst.log(), "request failed";
            "error" => %err,
            "frame" => format!("[0] {:#010x}", rip));
    }
}

/// Replays the configured warmup request against the main VM before it is
/// frozen as the fork source.
pub(crate) fn run_warmup(
    inst: &mut MachineInstance,
    prog: &ProgramInstance,
    warmup: &Warmup,
) -> Result<(), DispatchError> {
    if warmup.num_requests == 0 {
        return Ok(());
    }
    let mut req = Request {
        method: if warmup.method.is_empty() {
            "GET".to_string()
        } else {
            warmup.method.to_uppercase()
        },
        path: warmup.url.clone(),
        ..Default::default()
    };
    req.headers
        .push(("User-Agent".to_string(), "apiary/1.0".to_string()));
    for line in &warmup.headers {
        let (name, value) = line.split_once(':').ok_or_else(|| {
            DispatchError::GuestFault("invalid warmup header".to_string())
        })?;
        let value = value.trim();
        if value.is_empty() {
            return Err(DispatchError::GuestFault(
                "invalid warmup header".to_string(),
            ));
        }
        req.headers.push((name.to_string(), value.to_string()));
    }

    let event_driven = !(req.method == "GET"
        && prog.entry_at(ProgramEntryIndex::OnGet) != 0)
        && !(req.method == "POST"
            && prog.entry_at(ProgramEntryIndex::OnPost) != 0);

    // Replay while the handler keeps getting faster: a run that beats the
    // best time resets the stall counter, and `num_requests` consecutive
    // runs without improvement end the warmup.
    let mut best: Option<Duration> = None;
    let mut stalled = 0usize;
    let mut replays = 0u64;
    while stalled < warmup.num_requests {
        let t0 = Instant::now();
        handle_request(inst, prog, &req, false, true)?;
        let elapsed = t0.elapsed();
        replays += 1;
        if best.map(|b| elapsed < b).unwrap_or(true) {
            best = Some(elapsed);
            stalled = 0;
        } else {
            stalled += 1;
        }
    }

    if event_driven {
        // Park the VM back at its request loop before it becomes the fork
        // source.
        inst.run_guest(prog, RunEntry::Resume, Duration::from_secs(1))?;
        if !inst.is_waiting_for_requests() {
            return Err(DispatchError::GuestFault(
                "vm did not wait for requests after warmup".to_string(),
            ));
        }
        let mut regs = inst.machine().registers();
        regs.rip += 2;
        inst.machine_mut().set_registers(regs);
    }

    debug!(inst.log(), "warmup complete";
        "requests" => replays,
        "best_us" => best.map(|b| b.as_micros() as u64).unwrap_or(0));
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backend_inputs_layout() {
        // Offsets are guest ABI and must never drift.
        assert_eq!(std::mem::size_of::<BackendInputs>(), 104);
        assert_eq!(std::mem::size_of::<BackendHeader>(), 16);
        let mut v = BackendInputs::new_zeroed();
        v.method = 0x1111;
        v.data_len = 0x2222;
        v.reqid = 7;
        let bytes = v.as_bytes();
        assert_eq!(&bytes[0..8], &0x1111u64.to_le_bytes());
        assert_eq!(&bytes[48..56], &0x2222u64.to_le_bytes());
        assert_eq!(&bytes[68..70], &7u16.to_le_bytes());
    }

    #[test]
    fn request_helpers() {
        let req = Request::post("/echo", "text/plain", b"ping".to_vec());
        assert_eq!(req.content_type(), "text/plain");
        assert_eq!(req.header("content-type"), Some("text/plain"));
        assert_eq!(req.header("x-missing"), None);
    }
}
