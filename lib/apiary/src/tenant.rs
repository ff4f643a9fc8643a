// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live tenant state.
//!
//! A `TenantInstance` holds the hot-swappable pointer to the tenant's
//! current program (and, separately, its debug program). Both can be
//! replaced during execution at any time; in-flight requests keep the old
//! program alive through their reservations until they complete.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{json, Map, Value};
use slog::{error, info, o, warn, Logger};

use crate::binary::BinaryStorage;
use crate::config::TenantConfig;
use crate::program::{ProgramInstance, Reservation};
use crate::state::ProgramEntryIndex;
use crate::stats::MachineStatsSnapshot;
use crate::update::{file_writer, http_date, LiveUpdateParams, LiveUpdateResult};
use crate::vmm::Vmm;

pub struct TenantInstance {
    pub config: Arc<TenantConfig>,
    vmm: Arc<dyn Vmm>,
    log: Logger,
    program: RwLock<Option<Arc<ProgramInstance>>>,
    debug_program: RwLock<Option<Arc<ProgramInstance>>>,
    started_init: AtomicBool,
    init_lock: Mutex<()>,
}

impl TenantInstance {
    pub fn new(
        config: TenantConfig,
        vmm: Arc<dyn Vmm>,
        log: &Logger,
        start_initialize: bool,
    ) -> Arc<Self> {
        let log = log.new(o!("tenant" => config.name.clone()));
        let this = Arc::new(Self {
            config: Arc::new(config),
            vmm,
            log,
            program: RwLock::new(None),
            debug_program: RwLock::new(None),
            started_init: AtomicBool::new(false),
            init_lock: Mutex::new(()),
        });
        if start_initialize {
            this.begin_initialize();
        }
        this
    }

    /// Loads and boots the configured program. Called once; later requests
    /// reuse the stored program until a live update or reload.
    pub fn begin_initialize(&self) {
        if self.started_init.swap(true, Ordering::AcqRel) {
            info!(self.log, "program was already initialized");
            return;
        }

        let loaded = if !self.config.uri.is_empty() {
            self.fetch_program()
        } else if self.config.filename.is_empty() {
            warn!(self.log, "no filename configured; send a new program");
            return;
        } else {
            match BinaryStorage::from_file(&self.config.filename) {
                Ok(binary) => {
                    let storage = self.local_storage_binary();
                    Ok((binary, storage))
                }
                Err(e) => {
                    warn!(self.log, "missing program or invalid path";
                        "filename" => %self.config.filename, "error" => %e);
                    return;
                }
            }
        };

        match loaded {
            Ok((binary, storage_binary)) => {
                match ProgramInstance::new(
                    binary,
                    storage_binary,
                    Arc::clone(&self.config),
                    Arc::clone(&self.vmm),
                    &self.log,
                    false,
                ) {
                    Ok(prog) => {
                        *self.program.write().unwrap() = Some(prog);
                    }
                    Err(e) => {
                        error!(self.log, "exception when creating machine";
                            "error" => %e);
                    }
                }
            }
            Err(e) => {
                error!(self.log, "program fetch failed"; "error" => e);
            }
        }
    }

    fn local_storage_binary(&self) -> BinaryStorage {
        let path = self.config.storage_program_filename();
        if path != self.config.filename {
            if let Ok(binary) = BinaryStorage::from_file(path) {
                return binary;
            }
        }
        BinaryStorage::default()
    }

    /// Fetches the program image over HTTP, preferring the locally cached
    /// file when the remote answers 304.
    fn fetch_program(&self) -> Result<(BinaryStorage, BinaryStorage), String> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|e| e.to_string())?;
        let mut request = client.get(&self.config.uri);
        let local_mtime = std::fs::metadata(&self.config.filename)
            .and_then(|m| m.modified())
            .ok();
        if let Some(mtime) = local_mtime {
            request = request.header("If-Modified-Since", http_date(mtime));
        }
        let response = request.send().map_err(|e| e.to_string())?;
        match response.status().as_u16() {
            304 => {
                let binary = BinaryStorage::from_file(&self.config.filename)
                    .map_err(|e| e.to_string())?;
                Ok((binary, self.local_storage_binary()))
            }
            200 => {
                let bytes =
                    response.bytes().map_err(|e| e.to_string())?.to_vec();
                // Cache the fetched image; a failed write only costs the
                // next fetch.
                if !self.config.filename.is_empty() {
                    file_writer(&self.config.filename, &bytes);
                }
                Ok((BinaryStorage::new(bytes), BinaryStorage::default()))
            }
            status => Err(format!(
                "fetching program failed with status {} from {}",
                status, self.config.uri
            )),
        }
    }

    /// Takes a reference to the current (or debug) program, lazily
    /// initializing it on first use, and waits for it to become servable.
    pub fn ref_program(&self, debug: bool) -> Option<Arc<ProgramInstance>> {
        let slot = if debug { &self.debug_program } else { &self.program };
        let mut prog = slot.read().unwrap().clone();
        if prog.is_none() {
            if debug {
                return None;
            }
            // One thread initializes; the rest wait behind the same lock.
            let _guard = self.init_lock.lock().unwrap();
            if !self.started_init.load(Ordering::Acquire) {
                self.begin_initialize();
            }
            prog = slot.read().unwrap().clone();
        }
        let prog = match prog {
            Some(prog) => prog,
            None => {
                warn!(self.log, "missing program; not uploaded?");
                return None;
            }
        };
        match prog.wait_for_initialization() {
            Ok(()) => Some(prog),
            Err(e) => {
                warn!(self.log, "program unavailable"; "error" => %e);
                None
            }
        }
    }

    pub fn current_program(&self) -> Option<Arc<ProgramInstance>> {
        self.program.read().unwrap().clone()
    }

    /// Obtains exclusive use of one request VM.
    pub fn vmreserve(&self, debug: bool) -> Option<Reservation> {
        let prog = self.ref_program(debug)?;
        match prog.reserve_vm() {
            Ok(resv) => Some(resv),
            Err(e) => {
                warn!(self.log, "vm reservation failed"; "error" => %e);
                None
            }
        }
    }

    /// Replaces the running program with a newly posted image. The old
    /// program's storage state is transferred when both sides cooperate.
    pub fn live_update(&self, params: LiveUpdateParams) -> LiveUpdateResult {
        if params.binary.is_empty() {
            return LiveUpdateResult::fail("Empty file received");
        }
        let binary = BinaryStorage::new(params.binary);
        let storage_binary = params
            .storage_binary
            .map(BinaryStorage::new)
            .unwrap_or_else(|| binary.clone());
        let prog = match ProgramInstance::new(
            binary.clone(),
            storage_binary,
            Arc::clone(&self.config),
            Arc::clone(&self.vmm),
            &self.log,
            params.is_debug,
        ) {
            Ok(prog) => prog,
            Err(e) => return LiveUpdateResult::fail(e.to_string()),
        };
        if let Err(e) = prog.wait_for_initialization() {
            return LiveUpdateResult::fail(e.to_string());
        }
        self.commit_program_live(&prog, params.is_debug);

        // Persist non-debug updates next to the configured filename.
        let filename = self.config.request_program_filename();
        if !params.is_debug && !filename.is_empty() {
            if !filename.starts_with('/') || filename.contains("://") {
                return LiveUpdateResult::ok("Update successful (not stored)");
            }
            if !file_writer(filename, binary.as_bytes()) {
                return LiveUpdateResult::ok(format!(
                    "Update successful, but could not persist to '{}'",
                    filename
                ));
            }
            return LiveUpdateResult::ok("Update successful (stored)");
        }
        LiveUpdateResult::ok("Update successful (not stored)")
    }

    /// Atomically publishes `new_prog` as the tenant's current program.
    pub fn commit_program_live(
        &self,
        new_prog: &Arc<ProgramInstance>,
        debug: bool,
    ) {
        let slot = if debug { &self.debug_program } else { &self.program };
        let current = slot.read().unwrap().clone();
        if let Some(current) = &current {
            self.serialize_storage_state(current, new_prog);
        }
        let updates = current
            .map(|prev| prev.stats.live_updates.get())
            .unwrap_or(0);
        new_prog.stats.live_updates.set(updates + 1);
        *slot.write().unwrap() = Some(Arc::clone(new_prog));
    }

    /// Transfers serialized storage state between two programs when both
    /// registered the transfer entry points.
    pub fn serialize_storage_state(
        &self,
        old: &Arc<ProgramInstance>,
        new: &Arc<ProgramInstance>,
    ) {
        let serialize = old.entry_at(ProgramEntryIndex::LiveupdSerialize);
        if serialize == 0 {
            info!(self.log, "live-update skipped (old program lacks serializer)");
            return;
        }
        let deserialize = new.entry_at(ProgramEntryIndex::LiveupdDeserialize);
        if deserialize == 0 {
            info!(self.log,
                "live-update deserialization skipped (new program lacks restorer)");
            return;
        }
        info!(self.log, "live-update serialization will be performed");
        let transferred = old.live_update_call(serialize, new, deserialize);
        if transferred >= 0 {
            new.stats.live_update_transfer_bytes.set(transferred as u64);
            info!(self.log, "storage state transferred";
                "bytes" => transferred);
        } else {
            warn!(self.log, "storage state transfer failed");
        }
    }

    /// Unloads the current program so the next request reinitializes it,
    /// transferring storage state into the replacement when possible.
    pub fn reload_program_live(&self, debug: bool) {
        let slot = if debug { &self.debug_program } else { &self.program };
        let old = slot.write().unwrap().take();
        self.started_init.store(false, Ordering::Release);

        // Nothing to carry over unless the old program had storage.
        let old = match old {
            Some(old) if old.has_storage() => old,
            _ => return,
        };
        if let Some(new_prog) = self.ref_program(debug) {
            self.serialize_storage_state(&old, &new_prog);
        }
    }

    /// Appends this tenant's statistics document under its name.
    pub fn gather_stats(&self, root: &mut Map<String, Value>) {
        let prog = match self.current_program() {
            Some(prog) => prog,
            None => return,
        };
        let mut obj = Map::new();

        if let Some(storage) = prog.storage() {
            let mut machines = Vec::new();
            let mut totals = MachineStatsSnapshot::default();
            if let Some(stats) = storage.main_stats() {
                let snap = stats.snapshot();
                totals += snap;
                machines.push(serde_json::to_value(snap).unwrap_or(Value::Null));
            }
            obj.insert(
                "storage".to_string(),
                json!({
                    "machines": machines,
                    "totals": serde_json::to_value(totals)
                        .unwrap_or(Value::Null),
                    "tasks_inschedule": storage.queued_tasks(),
                }),
            );
        }

        let items = prog.pool_items();
        let mut machines = Vec::new();
        let mut totals = MachineStatsSnapshot::default();
        let mut distribution = Vec::new();
        let mut reservation_time = 0.0f64;
        for item in &items {
            if let Some(stats) = item.stats() {
                let snap = stats.snapshot();
                distribution.push(snap.invocations);
                reservation_time += snap.reservation_time;
                totals += snap;
                machines.push(serde_json::to_value(snap).unwrap_or(Value::Null));
            }
        }
        let mut totals_json =
            serde_json::to_value(totals).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut totals_json {
            map.insert(
                "distribution_requests".to_string(),
                json!(distribution),
            );
            map.insert("num_machines".to_string(), json!(items.len()));
        }
        obj.insert(
            "request".to_string(),
            json!({ "machines": machines, "totals": totals_json }),
        );

        obj.insert(
            "program".to_string(),
            json!({
                "binary_type": prog
                    .binary_type()
                    .map(|t| t.as_str())
                    .unwrap_or("unknown"),
                "binary_size": prog.request_binary.len(),
                "entry_points": {
                    "on_get": prog.entry_at(ProgramEntryIndex::OnGet),
                    "on_post": prog.entry_at(ProgramEntryIndex::OnPost),
                    "on_method": prog.entry_at(ProgramEntryIndex::OnMethod),
                    "on_stream": prog.entry_at(ProgramEntryIndex::OnStreamPost),
                    "on_error": prog.entry_at(ProgramEntryIndex::OnError),
                    "live_update_serialize":
                        prog.entry_at(ProgramEntryIndex::LiveupdSerialize),
                    "live_update_deserialize":
                        prog.entry_at(ProgramEntryIndex::LiveupdDeserialize),
                    "socket_pause_resume_api":
                        prog.entry_at(ProgramEntryIndex::SocketPauseResumeApi),
                },
                "live_updates": prog.stats.live_updates.get(),
                "live_update_transfer_bytes":
                    prog.stats.live_update_transfer_bytes.get(),
                "reservation_time": reservation_time,
                "reservation_timeouts":
                    prog.stats.reservation_timeouts.get(),
            }),
        );

        root.insert(self.config.name.clone(), Value::Object(obj));
    }
}
