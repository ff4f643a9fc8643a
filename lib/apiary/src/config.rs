// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tenant configuration.
//!
//! The configuration file is JSON with comments. Top-level objects either
//! describe *groups* (defaults shared by many tenants) or *tenants* (any
//! object containing `group`, `filename` or `uri`). Tenant-level keys
//! override the keys of the group the tenant names. `$HOME` and `$PWD` are
//! substituted in path-valued strings.

use std::time::Duration;

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::vmm::VirtualRemapping;

const MIB: u64 = 1048576;

/// Virtual filename guests use to reach their per-tenant state file.
pub const GUEST_STATE_FILE: &str = "state";

/// Virtual filename guests use to reach the guest support library.
pub const GUEST_LIBRARY_FILE: &str = "./libapiary.so";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config key '{key}': {msg}")]
    Invalid { key: String, msg: String },

    #[error("tenant '{0}' names unknown group '{1}'")]
    UnknownGroup(String, String),

    #[error("tenant '{0}' has neither filename nor uri")]
    Unreachable(String),

    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
}

fn invalid(key: &str, msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { key: key.to_string(), msg: msg.into() }
}

/// One entry of the guest filesystem view.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VirtualPath {
    pub real: String,
    pub virt: String,
    pub writable: bool,
    pub symlink: bool,
    pub prefix: bool,
}

/// A synthetic request replayed against the main VM during initialization.
#[derive(Clone, Debug, PartialEq)]
pub struct Warmup {
    pub url: String,
    pub method: String,
    pub headers: Vec<String>,
    pub num_requests: usize,
}

impl Default for Warmup {
    fn default() -> Self {
        Self {
            url: "/".to_string(),
            method: "GET".to_string(),
            headers: Vec::new(),
            num_requests: 20,
        }
    }
}

/// Settings shared by every tenant in a group. Every field can also be set
/// directly on a tenant, which then shadows the group value.
#[derive(Clone, Debug, PartialEq)]
pub struct TenantGroup {
    pub name: String,

    pub max_boot_time: f64,
    pub max_req_time: f64,
    pub max_storage_time: f64,
    pub max_queue_time: f64,

    pub max_main_memory: u64,
    pub max_address_space: u64,
    pub max_req_memory: u64,
    pub limit_req_memory: u64,
    pub max_storage_memory: u64,
    pub shared_memory: u64,

    pub max_concurrency: usize,
    pub double_buffered: bool,

    pub has_storage: bool,
    pub storage_1_to_1: bool,
    pub storage_perm_remote: bool,
    pub storage_serialized: bool,

    pub hugepages: bool,
    pub hugepage_arena_size: u64,
    pub hugepage_requests_arena: u64,
    pub split_hugepages: bool,
    pub transparent_hugepages: bool,

    pub print_stdout: bool,
    pub max_smp: usize,
    pub allow_debug: bool,
    pub remote_debug_on_exception: bool,

    pub control_ephemeral: bool,
    pub ephemeral: bool,
    pub ephemeral_keep_working_memory: bool,

    pub main_arguments: Vec<String>,
    pub storage_arguments: Vec<String>,
    pub environ: Vec<String>,

    pub vmem_remappings: Vec<VirtualRemapping>,
    pub storage_remappings: Vec<VirtualRemapping>,
    pub vmem_heap_executable: bool,

    pub allowed_paths: Vec<VirtualPath>,
    pub current_working_directory: String,

    pub dylink_address_hint: u64,
    pub storage_dylink_address_hint: u64,
    pub heap_address_hint: u64,
    pub cold_start_file: String,

    pub warmup: Option<Warmup>,

    pub verbose: bool,
    pub verbose_syscalls: bool,
    pub verbose_pagetables: bool,
    pub profiling_interval: usize,

    /// Host path substituted for [`GUEST_LIBRARY_FILE`]; set from server
    /// settings, not from the config file.
    pub guest_library_path: String,
}

impl TenantGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_boot_time: 16.0,
            max_req_time: 8.0,
            max_storage_time: 8.0,
            max_queue_time: 10.0,
            max_main_memory: 1024 * MIB,
            max_address_space: 4096 * MIB,
            max_req_memory: 128 * MIB,
            limit_req_memory: 0,
            max_storage_memory: 1024 * MIB,
            shared_memory: 0,
            max_concurrency: 1,
            double_buffered: false,
            has_storage: false,
            storage_1_to_1: false,
            storage_perm_remote: false,
            storage_serialized: false,
            hugepages: false,
            hugepage_arena_size: 0,
            hugepage_requests_arena: 0,
            split_hugepages: false,
            transparent_hugepages: false,
            print_stdout: false,
            max_smp: 0,
            allow_debug: false,
            remote_debug_on_exception: false,
            control_ephemeral: false,
            ephemeral: true,
            ephemeral_keep_working_memory: false,
            main_arguments: Vec::new(),
            storage_arguments: Vec::new(),
            environ: Vec::new(),
            vmem_remappings: Vec::new(),
            storage_remappings: Vec::new(),
            vmem_heap_executable: false,
            allowed_paths: Vec::new(),
            current_working_directory: "/".to_string(),
            dylink_address_hint: 0,
            storage_dylink_address_hint: 0,
            heap_address_hint: 0,
            cold_start_file: String::new(),
            warmup: None,
            verbose: false,
            verbose_syscalls: false,
            verbose_pagetables: false,
            profiling_interval: 0,
            guest_library_path: String::new(),
        }
    }
}

/// A fully-resolved tenant definition.
#[derive(Clone, Debug, PartialEq)]
pub struct TenantConfig {
    pub name: String,
    pub group: TenantGroup,
    pub filename: String,
    pub storage_filename: String,
    pub key: String,
    pub uri: String,
    /// The single host file the guest may write through the virtual
    /// [`GUEST_STATE_FILE`] path.
    pub allowed_file: String,
    /// Initialize eagerly at load time.
    pub start: bool,
}

impl TenantConfig {
    pub fn new(name: impl Into<String>, group: TenantGroup) -> Self {
        let name = name.into();
        Self {
            name,
            group,
            filename: String::new(),
            storage_filename: String::new(),
            key: String::new(),
            uri: String::new(),
            allowed_file: String::new(),
            start: false,
        }
    }

    pub fn max_boot_time(&self) -> Duration {
        Duration::from_secs_f64(self.group.max_boot_time)
    }

    pub fn max_req_time(&self, debug: bool) -> Duration {
        if debug {
            // Debugging sessions hold the VM for as long as the human needs.
            Duration::from_secs(3600)
        } else {
            Duration::from_secs_f64(self.group.max_req_time)
        }
    }

    pub fn max_storage_time(&self) -> Duration {
        Duration::from_secs_f64(self.group.max_storage_time)
    }

    pub fn max_queue_time(&self) -> Duration {
        Duration::from_secs_f64(self.group.max_queue_time)
    }

    pub fn max_main_memory(&self) -> u64 {
        self.group.max_main_memory
    }

    pub fn max_address(&self) -> u64 {
        self.group.max_address_space
    }

    pub fn max_req_memory(&self) -> u64 {
        self.group.max_req_memory
    }

    pub fn limit_req_memory(&self) -> u64 {
        self.group.limit_req_memory
    }

    pub fn max_storage_memory(&self) -> u64 {
        self.group.max_storage_memory
    }

    pub fn has_storage(&self) -> bool {
        self.group.has_storage
    }

    pub fn request_program_filename(&self) -> &str {
        &self.filename
    }

    pub fn storage_program_filename(&self) -> &str {
        if self.storage_filename.is_empty() {
            &self.filename
        } else {
            &self.storage_filename
        }
    }

    /// Rewrites a guest-visible path opened for reading to its host path.
    pub fn open_readable(&self, path: &str) -> Option<String> {
        for vp in &self.group.allowed_paths {
            if !vp.prefix && vp.virt == path {
                return Some(vp.real.clone());
            }
            if vp.prefix && path.starts_with(&vp.virt) {
                return Some(format!("{}{}", vp.real, &path[vp.virt.len()..]));
            }
        }
        if path == GUEST_LIBRARY_FILE && !self.group.guest_library_path.is_empty()
        {
            return Some(self.group.guest_library_path.clone());
        }
        if path == GUEST_STATE_FILE && !self.allowed_file.is_empty() {
            return Some(self.allowed_file.clone());
        }
        // The program may read its own binary.
        if path == self.filename && !self.filename.is_empty() {
            return Some(self.filename.clone());
        }
        None
    }

    /// Rewrites a guest-visible path opened for writing; only entries marked
    /// writable (and the state file) qualify.
    pub fn open_writable(&self, path: &str) -> Option<String> {
        for vp in &self.group.allowed_paths {
            if !vp.writable {
                continue;
            }
            if !vp.prefix && vp.virt == path {
                return Some(vp.real.clone());
            }
            if vp.prefix && path.starts_with(&vp.virt) {
                return Some(format!("{}{}", vp.real, &path[vp.virt.len()..]));
            }
        }
        if path == GUEST_STATE_FILE && !self.allowed_file.is_empty() {
            return Some(self.allowed_file.clone());
        }
        None
    }

    /// Resolves a guest symlink to its target, when allowed.
    pub fn resolve_symlink(&self, path: &str) -> Option<String> {
        for vp in &self.group.allowed_paths {
            if vp.symlink && vp.virt == path {
                return Some(vp.real.clone());
            }
        }
        if path == "/proc/self/exe" && !self.filename.is_empty() {
            return Some(self.filename.clone());
        }
        None
    }

    /// Emits the recognized configuration keys back as a JSON object.
    pub fn to_json(&self) -> Value {
        let g = &self.group;
        let mut obj = Map::new();
        if !self.filename.is_empty() {
            obj.insert("filename".into(), json!(self.filename));
        }
        if !self.storage_filename.is_empty() {
            obj.insert("storage_filename".into(), json!(self.storage_filename));
        }
        if !self.key.is_empty() {
            obj.insert("key".into(), json!(self.key));
        }
        if !self.uri.is_empty() {
            obj.insert("uri".into(), json!(self.uri));
        }
        if self.start {
            obj.insert("start".into(), json!(true));
        }
        obj.insert("max_boot_time".into(), json!(g.max_boot_time));
        obj.insert("max_request_time".into(), json!(g.max_req_time));
        obj.insert("max_storage_time".into(), json!(g.max_storage_time));
        obj.insert("max_queue_time".into(), json!(g.max_queue_time));
        obj.insert("max_memory".into(), json!(g.max_main_memory / MIB));
        obj.insert("address_space".into(), json!(g.max_address_space / MIB));
        obj.insert("max_request_memory".into(), json!(g.max_req_memory / MIB));
        obj.insert(
            "req_mem_limit_after_reset".into(),
            json!(g.limit_req_memory / MIB),
        );
        obj.insert(
            "max_storage_memory".into(),
            json!(g.max_storage_memory / MIB),
        );
        obj.insert("shared_memory".into(), json!(g.shared_memory / MIB));
        obj.insert("concurrency".into(), json!(g.max_concurrency));
        obj.insert("double_buffered".into(), json!(g.double_buffered));
        obj.insert("storage".into(), json!(g.has_storage));
        if g.storage_perm_remote {
            obj.insert("storage_1_to_1".into(), json!("permanent"));
        } else {
            obj.insert("storage_1_to_1".into(), json!(g.storage_1_to_1));
        }
        obj.insert("storage_serialized".into(), json!(g.storage_serialized));
        obj.insert("hugepages".into(), json!(g.hugepages));
        obj.insert("split_hugepages".into(), json!(g.split_hugepages));
        obj.insert(
            "transparent_hugepages".into(),
            json!(g.transparent_hugepages),
        );
        obj.insert("stdout".into(), json!(g.print_stdout));
        obj.insert("smp".into(), json!(g.max_smp));
        obj.insert("allow_debug".into(), json!(g.allow_debug));
        obj.insert(
            "remote_debug_on_exception".into(),
            json!(g.remote_debug_on_exception),
        );
        obj.insert("control_ephemeral".into(), json!(g.control_ephemeral));
        obj.insert("ephemeral".into(), json!(g.ephemeral));
        obj.insert(
            "ephemeral_keep_working_memory".into(),
            json!(g.ephemeral_keep_working_memory),
        );
        if !g.main_arguments.is_empty() {
            obj.insert("main_arguments".into(), json!(g.main_arguments));
        }
        if !g.storage_arguments.is_empty() {
            obj.insert("storage_arguments".into(), json!(g.storage_arguments));
        }
        if !g.environ.is_empty() {
            obj.insert("environment".into(), json!(g.environ));
        }
        if !g.allowed_paths.is_empty() {
            let paths: Vec<Value> = g
                .allowed_paths
                .iter()
                .map(|p| {
                    json!({
                        "real": p.real,
                        "virtual": p.virt,
                        "writable": p.writable,
                        "symlink": p.symlink,
                        "prefix": p.prefix,
                    })
                })
                .collect();
            obj.insert("allowed_paths".into(), Value::Array(paths));
        }
        obj.insert(
            "current_working_directory".into(),
            json!(g.current_working_directory),
        );
        if !g.cold_start_file.is_empty() {
            obj.insert("cold_start_file".into(), json!(g.cold_start_file));
        }
        if g.dylink_address_hint != 0 {
            obj.insert(
                "dylink_address_hint".into(),
                json!(format!("{:#x}", g.dylink_address_hint)),
            );
        }
        if g.storage_dylink_address_hint != 0 {
            obj.insert(
                "storage_dylink_address_hint".into(),
                json!(format!("{:#x}", g.storage_dylink_address_hint)),
            );
        }
        if g.heap_address_hint != 0 {
            obj.insert(
                "heap_address_hint".into(),
                json!(g.heap_address_hint / MIB),
            );
        }
        if let Some(w) = &g.warmup {
            obj.insert(
                "warmup".into(),
                json!({
                    "url": w.url,
                    "method": w.method,
                    "headers": w.headers,
                    "num_requests": w.num_requests,
                }),
            );
        }
        Value::Object(obj)
    }
}

/// Process-level settings resolved from the command line; handed down
/// explicitly rather than living in a global.
#[derive(Clone, Debug)]
pub struct ServerSettings {
    pub reservations: bool,
    pub ephemeral: Option<bool>,
    pub double_buffered: bool,
    pub concurrency: Option<usize>,
    pub default_tenant: String,
    pub verbose: bool,
    pub profiling: bool,
    pub debug_boot: bool,
    pub debug_prefork: bool,
    pub guest_library_path: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            reservations: true,
            ephemeral: None,
            double_buffered: false,
            concurrency: None,
            default_tenant: "test.com".to_string(),
            verbose: false,
            profiling: false,
            debug_boot: false,
            debug_prefork: false,
            guest_library_path: String::new(),
        }
    }
}

impl ServerSettings {
    /// Number of front-end worker threads.
    pub fn num_threads(&self) -> usize {
        let hw = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        match self.concurrency {
            Some(n) if n > 0 => {
                if self.double_buffered {
                    n * 2
                } else {
                    n
                }
            }
            _ => {
                if self.double_buffered {
                    hw * 2
                } else {
                    hw
                }
            }
        }
    }

    fn effective_concurrency(&self) -> usize {
        let hw = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.concurrency.filter(|n| *n > 0).unwrap_or(hw)
    }
}

/// The outcome of loading a configuration file.
#[derive(Debug, Default)]
pub struct LoadedTenants {
    pub tenants: Vec<TenantConfig>,
    pub default_tenant: Option<String>,
}

/// Strips `//` line comments and `/* */` block comments outside of string
/// literals, preserving offsets enough for useful parse errors.
pub fn strip_json_comments(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let mut in_string = false;
    while i < bytes.len() {
        let c = bytes[i];
        if in_string {
            out.push(c);
            if c == b'\\' && i + 1 < bytes.len() {
                out.push(bytes[i + 1]);
                i += 2;
                continue;
            }
            if c == b'"' {
                in_string = false;
            }
            i += 1;
        } else if c == b'"' {
            in_string = true;
            out.push(c);
            i += 1;
        } else if c == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
        } else if c == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b'*' {
            i += 2;
            while i + 1 < bytes.len()
                && !(bytes[i] == b'*' && bytes[i + 1] == b'/')
            {
                if bytes[i] == b'\n' {
                    out.push(b'\n');
                }
                i += 1;
            }
            i = (i + 2).min(bytes.len());
        } else {
            out.push(c);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Substitutes `$HOME` and `$PWD` in a path-valued string.
pub fn apply_dollar_vars(s: &str) -> String {
    let mut out = s.to_string();
    if out.contains("$HOME") {
        if let Ok(home) = std::env::var("HOME") {
            out = out.replace("$HOME", &home);
        }
    }
    if out.contains("$PWD") {
        if let Ok(pwd) = std::env::current_dir() {
            out = out.replace("$PWD", &pwd.to_string_lossy());
        }
    }
    out
}

fn is_tenant(obj: &Value) -> bool {
    obj.get("group").is_some()
        || obj.get("filename").is_some()
        || obj.get("uri").is_some()
}

fn want_bool(key: &str, v: &Value) -> Result<bool, ConfigError> {
    v.as_bool().ok_or_else(|| invalid(key, "expected a boolean"))
}

fn want_u64(key: &str, v: &Value) -> Result<u64, ConfigError> {
    v.as_u64().ok_or_else(|| invalid(key, "expected a non-negative number"))
}

fn want_f64(key: &str, v: &Value) -> Result<f64, ConfigError> {
    v.as_f64().ok_or_else(|| invalid(key, "expected a number"))
}

fn want_str<'v>(key: &str, v: &'v Value) -> Result<&'v str, ConfigError> {
    v.as_str().ok_or_else(|| invalid(key, "expected a string"))
}

fn want_string_list(key: &str, v: &Value) -> Result<Vec<String>, ConfigError> {
    let arr = v
        .as_array()
        .ok_or_else(|| invalid(key, "expected an array of strings"))?;
    arr.iter()
        .map(|e| {
            Ok(apply_dollar_vars(want_str(key, e)?))
        })
        .collect()
}

/// Parses an address that may be a hex string (`"0x40000000"`) or a number
/// of mebibytes.
fn want_address(key: &str, v: &Value) -> Result<u64, ConfigError> {
    if let Some(s) = v.as_str() {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        u64::from_str_radix(digits, 16)
            .map_err(|_| invalid(key, "expected a hex address"))
    } else if let Some(n) = v.as_u64() {
        Ok(n * MIB)
    } else {
        Err(invalid(key, "expected a hex string or a number of MiB"))
    }
}

fn parse_remapping(
    key: &str,
    v: &Value,
) -> Result<(VirtualRemapping, bool), ConfigError> {
    let arr = v
        .as_array()
        .filter(|a| a.len() >= 2)
        .ok_or_else(|| invalid(key, "remapping must be [address, size]"))?;
    let addr_str = want_str(key, &arr[0])?;
    let digits = addr_str.strip_prefix("0x").unwrap_or(addr_str);
    let address = u64::from_str_radix(digits, 16)
        .map_err(|_| invalid(key, "remapping address must be hex"))?;
    if address < 0x20000 {
        return Err(invalid(key, "remapping address is too low"));
    }
    let size = if let Some(end) = arr[1].as_str() {
        let digits = end.strip_prefix("0x").unwrap_or(end);
        let end = u64::from_str_radix(digits, 16)
            .map_err(|_| invalid(key, "remapping end must be hex"))?;
        if end < address {
            return Err(invalid(key, "remapping ends before it starts"));
        }
        end - address
    } else {
        want_u64(key, &arr[1])? * MIB
    };
    let is_storage =
        arr.get(2).and_then(|v| v.as_str()) == Some("storage");
    Ok((
        VirtualRemapping {
            phys: 0,
            virt: address,
            size,
            writable: true,
            executable: key == "executable_remapping",
            blackout: key == "blackout_area",
            },
        is_storage,
    ))
}

fn parse_allowed_paths(
    key: &str,
    v: &Value,
) -> Result<Vec<VirtualPath>, ConfigError> {
    let arr = v
        .as_array()
        .ok_or_else(|| invalid(key, "expected an array of strings/objects"))?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        if let Some(s) = item.as_str() {
            let real = apply_dollar_vars(s);
            out.push(VirtualPath {
                virt: real.clone(),
                real,
                ..Default::default()
            });
            continue;
        }
        let obj = item
            .as_object()
            .ok_or_else(|| invalid(key, "entries must be strings or objects"))?;
        let real = obj
            .get("real")
            .and_then(|v| v.as_str())
            .map(apply_dollar_vars)
            .ok_or_else(|| invalid(key, "entry must carry a real path"))?;
        if real.is_empty() {
            return Err(invalid(key, "real path must not be empty"));
        }
        let virt = obj
            .get("virtual")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| real.clone());
        let writable =
            obj.get("writable").and_then(|v| v.as_bool()).unwrap_or(false);
        let symlink =
            obj.get("symlink").and_then(|v| v.as_bool()).unwrap_or(false);
        let prefix =
            obj.get("prefix").and_then(|v| v.as_bool()).unwrap_or(false);
        if symlink && virt == real {
            return Err(invalid(
                key,
                "symlink must map distinct virtual and real paths",
            ));
        }
        out.push(VirtualPath { real, virt, writable, symlink, prefix });
    }
    Ok(out)
}

fn parse_warmup(key: &str, v: &Value) -> Result<Warmup, ConfigError> {
    let obj =
        v.as_object().ok_or_else(|| invalid(key, "warmup must be an object"))?;
    let mut w = Warmup::default();
    if let Some(n) = obj.get("num_requests") {
        w.num_requests = want_u64(key, n)? as usize;
    }
    if let Some(u) = obj.get("url") {
        w.url = want_str(key, u)?.to_string();
    }
    if let Some(m) = obj.get("method") {
        w.method = want_str(key, m)?.to_string();
    }
    if let Some(h) = obj.get("headers") {
        w.headers = want_string_list(key, h)?;
    }
    Ok(w)
}

/// Applies one configuration key to a group. Both group objects and tenant
/// objects funnel through here, which is what makes tenant-level overrides
/// work.
fn configure_group(
    group: &mut TenantGroup,
    key: &str,
    value: &Value,
) -> Result<(), ConfigError> {
    match key {
        "max_boot_time" => group.max_boot_time = want_f64(key, value)?,
        "max_request_time" => group.max_req_time = want_f64(key, value)?,
        "max_storage_time" => group.max_storage_time = want_f64(key, value)?,
        "max_queue_time" => group.max_queue_time = want_f64(key, value)?,
        "max_memory" => group.max_main_memory = want_u64(key, value)? * MIB,
        "max_storage_memory" | "storage_memory" => {
            group.max_storage_memory = want_u64(key, value)? * MIB
        }
        "address_space" => {
            group.max_address_space = want_u64(key, value)? * MIB
        }
        "max_request_memory" => {
            group.max_req_memory = want_u64(key, value)? * MIB
        }
        "req_mem_limit_after_reset" => {
            group.limit_req_memory = want_u64(key, value)? * MIB
        }
        "shared_memory" => {
            let bytes = want_u64(key, value)? * MIB;
            if bytes > group.max_main_memory / 2 {
                return Err(invalid(
                    key,
                    "shared memory cannot exceed half of max memory",
                ));
            }
            group.shared_memory = bytes;
        }
        "cold_start_file" => {
            group.cold_start_file = apply_dollar_vars(want_str(key, value)?)
        }
        "dylink_address_hint" => {
            group.dylink_address_hint = want_address(key, value)?
        }
        "storage_dylink_address_hint" => {
            group.storage_dylink_address_hint = want_address(key, value)?
        }
        "heap_address_hint" => {
            group.heap_address_hint = want_u64(key, value)? * MIB
        }
        "concurrency" => {
            group.max_concurrency = want_u64(key, value)? as usize
        }
        "double_buffered" => group.double_buffered = want_bool(key, value)?,
        "storage" => group.has_storage = want_bool(key, value)?,
        "storage_1_to_1" => match value {
            Value::String(s) if s == "permanent" => {
                group.storage_1_to_1 = true;
                group.storage_perm_remote = true;
            }
            Value::Bool(b) => group.storage_1_to_1 = *b,
            _ => {
                return Err(invalid(
                    key,
                    "expected a boolean or the string 'permanent'",
                ))
            }
        },
        "storage_serialized" => {
            group.storage_serialized = want_bool(key, value)?
        }
        "hugepages" => group.hugepages = want_bool(key, value)?,
        "hugepage_arena_size" => {
            let bytes = want_u64(key, value)? * MIB;
            validate_arena(key, bytes)?;
            group.hugepage_arena_size = bytes;
            group.hugepages = bytes != 0;
        }
        "request_hugepages" | "request_hugepage_arena_size" => {
            let bytes = want_u64(key, value)? * MIB;
            validate_arena(key, bytes)?;
            group.hugepage_requests_arena = bytes;
        }
        "split_hugepages" => group.split_hugepages = want_bool(key, value)?,
        "transparent_hugepages" => {
            group.transparent_hugepages = want_bool(key, value)?
        }
        "stdout" => group.print_stdout = want_bool(key, value)?,
        "smp" => group.max_smp = (want_u64(key, value)? as usize).min(16),
        "allow_debug" => group.allow_debug = want_bool(key, value)?,
        "remote_debug_on_exception" => {
            group.remote_debug_on_exception = want_bool(key, value)?
        }
        "control_ephemeral" => {
            group.control_ephemeral = want_bool(key, value)?
        }
        "ephemeral" => group.ephemeral = want_bool(key, value)?,
        "ephemeral_keep_working_memory" => {
            let keep = want_bool(key, value)?;
            group.ephemeral = group.ephemeral || keep;
            group.ephemeral_keep_working_memory = keep;
        }
        "main_arguments" => {
            group.main_arguments = want_string_list(key, value)?
        }
        "storage_arguments" => {
            group.storage_arguments = want_string_list(key, value)?
        }
        "environment" => {
            let mut vars = want_string_list(key, value)?;
            group.environ.append(&mut vars);
        }
        "remapping" | "executable_remapping" | "blackout_area" => {
            let entries: Vec<&Value> = if value
                .as_array()
                .map_or(false, |a| a.len() >= 2 && a[0].is_string())
            {
                vec![value]
            } else if let Some(obj) = value.as_object() {
                obj.values().collect()
            } else if let Some(arr) = value.as_array() {
                arr.iter().collect()
            } else {
                return Err(invalid(key, "expected an array or object"));
            };
            for entry in entries {
                let (remap, storage) = parse_remapping(key, entry)?;
                if storage {
                    group.storage_remappings.push(remap);
                } else {
                    group.vmem_remappings.push(remap);
                }
            }
        }
        "executable_heap" => {
            group.vmem_heap_executable = want_bool(key, value)?
        }
        "allowed_paths" => {
            let mut paths = parse_allowed_paths(key, value)?;
            group.allowed_paths.append(&mut paths);
        }
        "current_working_directory" => {
            group.current_working_directory =
                apply_dollar_vars(want_str(key, value)?)
        }
        "verbose" => group.verbose = want_bool(key, value)?,
        "verbose_syscalls" => group.verbose_syscalls = want_bool(key, value)?,
        "verbose_pagetables" => {
            group.verbose_pagetables = want_bool(key, value)?
        }
        "profiling" => match value {
            Value::Bool(true) => group.profiling_interval = 1000,
            Value::Bool(false) => group.profiling_interval = 0,
            Value::Number(_) => {
                group.profiling_interval = want_u64(key, value)? as usize
            }
            _ => return Err(invalid(key, "expected a boolean or a number")),
        },
        "warmup" => group.warmup = Some(parse_warmup(key, value)?),
        // Outer servers are out of scope for this engine; accept the keys
        // so shared configuration files keep loading.
        "server" | "websocket_server" => {}
        // Tenant-identity keys are handled by the caller.
        "group" | "key" | "uri" | "filename" | "storage_filename"
        | "default" | "start" => {}
        _ => {
            return Err(invalid(key, "unknown configuration key"));
        }
    }
    Ok(())
}

fn validate_arena(key: &str, bytes: u64) -> Result<(), ConfigError> {
    const TWO_MB: u64 = 0x200000;
    if bytes == 0 {
        return Ok(());
    }
    if bytes < TWO_MB {
        return Err(invalid(key, "arena must be at least 2MB"));
    }
    if bytes > 512 * 1024 * MIB {
        return Err(invalid(key, "arena must be less than 512GB"));
    }
    if bytes % TWO_MB != 0 {
        return Err(invalid(key, "arena must be a multiple of 2MB"));
    }
    Ok(())
}

/// Parses a configuration document into tenant definitions, applying the
/// process settings overlay (CLI concurrency/ephemeral overrides and the
/// guest library path).
pub fn parse_tenants(
    text: &str,
    settings: &ServerSettings,
) -> Result<LoadedTenants, ConfigError> {
    let stripped = strip_json_comments(text);
    let root: Value = serde_json::from_str(&stripped)?;
    let root = match root {
        Value::Object(map) => map,
        _ => {
            return Err(invalid("<root>", "configuration must be an object"))
        }
    };

    let mut groups: std::collections::BTreeMap<String, TenantGroup> =
        std::collections::BTreeMap::new();
    groups.insert("compute".to_string(), TenantGroup::new("compute"));

    // First pass: groups.
    for (name, obj) in root.iter() {
        if is_tenant(obj) {
            continue;
        }
        let group = groups
            .entry(name.clone())
            .or_insert_with(|| TenantGroup::new(name.clone()));
        let obj = obj
            .as_object()
            .ok_or_else(|| invalid(name, "group must be an object"))?;
        for (key, value) in obj {
            configure_group(group, key, value)?;
        }
    }

    // Second pass: tenants.
    let mut loaded = LoadedTenants::default();
    for (name, obj) in root.iter() {
        if !is_tenant(obj) {
            continue;
        }
        let obj = obj
            .as_object()
            .ok_or_else(|| invalid(name, "tenant must be an object"))?;
        let group_name = obj
            .get("group")
            .and_then(|v| v.as_str())
            .unwrap_or("compute")
            .to_string();
        let mut group = groups
            .get(&group_name)
            .cloned()
            .ok_or_else(|| {
                ConfigError::UnknownGroup(name.clone(), group_name.clone())
            })?;
        for (key, value) in obj {
            configure_group(&mut group, key, value)?;
        }

        // Process-wide overrides come last.
        if let Some(ephemeral) = settings.ephemeral {
            group.ephemeral = ephemeral;
        }
        if settings.verbose {
            group.verbose = true;
            group.verbose_syscalls = true;
        }
        if settings.double_buffered {
            group.double_buffered = true;
        }
        if settings.profiling && group.profiling_interval == 0 {
            group.profiling_interval = 1000;
        }
        if obj.get("concurrency").is_none() {
            group.max_concurrency = settings.effective_concurrency();
        }
        if group.double_buffered {
            group.max_concurrency *= 2;
        }
        if group.max_concurrency == 0 {
            return Err(invalid("concurrency", "must be at least 1"));
        }
        group.guest_library_path = settings.guest_library_path.clone();

        let mut config = TenantConfig::new(name.clone(), group);
        if let Some(f) = obj.get("filename") {
            config.filename = apply_dollar_vars(want_str("filename", f)?);
        }
        if let Some(f) = obj.get("storage_filename") {
            config.storage_filename =
                apply_dollar_vars(want_str("storage_filename", f)?);
        }
        if let Some(k) = obj.get("key") {
            config.key = want_str("key", k)?.to_string();
        }
        if let Some(u) = obj.get("uri") {
            config.uri = want_str("uri", u)?.to_string();
        }
        if config.filename.is_empty() && config.uri.is_empty() {
            return Err(ConfigError::Unreachable(name.clone()));
        }
        config.allowed_file = format!("{}.state", config.filename);
        if let Some(Value::Bool(true)) = obj.get("default") {
            loaded.default_tenant = Some(name.clone());
        }
        if let Some(Value::Bool(b)) = obj.get("start") {
            config.start = *b;
        }
        loaded.tenants.push(config);
    }

    Ok(loaded)
}

#[cfg(test)]
mod test {
    use super::*;

    fn settings() -> ServerSettings {
        ServerSettings { concurrency: Some(2), ..Default::default() }
    }

    const SAMPLE: &str = r#"
    // A group shared by both tenants.
    {
        "fast": {
            "max_request_time": 0.5,
            "max_memory": 128,          /* MiB */
            "max_request_memory": 32,
            "ephemeral_keep_working_memory": true,
            "allowed_paths": [
                "/usr/share/zoneinfo",
                { "real": "/srv/data", "virtual": "/data", "prefix": true },
                { "real": "/tmp/out", "virtual": "/out", "writable": true }
            ]
        },
        "alpha.example.com": {
            "group": "fast",
            "filename": "/tmp/alpha.elf",
            "key": "s3cret",
            "default": true
        },
        "beta.example.com": {
            "group": "fast",
            "filename": "/tmp/beta.elf",
            "concurrency": 4,
            "storage": true,
            "storage_serialized": true
        }
    }
    "#;

    #[test]
    fn comments_are_stripped_outside_strings() {
        let s = strip_json_comments(
            r#"{"a": "http://x/y", // trailing
                "b": /* inline */ 2}"#,
        );
        let v: Value = serde_json::from_str(&s).unwrap();
        assert_eq!(v["a"], "http://x/y");
        assert_eq!(v["b"], 2);
    }

    #[test]
    fn groups_and_tenant_overrides() {
        let loaded = parse_tenants(SAMPLE, &settings()).unwrap();
        assert_eq!(loaded.tenants.len(), 2);
        assert_eq!(loaded.default_tenant.as_deref(), Some("alpha.example.com"));

        let alpha = &loaded.tenants[0];
        assert_eq!(alpha.name, "alpha.example.com");
        assert_eq!(alpha.group.max_req_time, 0.5);
        assert_eq!(alpha.group.max_main_memory, 128 * super::MIB);
        assert!(alpha.group.ephemeral);
        assert!(alpha.group.ephemeral_keep_working_memory);
        assert_eq!(alpha.group.max_concurrency, 2);
        assert_eq!(alpha.key, "s3cret");
        assert_eq!(alpha.allowed_file, "/tmp/alpha.elf.state");

        let beta = &loaded.tenants[1];
        assert_eq!(beta.group.max_concurrency, 4);
        assert!(beta.group.has_storage);
        assert!(beta.group.storage_serialized);
    }

    #[test]
    fn path_rewrites() {
        let loaded = parse_tenants(SAMPLE, &settings()).unwrap();
        let alpha = &loaded.tenants[0];
        assert_eq!(
            alpha.open_readable("/usr/share/zoneinfo").as_deref(),
            Some("/usr/share/zoneinfo")
        );
        assert_eq!(
            alpha.open_readable("/data/a/b").as_deref(),
            Some("/srv/data/a/b")
        );
        assert_eq!(alpha.open_readable("/etc/passwd"), None);
        assert_eq!(
            alpha.open_readable(GUEST_STATE_FILE).as_deref(),
            Some("/tmp/alpha.elf.state")
        );
        // Writable paths are a separate, stricter set.
        assert_eq!(alpha.open_writable("/data/a"), None);
        assert_eq!(alpha.open_writable("/out").as_deref(), Some("/tmp/out"));
        assert_eq!(
            alpha.open_writable(GUEST_STATE_FILE).as_deref(),
            Some("/tmp/alpha.elf.state")
        );
        assert_eq!(
            alpha.resolve_symlink("/proc/self/exe").as_deref(),
            Some("/tmp/alpha.elf")
        );
    }

    #[test]
    fn unreachable_tenant_is_rejected() {
        let text = r#"{ "x.com": { "group": "compute" } }"#;
        assert!(matches!(
            parse_tenants(text, &settings()),
            Err(ConfigError::Unreachable(_))
        ));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let text = r#"{ "g": { "max_reqest_time": 1.0 } }"#;
        assert!(matches!(
            parse_tenants(text, &settings()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn storage_permanent_string() {
        let text = r#"{
            "t.com": { "filename": "/x", "storage": true,
                       "storage_1_to_1": "permanent" }
        }"#;
        let loaded = parse_tenants(text, &settings()).unwrap();
        let t = &loaded.tenants[0];
        assert!(t.group.storage_1_to_1);
        assert!(t.group.storage_perm_remote);
    }

    #[test]
    fn config_json_roundtrip_preserves_fields() {
        let loaded = parse_tenants(SAMPLE, &settings()).unwrap();
        for config in &loaded.tenants {
            let emitted =
                serde_json::to_string(&json!({ &config.name: config.to_json() }))
                    .unwrap();
            let reloaded = parse_tenants(&emitted, &settings()).unwrap();
            assert_eq!(reloaded.tenants.len(), 1);
            let round = &reloaded.tenants[0];
            assert_eq!(round.name, config.name);
            assert_eq!(round.filename, config.filename);
            assert_eq!(round.key, config.key);
            assert_eq!(round.group.max_req_time, config.group.max_req_time);
            assert_eq!(
                round.group.max_main_memory,
                config.group.max_main_memory
            );
            assert_eq!(
                round.group.max_concurrency,
                config.group.max_concurrency
            );
            assert_eq!(round.group.ephemeral, config.group.ephemeral);
            assert_eq!(
                round.group.ephemeral_keep_working_memory,
                config.group.ephemeral_keep_working_memory
            );
            assert_eq!(
                round.group.allowed_paths,
                config.group.allowed_paths
            );
            assert_eq!(round.group.has_storage, config.group.has_storage);
            assert_eq!(
                round.group.storage_serialized,
                config.group.storage_serialized
            );
        }
    }

    #[test]
    fn dollar_vars() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(apply_dollar_vars("$HOME/app.elf"), "/home/tester/app.elf");
    }
}
