// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multi-tenant HTTP compute sandbox engine.
//!
//! Untrusted tenant programs run inside hardware-isolated VMs and serve
//! HTTP requests with sub-millisecond dispatch overhead. Each tenant's
//! program boots once into a *main VM*, which is forked copy-on-write into
//! a pool of *request VMs*; a request reserves one, runs the guest handler,
//! harvests the response from its registers, and resets the VM back to the
//! main image. An optional per-tenant *storage VM* provides serialized
//! mutable state reachable through a cross-VM call primitive.
//!
//! The hypervisor itself sits behind the [`vmm::Machine`] capability; the
//! engine is driver-agnostic and ships a userspace driver for tests and
//! development.

pub mod binary;
pub mod config;
pub mod dispatch;
pub mod fetch;
pub mod instance;
pub mod pool;
pub mod program;
pub mod state;
pub mod stats;
pub mod storage;
pub mod syscalls;
pub mod tenant;
pub mod tenants;
pub mod update;
pub mod vmm;
pub mod worker;

pub use binary::BinaryStorage;
pub use config::{ServerSettings, TenantConfig, TenantGroup};
pub use dispatch::{dispatch, dispatch_pinned, Request, Response, WorkerSlot};
pub use program::ProgramInstance;
pub use tenant::TenantInstance;
pub use tenants::Tenants;
pub use update::{LiveUpdateParams, LiveUpdateResult};
