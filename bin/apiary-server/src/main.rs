// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sandbox host process: loads the tenant configuration, boots tenant
//! programs, and serves HTTP with per-request VM dispatch.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use slog::{info, o, Drain, Logger};

use apiary::config::ServerSettings;
use apiary::vmm::emulate::EmuVmm;
use apiary::Tenants;

mod server;

#[derive(Debug, Parser)]
#[command(version, about = "Multi-tenant HTTP compute sandbox")]
struct Args {
    /// Reserve a VM per request instead of pinning slots to workers
    #[arg(short, long)]
    reservations: bool,

    /// Concurrent request VMs per tenant (default: hardware threads)
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// JSON configuration file
    #[arg(long, default_value = "tenants.json")]
    config: String,

    /// Tenant served when the Host header names the bind address
    #[arg(short, long, default_value = "test.com")]
    default: String,

    /// Attach the remote debugger at guest boot
    #[arg(long)]
    debug_boot: bool,

    /// Attach the remote debugger just before forking request VMs
    #[arg(long)]
    debug_prefork: bool,

    /// Force ephemeral VMs on
    #[arg(short, long, conflicts_with = "no_ephemeral")]
    ephemeral: bool,

    /// Force ephemeral VMs off
    #[arg(long)]
    no_ephemeral: bool,

    /// Reset request VMs on their bound worker after responding
    #[arg(long)]
    double_buffered: bool,

    /// Enable guest profiling
    #[arg(short, long)]
    profiling: bool,

    /// Verbose engine and guest-syscall logging
    #[arg(short, long)]
    verbose: bool,

    /// Listen address
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Host path substituted for the guest support library
    #[arg(long, default_value = "./program/libapiary.so")]
    guest_library: String,
}

fn build_logger(verbose: bool) -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(
        drain,
        if verbose { slog::Level::Debug } else { slog::Level::Info },
    )
    .fuse();
    Logger::root(drain, o!())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log = build_logger(args.verbose);

    let settings = Arc::new(ServerSettings {
        reservations: args.reservations,
        ephemeral: if args.ephemeral {
            Some(true)
        } else if args.no_ephemeral {
            Some(false)
        } else {
            None
        },
        double_buffered: args.double_buffered,
        concurrency: args.concurrency,
        default_tenant: args.default.clone(),
        verbose: args.verbose,
        profiling: args.profiling,
        debug_boot: args.debug_boot,
        debug_prefork: args.debug_prefork,
        guest_library_path: args.guest_library.clone(),
    });

    let addr: SocketAddr = args
        .listen
        .parse()
        .with_context(|| format!("invalid listen address '{}'", args.listen))?;

    // The hardware KVM driver plugs in here; the userspace driver carries
    // development hosts and the built-in demo guest.
    let vmm = EmuVmm::with_demo_guests();

    let mut tenants =
        Tenants::new(vmm, Arc::clone(&settings), log.new(o!()));
    tenants
        .init_file(&args.config, false)
        .with_context(|| format!("loading config '{}'", args.config))?;
    if tenants.default_tenant().is_none() {
        bail!("default tenant '{}' not found", settings.default_tenant);
    }

    info!(log, "host settings";
        "reservations" => settings.reservations,
        "double_buffered" => settings.double_buffered,
        "ephemeral" => format!("{:?}", settings.ephemeral),
        "threads" => settings.num_threads(),
        "config" => %args.config,
        "default" => %settings.default_tenant);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(settings.num_threads().max(16))
        .build()
        .context("building runtime")?;

    let ctx = Arc::new(server::ServerContext {
        tenants,
        settings,
        bind_host: args.listen.clone(),
        log: log.new(o!("component" => "http")),
    });
    runtime.block_on(server::serve(ctx, addr))
}
