// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The HTTP front end.
//!
//! Three fixed routes (`/hello`, `/stats`, `/update`) plus a catch-all that
//! dispatches to the tenant named by the request's `Host` header, falling
//! back to the default tenant when the header names the bind address. The
//! synchronous engine entry point runs on the blocking pool; in pinned
//! mode each blocking worker keeps its slot across requests.

use std::cell::RefCell;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::header::{CONTENT_TYPE, HOST};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, StatusCode};
use slog::{info, warn, Logger};

use apiary::config::ServerSettings;
use apiary::update::LiveUpdateParams;
use apiary::{dispatch, dispatch_pinned, Request, Response, Tenants, WorkerSlot};

pub struct ServerContext {
    pub tenants: Tenants,
    pub settings: Arc<ServerSettings>,
    pub bind_host: String,
    pub log: Logger,
}

pub async fn serve(
    ctx: Arc<ServerContext>,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let make_ctx = Arc::clone(&ctx);
    let make_service = make_service_fn(move |_conn| {
        let ctx = Arc::clone(&make_ctx);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle(Arc::clone(&ctx), req)
            }))
        }
    });

    let server = hyper::Server::bind(&addr).serve(make_service);
    info!(ctx.log, "server started"; "addr" => %addr);
    server.await?;
    Ok(())
}

async fn handle(
    ctx: Arc<ServerContext>,
    req: hyper::Request<Body>,
) -> Result<hyper::Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/hello") => text_response(StatusCode::OK, "Hello World!"),
        (&Method::GET, "/stats") => stats(&ctx),
        (&Method::POST, "/update") => update(ctx, req).await,
        _ => compute(ctx, req).await,
    };
    Ok(response)
}

fn text_response(status: StatusCode, body: &str) -> hyper::Response<Body> {
    hyper::Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn stats(ctx: &ServerContext) -> hyper::Response<Body> {
    let doc = ctx.tenants.gather_stats();
    hyper::Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(doc.to_string()))
        .unwrap()
}

fn host_of(req: &hyper::Request<Body>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Receives a new program image for the tenant named by `Host`, gated by
/// the tenant's configured update key.
async fn update(
    ctx: Arc<ServerContext>,
    req: hyper::Request<Body>,
) -> hyper::Response<Body> {
    let host = host_of(&req);
    let key = req
        .headers()
        .get("X-Update-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let tenant = match ctx.tenants.find_key(&host, &key) {
        Some(tenant) => Arc::clone(tenant),
        None => {
            warn!(ctx.log, "rejected live update"; "host" => %host);
            return text_response(StatusCode::UNAUTHORIZED, "Unauthorized");
        }
    };

    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => {
            return text_response(StatusCode::BAD_REQUEST, "Bad request body")
        }
    };

    let result = tokio::task::spawn_blocking(move || {
        tenant.live_update(LiveUpdateParams {
            binary: body,
            storage_binary: None,
            is_debug: false,
        })
    })
    .await;
    match result {
        Ok(result) if result.success => {
            text_response(StatusCode::OK, &result.text)
        }
        Ok(result) => text_response(StatusCode::BAD_REQUEST, &result.text),
        Err(_) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Update task failed",
        ),
    }
}

/// Dispatches every other request into the tenant's VM pool.
async fn compute(
    ctx: Arc<ServerContext>,
    req: hyper::Request<Body>,
) -> hyper::Response<Body> {
    let host = host_of(&req);
    let tenant = match ctx.tenants.find(&host) {
        Some(tenant) => Arc::clone(tenant),
        None if host == ctx.bind_host => {
            match ctx.tenants.default_tenant() {
                Some(tenant) => Arc::clone(tenant),
                None => {
                    return text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "No default tenant",
                    )
                }
            }
        }
        None => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("No such tenant: {}", host),
            )
        }
    };

    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => {
            return text_response(StatusCode::BAD_REQUEST, "Bad request body")
        }
    };
    let request = Request { method, path, query, headers, body };

    let reservations = ctx.settings.reservations;
    let result = tokio::task::spawn_blocking(move || {
        if reservations {
            dispatch(&tenant, request)
        } else {
            // Without reservations, each blocking worker keeps a slot
            // pinned across requests for the tenant it last served.
            thread_local! {
                static SLOT: RefCell<WorkerSlot> =
                    RefCell::new(WorkerSlot::new());
            }
            SLOT.with(|slot| {
                dispatch_pinned(&mut slot.borrow_mut(), &tenant, request)
            })
        }
    })
    .await;

    let response = match result {
        Ok(response) => response,
        Err(_) => Response::server_error(),
    };
    let status = StatusCode::from_u16(response.status)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    hyper::Response::builder()
        .status(status)
        .header(
            CONTENT_TYPE,
            if response.content_type.is_empty() {
                "application/octet-stream"
            } else {
                response.content_type.as_str()
            },
        )
        .body(Body::from(response.body))
        .unwrap()
}
