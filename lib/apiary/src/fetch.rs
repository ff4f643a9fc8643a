// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Out-of-VM HTTP fetch for guests.
//!
//! The `CURL_FETCH` trap-out lets a guest perform an HTTP request through
//! the host. The guest passes a URL and a [`FetchOp`] descriptor naming
//! where status, content-type, headers and body should land in guest
//! memory. Network failures are surfaced to the guest as negative return
//! values and never fail the dispatch.

use std::time::Duration;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::instance::MachineInstance;
use crate::vmm::{MachineError, Registers};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(8);
const MAX_URL_LENGTH: u64 = 1024;
const MAX_POST_LENGTH: u32 = 64 * 1024 * 1024;
const CONTENT_TYPE_LEN: usize = 128;

/// Fetch descriptor exchanged with the guest; byte-exact ABI.
#[derive(AsBytes, FromBytes, FromZeroes, Clone)]
#[repr(C)]
pub struct FetchOp {
    /// Out: HTTP status code.
    pub status: u32,
    /// Out: bytes of body written to `content_addr`.
    pub content_len: u32,
    /// Out: bytes of header block written to `headers_addr`.
    pub headers_len: u32,
    /// Out: length of the content type string.
    pub ct_len: u32,
    /// In: body destination; 0 asks the host to allocate one. Out: the
    /// destination actually used.
    pub content_addr: u64,
    /// In: capacity at `content_addr` when caller-provided.
    pub content_max: u64,
    /// In: header block destination, or 0 to skip headers.
    pub headers_addr: u64,
    pub headers_max: u64,
    /// In: POST body source; 0 makes the fetch a GET.
    pub post_addr: u64,
    pub post_len: u32,
    pub _reserved: u32,
    /// Out: NUL-terminated content type.
    pub ctype: [u8; CONTENT_TYPE_LEN],
}

/// Handles the fetch trap-out. Only transport-level errors return negative
/// values; HTTP error statuses are reported through the descriptor.
pub(crate) fn syscall_fetch(
    inst: &mut MachineInstance,
    regs: &Registers,
) -> Result<i64, MachineError> {
    let url_len = regs.rsi;
    if url_len == 0 || url_len > MAX_URL_LENGTH {
        return Ok(-(libc::EINVAL as i64));
    }
    let url = inst.machine().buffer_to_string(regs.rdi, url_len)?;
    let op_addr = regs.rdx;
    let raw = inst
        .machine()
        .copy_from_guest(op_addr, std::mem::size_of::<FetchOp>() as u64)?;
    let mut op = match FetchOp::read_from(raw.as_slice()) {
        Some(op) => op,
        None => return Ok(-(libc::EINVAL as i64)),
    };
    if op.post_len > MAX_POST_LENGTH {
        return Ok(-(libc::EINVAL as i64));
    }

    let post_body = if op.post_addr != 0 && op.post_len > 0 {
        Some(
            inst.machine()
                .copy_from_guest(op.post_addr, op.post_len as u64)?,
        )
    } else {
        None
    };

    slog::debug!(inst.log(), "guest fetch";
        "url" => %url, "post" => post_body.is_some());

    let client = match reqwest::blocking::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(READ_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(_) => return Ok(-1),
    };
    let request = match post_body {
        Some(body) => client.post(&url).body(body),
        None => client.get(&url),
    };
    let response = match request.send() {
        Ok(r) => r,
        Err(_) => return Ok(-1),
    };

    op.status = response.status().as_u16() as u32;

    let ctype = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let mut header_block = String::new();
    for (name, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            header_block.push_str(name.as_str());
            header_block.push_str(": ");
            header_block.push_str(v);
            header_block.push('\n');
        }
    }
    let body = match response.bytes() {
        Ok(b) => b,
        Err(_) => return Ok(-1),
    };

    // Body: either the caller's buffer, or a host-side allocation.
    let writeable = if op.content_addr == 0 {
        op.content_addr =
            inst.machine_mut().mmap_allocate(body.len().max(1) as u64)?;
        body.len()
    } else {
        body.len().min(op.content_max as usize)
    };
    inst.machine_mut().copy_to_guest(op.content_addr, &body[..writeable])?;
    op.content_len = writeable as u32;
    inst.stats().input_bytes.add(writeable as u64);

    if op.headers_addr != 0 {
        let n = header_block.len().min(op.headers_max as usize);
        inst.machine_mut()
            .copy_to_guest(op.headers_addr, &header_block.as_bytes()[..n])?;
        op.headers_len = n as u32;
    }

    let ct = ctype.as_bytes();
    let n = ct.len().min(CONTENT_TYPE_LEN - 1);
    op.ctype = [0u8; CONTENT_TYPE_LEN];
    op.ctype[..n].copy_from_slice(&ct[..n]);
    op.ct_len = n as u32;

    inst.machine_mut().copy_to_guest(op_addr, op.as_bytes())?;
    Ok(0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fetch_op_layout_is_stable() {
        assert_eq!(std::mem::size_of::<FetchOp>(), 64 + CONTENT_TYPE_LEN);
        let op = FetchOp::new_zeroed();
        assert_eq!(op.as_bytes().len(), std::mem::size_of::<FetchOp>());
    }
}
