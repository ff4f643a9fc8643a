// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The guest trap-out interface.
//!
//! When a guest executes the trap instruction, the machine exits with the
//! call number from the ABI result register and [`handle`] is consulted.
//! Numbers in the `0x10000+` range are the sandbox ABI; a small set of Linux
//! file syscalls is delegated to the host with path sanitization against the
//! tenant's allowed paths. Unknown numbers return `-ENOSYS`.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};

use zerocopy::AsBytes;

use crate::instance::MachineInstance;
use crate::program::ProgramInstance;
use crate::vmm::MachineError;

/// Stable trap-out numbers; part of the guest ABI.
pub mod nr {
    pub const REGISTER_FUNC: u32 = 0x10000;
    pub const WAIT_FOR_REQUESTS: u32 = 0x10001;
    pub const PAUSE_FOR_REQUESTS: u32 = 0x10002;
    pub const BACKEND_RESPONSE: u32 = 0x10010;
    pub const STORAGE_RETURN: u32 = 0x10011;
    pub const STORAGE_NORETURN: u32 = 0x10013;
    pub const MAKE_EPHEMERAL: u32 = 0x10703;
    pub const IS_STORAGE: u32 = 0x10706;
    pub const STORAGE_ALLOW: u32 = 0x10707;
    pub const STORAGE_CALLV: u32 = 0x10708;
    pub const STORAGE_TASK: u32 = 0x10709;
    pub const STOP_STORAGE_TASK: u32 = 0x1070A;
    pub const CURL_FETCH: u32 = 0x20000;
    pub const LOG: u32 = 0x7F000;

    // Delegated Linux file syscalls.
    pub const SYS_READ: u32 = 0;
    pub const SYS_WRITE: u32 = 1;
    pub const SYS_CLOSE: u32 = 3;
    pub const SYS_STAT: u32 = 4;
    pub const SYS_FSTAT: u32 = 5;
    pub const SYS_LSEEK: u32 = 8;
    pub const SYS_GETCWD: u32 = 79;
    pub const SYS_GETDENTS64: u32 = 217;
    pub const SYS_OPENAT: u32 = 257;
    pub const SYS_NEWFSTATAT: u32 = 262;
    pub const SYS_STATX: u32 = 332;
}

/// What the run loop does after a handled trap-out.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Flow {
    /// Resume the guest.
    Continue,
    /// Leave the guest parked at the trap.
    Halt,
}

const GUEST_VFD_BASE: u64 = 0x1000;
const MAX_PATH: u64 = 4096;
const MAX_FILE_IO: u64 = 4 * 1024 * 1024;
const MAX_CONSOLE_WRITE: u64 = 64 * 1024;
const MAX_STORAGE_BUFFERS: u64 = 64;

/// An open guest file handle.
pub(crate) struct FdEntry {
    file: Option<fs::File>,
    path: String,
    dir_offset: usize,
}

/// Guest-visible file descriptor table, cleared on every slot release.
#[derive(Default)]
pub(crate) struct FdTable {
    entries: HashMap<u64, FdEntry>,
    next: u64,
}

impl FdTable {
    fn manage(&mut self, entry: FdEntry) -> u64 {
        self.next += 1;
        let vfd = GUEST_VFD_BASE + self.next;
        self.entries.insert(vfd, entry);
        vfd
    }

    fn get_mut(&mut self, vfd: u64) -> Option<&mut FdEntry> {
        self.entries.get_mut(&vfd)
    }

    fn remove(&mut self, vfd: u64) -> Option<FdEntry> {
        self.entries.remove(&vfd)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn neg_errno(errno: i32) -> u64 {
    (-(errno as i64)) as u64
}

fn io_errno(e: &std::io::Error) -> u64 {
    neg_errno(e.raw_os_error().unwrap_or(libc::EIO))
}

/// Reads a NUL-terminated guest path.
fn read_guest_path(
    inst: &MachineInstance,
    addr: u64,
) -> Result<String, MachineError> {
    let raw = inst.machine().copy_from_guest(addr, MAX_PATH)?;
    let end = raw.iter().position(|b| *b == 0).ok_or(
        MachineError::OutOfBounds { addr, len: MAX_PATH },
    )?;
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

/// Byte-exact Linux `struct stat` for x86-64.
#[derive(AsBytes, Default)]
#[repr(C)]
struct GuestStat {
    st_dev: u64,
    st_ino: u64,
    st_nlink: u64,
    st_mode: u32,
    st_uid: u32,
    st_gid: u32,
    _pad0: u32,
    st_rdev: u64,
    st_size: i64,
    st_blksize: i64,
    st_blocks: i64,
    st_atime: i64,
    st_atime_nsec: i64,
    st_mtime: i64,
    st_mtime_nsec: i64,
    st_ctime: i64,
    st_ctime_nsec: i64,
    _unused: [i64; 3],
}

#[cfg(unix)]
fn stat_from_metadata(meta: &fs::Metadata) -> GuestStat {
    use std::os::unix::fs::MetadataExt;
    GuestStat {
        st_dev: meta.dev(),
        st_ino: meta.ino(),
        st_nlink: meta.nlink(),
        st_mode: meta.mode(),
        st_uid: meta.uid(),
        st_gid: meta.gid(),
        st_rdev: meta.rdev(),
        st_size: meta.size() as i64,
        st_blksize: meta.blksize() as i64,
        st_blocks: meta.blocks() as i64,
        st_atime: meta.atime(),
        st_atime_nsec: meta.atime_nsec(),
        st_mtime: meta.mtime(),
        st_mtime_nsec: meta.mtime_nsec(),
        st_ctime: meta.ctime(),
        st_ctime_nsec: meta.ctime_nsec(),
        ..Default::default()
    }
}

#[cfg(not(unix))]
fn stat_from_metadata(meta: &fs::Metadata) -> GuestStat {
    GuestStat {
        st_mode: if meta.is_dir() { 0o040755 } else { 0o100644 },
        st_size: meta.len() as i64,
        ..Default::default()
    }
}

/// Handles one guest trap-out. The vCPU is halted; registers and guest
/// memory may be read and written freely.
pub(crate) fn handle(
    inst: &mut MachineInstance,
    prog: &ProgramInstance,
    nr: u32,
) -> Result<Flow, MachineError> {
    let mut regs = inst.machine().registers();
    let flow = match nr {
        nr::REGISTER_FUNC => {
            let idx = regs.rdi;
            let addr = regs.rsi;
            match crate::state::ProgramEntryIndex::from_raw(idx) {
                Some(entry) => {
                    prog.entries().set(entry, addr);
                    regs.rax = 0;
                }
                None => regs.rax = neg_errno(libc::EINVAL),
            }
            Flow::Continue
        }
        nr::WAIT_FOR_REQUESTS | nr::PAUSE_FOR_REQUESTS => {
            inst.wait_for_requests();
            Flow::Halt
        }
        nr::BACKEND_RESPONSE => {
            inst.finish_call(1);
            Flow::Halt
        }
        nr::STORAGE_RETURN => {
            inst.finish_call(2);
            Flow::Halt
        }
        nr::STORAGE_NORETURN => {
            inst.finish_call(3);
            Flow::Halt
        }
        nr::MAKE_EPHEMERAL => {
            if inst.config().group.control_ephemeral {
                inst.set_ephemeral(regs.rdi != 0);
                regs.rax = 0;
            } else {
                regs.rax = neg_errno(libc::EPERM);
            }
            Flow::Continue
        }
        nr::IS_STORAGE => {
            regs.rax = inst.is_storage() as u64;
            Flow::Continue
        }
        nr::STORAGE_ALLOW => {
            if inst.is_storage() && prog.storage_allow(regs.rdi) {
                regs.rax = 0;
            } else {
                regs.rax = neg_errno(libc::EPERM);
            }
            Flow::Continue
        }
        nr::STORAGE_CALLV => {
            regs.rax = storage_callv(inst, prog, &regs)? as u64;
            Flow::Continue
        }
        nr::STORAGE_TASK => {
            regs.rax = storage_task(inst, prog, &regs)? as u64;
            Flow::Continue
        }
        nr::STOP_STORAGE_TASK => {
            regs.rax = prog.stop_storage_tasks();
            Flow::Continue
        }
        nr::CURL_FETCH => {
            regs.rax = crate::fetch::syscall_fetch(inst, &regs)? as u64;
            Flow::Continue
        }
        nr::LOG => {
            let len = (regs.rsi as u16) as u64;
            let text = inst.machine().buffer_to_string(regs.rdi, len)?;
            inst.guest_print(&text);
            Flow::Continue
        }
        nr::SYS_READ => {
            regs.rax = sys_read(inst, regs.rdi, regs.rsi, regs.rdx)?;
            Flow::Continue
        }
        nr::SYS_WRITE => {
            regs.rax = sys_write(inst, regs.rdi, regs.rsi, regs.rdx)?;
            Flow::Continue
        }
        nr::SYS_CLOSE => {
            regs.rax = match inst.fds.remove(regs.rdi) {
                Some(_) => 0,
                None => neg_errno(libc::EBADF),
            };
            Flow::Continue
        }
        nr::SYS_STAT => {
            regs.rax = sys_stat(inst, regs.rdi, regs.rsi)?;
            Flow::Continue
        }
        nr::SYS_FSTAT => {
            regs.rax = sys_fstat(inst, regs.rdi, regs.rsi)?;
            Flow::Continue
        }
        nr::SYS_LSEEK => {
            regs.rax = sys_lseek(inst, regs.rdi, regs.rsi as i64, regs.rdx);
            Flow::Continue
        }
        nr::SYS_GETCWD => {
            let cwd = b"/\0";
            if regs.rsi >= cwd.len() as u64 {
                inst.machine_mut().copy_to_guest(regs.rdi, cwd)?;
                regs.rax = regs.rdi;
            } else {
                regs.rax = 0;
            }
            Flow::Continue
        }
        nr::SYS_GETDENTS64 => {
            regs.rax = sys_getdents64(inst, regs.rdi, regs.rsi, regs.rdx)?;
            Flow::Continue
        }
        nr::SYS_OPENAT => {
            regs.rax = sys_openat(inst, regs.rsi, regs.rdx as i32)?;
            Flow::Continue
        }
        nr::SYS_NEWFSTATAT => {
            regs.rax = sys_stat(inst, regs.rsi, regs.rdx)?;
            Flow::Continue
        }
        nr::SYS_STATX => {
            regs.rax = sys_statx(inst, regs.rsi, regs.r8)?;
            Flow::Continue
        }
        // Sockets: outbound connects are the driver's concern; serving
        // sockets are denied outright.
        49 /* bind */ | 50 /* listen */ => {
            regs.rax = neg_errno(libc::EPERM);
            Flow::Continue
        }
        _ => {
            slog::debug!(inst.log(), "unhandled guest call"; "nr" => nr);
            regs.rax = neg_errno(libc::ENOSYS);
            Flow::Continue
        }
    };
    inst.machine_mut().set_registers(regs);
    Ok(flow)
}

fn storage_callv(
    inst: &mut MachineInstance,
    prog: &ProgramInstance,
    regs: &crate::vmm::Registers,
) -> Result<i64, MachineError> {
    if inst.is_storage() || !prog.has_storage() {
        return Ok(-(libc::ENOSYS as i64));
    }
    let func = regs.rdi;
    let n = regs.rsi;
    let desc_addr = regs.rdx;
    let res_addr = regs.rcx;
    let res_size = regs.r8;
    if n > MAX_STORAGE_BUFFERS {
        return Ok(-(libc::EINVAL as i64));
    }
    // Detect wrap-around before anything is copied.
    if res_addr.checked_add(res_size).is_none() {
        return Ok(-1);
    }

    // Gather the input buffers out of the caller's memory.
    let mut buffers = Vec::with_capacity(n as usize);
    for i in 0..n {
        let desc =
            inst.machine().copy_from_guest(desc_addr + i * 16, 16)?;
        let addr = u64::from_le_bytes(desc[0..8].try_into().unwrap());
        let len = u64::from_le_bytes(desc[8..16].try_into().unwrap());
        if len > MAX_FILE_IO {
            return Ok(-(libc::EINVAL as i64));
        }
        buffers.push(inst.machine().copy_from_guest(addr, len)?);
    }

    Ok(prog.storage_call(inst, func, buffers, res_addr, res_size))
}

fn storage_task(
    inst: &mut MachineInstance,
    prog: &ProgramInstance,
    regs: &crate::vmm::Registers,
) -> Result<i64, MachineError> {
    if inst.is_storage() || !prog.has_storage() {
        return Ok(-(libc::ENOSYS as i64));
    }
    let func = regs.rdi;
    let len = regs.rdx.min(MAX_CONSOLE_WRITE);
    let argument = if regs.rsi != 0 && regs.rdx > 0 {
        inst.machine().copy_from_guest(regs.rsi, len)?
    } else {
        Vec::new()
    };
    Ok(prog.storage_task(func, argument))
}

fn sys_read(
    inst: &mut MachineInstance,
    vfd: u64,
    g_buf: u64,
    len: u64,
) -> Result<u64, MachineError> {
    let len = len.min(MAX_FILE_IO);
    let entry = match inst.fds.get_mut(vfd) {
        Some(e) => e,
        None => return Ok(neg_errno(libc::EBADF)),
    };
    let file = match entry.file.as_mut() {
        Some(f) => f,
        None => return Ok(neg_errno(libc::EISDIR)),
    };
    let mut buf = vec![0u8; len as usize];
    match file.read(&mut buf) {
        Ok(n) => {
            inst.machine_mut().copy_to_guest(g_buf, &buf[..n])?;
            Ok(n as u64)
        }
        Err(e) => Ok(io_errno(&e)),
    }
}

fn sys_write(
    inst: &mut MachineInstance,
    vfd: u64,
    g_buf: u64,
    len: u64,
) -> Result<u64, MachineError> {
    if vfd == 1 || vfd == 2 {
        if len > MAX_CONSOLE_WRITE {
            return Ok(neg_errno(libc::EINVAL));
        }
        let text = inst.machine().buffer_to_string(g_buf, len)?;
        inst.guest_print(&text);
        return Ok(len);
    }
    if len > MAX_FILE_IO {
        return Ok(neg_errno(libc::EINVAL));
    }
    let bytes = inst.machine().copy_from_guest(g_buf, len)?;
    let entry = match inst.fds.get_mut(vfd) {
        Some(e) => e,
        None => return Ok(neg_errno(libc::EBADF)),
    };
    let file = match entry.file.as_mut() {
        Some(f) => f,
        None => return Ok(neg_errno(libc::EISDIR)),
    };
    match file.write(&bytes) {
        Ok(n) => Ok(n as u64),
        Err(e) => Ok(io_errno(&e)),
    }
}

fn sys_stat(
    inst: &mut MachineInstance,
    g_path: u64,
    g_stat: u64,
) -> Result<u64, MachineError> {
    let path = read_guest_path(inst, g_path)?;
    let real = match inst.config().open_readable(&path) {
        Some(real) => real,
        None => return Ok(neg_errno(libc::EACCES)),
    };
    match fs::metadata(&real) {
        Ok(meta) => {
            let stat = stat_from_metadata(&meta);
            inst.machine_mut().copy_to_guest(g_stat, stat.as_bytes())?;
            Ok(0)
        }
        Err(e) => Ok(io_errno(&e)),
    }
}

fn sys_fstat(
    inst: &mut MachineInstance,
    vfd: u64,
    g_stat: u64,
) -> Result<u64, MachineError> {
    let meta = {
        let entry = match inst.fds.get_mut(vfd) {
            Some(e) => e,
            None => return Ok(neg_errno(libc::EBADF)),
        };
        match entry.file.as_ref() {
            Some(f) => f.metadata(),
            None => fs::metadata(&entry.path),
        }
    };
    match meta {
        Ok(meta) => {
            let stat = stat_from_metadata(&meta);
            inst.machine_mut().copy_to_guest(g_stat, stat.as_bytes())?;
            Ok(0)
        }
        Err(e) => Ok(io_errno(&e)),
    }
}

fn sys_lseek(
    inst: &mut MachineInstance,
    vfd: u64,
    offset: i64,
    whence: u64,
) -> u64 {
    let entry = match inst.fds.get_mut(vfd) {
        Some(e) => e,
        None => return neg_errno(libc::EBADF),
    };
    let file = match entry.file.as_mut() {
        Some(f) => f,
        None => return neg_errno(libc::EISDIR),
    };
    let pos = match whence as i32 {
        libc::SEEK_SET => SeekFrom::Start(offset as u64),
        libc::SEEK_CUR => SeekFrom::Current(offset),
        libc::SEEK_END => SeekFrom::End(offset),
        _ => return neg_errno(libc::EINVAL),
    };
    match file.seek(pos) {
        Ok(n) => n,
        Err(e) => io_errno(&e),
    }
}

fn sys_openat(
    inst: &mut MachineInstance,
    g_path: u64,
    flags: i32,
) -> Result<u64, MachineError> {
    let path = read_guest_path(inst, g_path)?;
    let wants_write = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;

    if !wants_write {
        if let Some(real) = inst.config().open_readable(&path) {
            match fs::metadata(&real) {
                Ok(meta) if meta.is_dir() => {
                    let vfd = inst.fds.manage(FdEntry {
                        file: None,
                        path: real,
                        dir_offset: 0,
                    });
                    return Ok(vfd);
                }
                Ok(_) => match fs::File::open(&real) {
                    Ok(file) => {
                        let vfd = inst.fds.manage(FdEntry {
                            file: Some(file),
                            path: real,
                            dir_offset: 0,
                        });
                        return Ok(vfd);
                    }
                    Err(e) => return Ok(io_errno(&e)),
                },
                Err(e) => return Ok(io_errno(&e)),
            }
        }
    }

    // Either the guest asked to write, or the read path was not allowed;
    // the writable set is the last resort.
    let real = match inst.config().open_writable(&path) {
        Some(real) => real,
        None => return Ok(neg_errno(libc::EACCES)),
    };
    let mut options = fs::OpenOptions::new();
    options.read(true).write(true).create(true);
    if flags & libc::O_TRUNC != 0 {
        options.truncate(true);
    }
    if flags & libc::O_APPEND != 0 {
        options.append(true);
    }
    match options.open(&real) {
        Ok(file) => {
            let vfd = inst.fds.manage(FdEntry {
                file: Some(file),
                path: real,
                dir_offset: 0,
            });
            Ok(vfd)
        }
        Err(e) => Ok(io_errno(&e)),
    }
}

fn sys_getdents64(
    inst: &mut MachineInstance,
    vfd: u64,
    g_buf: u64,
    buf_len: u64,
) -> Result<u64, MachineError> {
    let buf_len = buf_len.min(2048) as usize;
    let (path, start) = {
        let entry = match inst.fds.get_mut(vfd) {
            Some(e) => e,
            None => return Ok(neg_errno(libc::EBADF)),
        };
        if entry.file.is_some() {
            return Ok(neg_errno(libc::ENOTDIR));
        }
        (entry.path.clone(), entry.dir_offset)
    };

    let mut names: Vec<(String, u8, u64)> = Vec::new();
    let iter = match fs::read_dir(&path) {
        Ok(iter) => iter,
        Err(e) => return Ok(io_errno(&e)),
    };
    for item in iter.flatten() {
        let ftype = item.file_type().ok();
        let d_type = match ftype {
            Some(t) if t.is_dir() => libc::DT_DIR,
            Some(t) if t.is_symlink() => libc::DT_LNK,
            Some(t) if t.is_file() => libc::DT_REG,
            _ => libc::DT_UNKNOWN,
        };
        let ino = {
            #[cfg(unix)]
            {
                use std::os::unix::fs::MetadataExt;
                item.metadata().map(|m| m.ino()).unwrap_or(0)
            }
            #[cfg(not(unix))]
            {
                0
            }
        };
        names.push((item.file_name().to_string_lossy().into_owned(), d_type, ino));
    }
    names.sort();

    let mut out = Vec::with_capacity(buf_len);
    let mut consumed = 0usize;
    for (i, (name, d_type, ino)) in names.iter().enumerate().skip(start) {
        let name_bytes = name.as_bytes();
        // d_ino + d_off + d_reclen + d_type + name + NUL, 8-aligned.
        let reclen = (8 + 8 + 2 + 1 + name_bytes.len() + 1 + 7) & !7;
        if out.len() + reclen > buf_len {
            break;
        }
        let mut rec = Vec::with_capacity(reclen);
        rec.extend_from_slice(&ino.to_le_bytes());
        rec.extend_from_slice(&((i + 1) as u64).to_le_bytes());
        rec.extend_from_slice(&(reclen as u16).to_le_bytes());
        rec.push(*d_type);
        rec.extend_from_slice(name_bytes);
        rec.push(0);
        rec.resize(reclen, 0);
        out.extend_from_slice(&rec);
        consumed = i + 1;
    }
    if let Some(entry) = inst.fds.get_mut(vfd) {
        entry.dir_offset = consumed;
    }
    let written = out.len() as u64;
    if written > 0 {
        inst.machine_mut().copy_to_guest(g_buf, &out)?;
    }
    Ok(written)
}

/// Byte-exact Linux `struct statx`.
#[derive(AsBytes, Default)]
#[repr(C)]
struct GuestStatx {
    stx_mask: u32,
    stx_blksize: u32,
    stx_attributes: u64,
    stx_nlink: u32,
    stx_uid: u32,
    stx_gid: u32,
    stx_mode: u16,
    _spare0: u16,
    stx_ino: u64,
    stx_size: u64,
    stx_blocks: u64,
    stx_attributes_mask: u64,
    stx_atime: GuestStatxTimestamp,
    stx_btime: GuestStatxTimestamp,
    stx_ctime: GuestStatxTimestamp,
    stx_mtime: GuestStatxTimestamp,
    stx_rdev_major: u32,
    stx_rdev_minor: u32,
    stx_dev_major: u32,
    stx_dev_minor: u32,
    _spare2: [u64; 14],
}

#[derive(AsBytes, Default, Clone, Copy)]
#[repr(C)]
struct GuestStatxTimestamp {
    tv_sec: i64,
    tv_nsec: u32,
    _reserved: i32,
}

fn sys_statx(
    inst: &mut MachineInstance,
    g_path: u64,
    g_statx: u64,
) -> Result<u64, MachineError> {
    let path = read_guest_path(inst, g_path)?;
    let real = match inst.config().open_readable(&path) {
        Some(real) => real,
        None => return Ok(neg_errno(libc::EACCES)),
    };
    match fs::metadata(&real) {
        Ok(meta) => {
            let stat = stat_from_metadata(&meta);
            let stx = GuestStatx {
                stx_mask: 0x7ff,
                stx_blksize: stat.st_blksize as u32,
                stx_nlink: stat.st_nlink as u32,
                stx_uid: stat.st_uid,
                stx_gid: stat.st_gid,
                stx_mode: stat.st_mode as u16,
                stx_ino: stat.st_ino,
                stx_size: stat.st_size as u64,
                stx_blocks: stat.st_blocks as u64,
                stx_mtime: GuestStatxTimestamp {
                    tv_sec: stat.st_mtime,
                    tv_nsec: stat.st_mtime_nsec as u32,
                    _reserved: 0,
                },
                stx_ctime: GuestStatxTimestamp {
                    tv_sec: stat.st_ctime,
                    tv_nsec: stat.st_ctime_nsec as u32,
                    _reserved: 0,
                },
                ..Default::default()
            };
            inst.machine_mut().copy_to_guest(g_statx, stx.as_bytes())?;
            Ok(0)
        }
        Err(e) => Ok(io_errno(&e)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_encoding() {
        assert_eq!(neg_errno(libc::ENOSYS) as i64, -(libc::ENOSYS as i64));
        assert_eq!(neg_errno(libc::EBADF) as i64, -(libc::EBADF as i64));
    }

    #[test]
    fn guest_stat_matches_linux_layout() {
        assert_eq!(std::mem::size_of::<GuestStat>(), 144);
        assert_eq!(std::mem::size_of::<GuestStatx>(), 256);
    }

    #[test]
    fn fd_table_recycles_nothing() {
        let mut fds = FdTable::default();
        let a = fds.manage(FdEntry { file: None, path: "/".into(), dir_offset: 0 });
        let b = fds.manage(FdEntry { file: None, path: "/".into(), dir_offset: 0 });
        assert_ne!(a, b);
        assert!(fds.remove(a).is_some());
        assert!(fds.remove(a).is_none());
        assert!(fds.get_mut(b).is_some());
        fds.clear();
        assert!(fds.get_mut(b).is_none());
    }
}
