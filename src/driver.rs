//! The driver's own entry points, as reachable from the supervisor.
//!
//! Forwarding answers the notification with "continue", so the kernel runs
//! the caller's ioctl in the caller's context exactly as issued. Calling
//! through is only done for the control command: it duplicates the caller's
//! open file with `pidfd_getfd` and issues the ioctl from the supervisor,
//! staging the envelope and payload through private copies.

use crate::hook::Abi;
use crate::ioctl::{Caller, IoctlEntry, IoctlResult, OpenFile, Reply, read_user};
use crate::protocol::{RM_CONTROL_COMMAND, RmControlParams};
use nix::errno::Errno;
use nix::unistd::Pid;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tracing::*;

/// Largest secondary payload staged for a call-through.
const MAX_PARAMETER_SIZE: usize = 4 << 20;

pub struct DriverEntry {
    abi: Abi,
}

impl DriverEntry {
    pub fn new(abi: Abi) -> Self {
        Self { abi }
    }

    pub fn abi(&self) -> Abi {
        self.abi
    }
}

impl IoctlEntry for DriverEntry {
    fn call(&self, caller: &Caller<'_>, file: &OpenFile, command: u32, arg: u64) -> IoctlResult {
        // Everything else is forwarded and never reaches a call-through.
        if command != RM_CONTROL_COMMAND {
            debug!("{:?} call-through refused for cmd {:#x}", self.abi, command);
            return Err(Errno::ENOTTY);
        }

        let fd = duplicate_fd(caller.pid, file.fd)?;

        trace!(
            "{:?} call-through: pid {}, fd {}, cmd {:#x}",
            self.abi, caller.pid, file.fd, command
        );

        rm_control(caller, &fd, command, arg)
    }

    fn forward(&self, _caller: &Caller<'_>, _file: &OpenFile, _command: u32, _arg: u64) -> Reply {
        Reply::Continue
    }
}

/// Re-issue a control call with both the envelope and its payload staged.
///
/// The envelope is written back whenever the driver got to see it, so the
/// caller observes its `status` on failure too.
fn rm_control(caller: &Caller<'_>, fd: &OwnedFd, command: u32, arg: u64) -> IoctlResult {
    let mut envelope: RmControlParams = read_user(caller.memory, arg)?;
    let user_parameter = envelope.parameter;
    let size = envelope.parameter_size as usize;

    if size > MAX_PARAMETER_SIZE {
        return Err(Errno::EINVAL);
    }

    let mut payload = staging_buffer(size)?;
    let payload_bytes = &mut bytemuck::cast_slice_mut::<u64, u8>(&mut payload)[..size];
    caller.memory.copy_from_user(user_parameter, payload_bytes)?;

    envelope.parameter = payload_bytes.as_mut_ptr() as u64;
    let ret = raw_ioctl(fd, command, &mut envelope as *mut _ as *mut libc::c_void);
    envelope.parameter = user_parameter;

    match ret {
        Ok(_) => caller.memory.copy_to_user(user_parameter, payload_bytes)?,
        Err(Errno::EFAULT) => return ret,
        Err(_) => {}
    }
    caller.memory.copy_to_user(arg, bytemuck::bytes_of(&envelope))?;
    ret
}

/// An 8-byte aligned zeroed buffer of at least `size` bytes.
fn staging_buffer(size: usize) -> Result<Vec<u64>, Errno> {
    let words = size.div_ceil(8);
    let mut buf = Vec::new();
    buf.try_reserve_exact(words).map_err(|_| Errno::ENOMEM)?;
    buf.resize(words, 0u64);
    Ok(buf)
}

fn raw_ioctl(fd: &OwnedFd, command: u32, arg: *mut libc::c_void) -> IoctlResult {
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), command as _, arg) };
    if ret < 0 {
        return Err(Errno::last());
    }
    Ok(ret as i64)
}

/// Take a reference to file `fd` of the thread group `pid` belongs to.
fn duplicate_fd(pid: Pid, fd: i32) -> Result<OwnedFd, Errno> {
    let tgid = thread_group(pid)?;

    let pidfd = unsafe { libc::syscall(libc::SYS_pidfd_open, tgid.as_raw(), 0) };
    if pidfd < 0 {
        return Err(Errno::last());
    }
    let pidfd = unsafe { OwnedFd::from_raw_fd(pidfd as i32) };

    let dup = unsafe { libc::syscall(libc::SYS_pidfd_getfd, pidfd.as_raw_fd(), fd, 0) };
    if dup < 0 {
        let errno = Errno::last();
        debug!("pidfd_getfd({}, {}) failed: {}", tgid, fd, errno);
        return Err(errno);
    }
    Ok(unsafe { OwnedFd::from_raw_fd(dup as i32) })
}

/// Thread group leader of `pid`, read from `/proc/<pid>/status`.
fn thread_group(pid: Pid) -> Result<Pid, Errno> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).map_err(|_| Errno::ESRCH)?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("Tgid:"))
        .and_then(|tgid| tgid.trim().parse().ok())
        .map(Pid::from_raw)
        .ok_or(Errno::ESRCH)
}
