//! Answering seccomp notifications for the workload.
//!
//! The supervising thread polls the listener, receives notifications and
//! watches the child. A pool of workers answers each notification through
//! the live entry point of the caller's ABI.

use crate::seccomp::{
    AUDIT_ARCH_COMPAT, AUDIT_ARCH_NATIVE, SeccompNotif, SeccompNotifResp, notif_id_valid,
    notif_receive, notif_respond,
};
use anyhow::Result;
use crossbeam_channel::{Receiver, bounded};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use nvidia_pidns::memory::ProcessMemory;
use nvidia_pidns::{Abi, Caller, DeviceNumber, FileOperations, OpenFile, Reply};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use tracing::*;

const POLL_INTERVAL_MS: libc::c_int = 100;

/// An ioctl notification decoded for the ABI it arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoctlCall {
    pub id: u64,
    pub pid: Pid,
    pub abi: Abi,
    pub fd: i32,
    pub command: u32,
    pub arg: u64,
}

impl IoctlCall {
    /// `None` for an architecture the filter does not route here.
    pub fn decode(notif: &SeccompNotif) -> Option<Self> {
        let abi = if notif.data.arch == AUDIT_ARCH_NATIVE {
            Abi::Native
        } else if AUDIT_ARCH_COMPAT == Some(notif.data.arch) {
            Abi::Compat
        } else {
            return None;
        };

        let args = notif.data.args;
        let arg = match abi {
            Abi::Native => args[2],
            Abi::Compat => args[2] as u32 as u64,
        };

        Some(Self {
            id: notif.id,
            pid: Pid::from_raw(notif.pid as i32),
            abi,
            fd: args[0] as i32,
            command: args[1] as u32,
            arg,
        })
    }
}

/// Device number of the character device open as `fd` in `pid`, if it is one.
pub fn device_of(pid: Pid, fd: i32) -> Option<DeviceNumber> {
    let metadata = std::fs::metadata(format!("/proc/{}/fd/{}", pid, fd)).ok()?;
    metadata
        .file_type()
        .is_char_device()
        .then(|| DeviceNumber::from_raw(metadata.rdev()))
}

/// Build the response for `call`, or `None` when the caller is gone.
pub fn answer(listener: BorrowedFd<'_>, operations: &FileOperations, call: &IoctlCall) -> Option<SeccompNotifResp> {
    let file = OpenFile::new(call.fd, device_of(call.pid, call.fd));

    // The pid and fd read above are only meaningful while the caller is
    // still blocked in this notification.
    if !notif_id_valid(listener, call.id) {
        debug!("Notification {} went stale before dispatch", call.id);
        return None;
    }

    let memory = ProcessMemory::new(call.pid);
    let caller = Caller::new(call.pid, &memory);
    let entry = operations.entry(call.abi);

    Some(match entry.forward(&caller, &file, call.command, call.arg) {
        Reply::Continue => SeccompNotifResp::continuing(call.id),
        Reply::Done(Ok(val)) => SeccompNotifResp::success(call.id, val),
        Reply::Done(Err(errno)) => SeccompNotifResp::error(call.id, errno),
    })
}

fn worker(listener: BorrowedFd<'_>, operations: &FileOperations, queue: Receiver<SeccompNotif>) {
    for notif in queue {
        let Some(call) = IoctlCall::decode(&notif) else {
            debug!("Unexpected arch {:#x}, continuing", notif.data.arch);
            respond(listener, &SeccompNotifResp::continuing(notif.id));
            continue;
        };

        trace!(
            "ioctl: pid={}, abi={:?}, fd={}, cmd={:#x}, id={}",
            call.pid, call.abi, call.fd, call.command, call.id
        );

        if let Some(resp) = answer(listener, operations, &call) {
            respond(listener, &resp);
        }
    }
}

fn respond(listener: BorrowedFd<'_>, resp: &SeccompNotifResp) {
    match notif_respond(listener, resp) {
        Ok(()) => {}
        Err(Errno::ENOENT) => debug!("Caller of notification {} terminated before response", resp.id),
        Err(e) => warn!("Failed to respond to notification {}: {}", resp.id, e),
    }
}

/// Serve notifications on `listener` until `child` exits, returning how it
/// exited.
pub fn supervise(child: Pid, listener: OwnedFd, operations: &FileOperations, workers: usize) -> Result<WaitStatus> {
    let listener_fd = listener.as_fd();
    set_nonblocking(listener_fd)?;

    let workers = workers.max(1);
    info!("Supervising child {} with {} workers", child, workers);

    let status = std::thread::scope(|s| {
        let (queue_tx, queue_rx) = bounded::<SeccompNotif>(workers * 4);
        for _ in 0..workers {
            let queue = queue_rx.clone();
            s.spawn(move || worker(listener_fd, operations, queue));
        }
        drop(queue_rx);

        let status = watch(child, listener_fd, |notif| {
            if queue_tx.send(notif).is_err() {
                warn!("No worker left for notification {}", notif.id);
            }
        });

        // Workers drain what is queued and then see the channel close.
        drop(queue_tx);
        status
    })?;

    drop(listener);
    Ok(status)
}

fn set_nonblocking(fd: BorrowedFd<'_>) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Poll the listener, handing each notification to `dispatch`, until
/// `child` exits.
fn watch(child: Pid, listener: BorrowedFd<'_>, mut dispatch: impl FnMut(SeccompNotif)) -> Result<WaitStatus> {
    let mut poll_fd = libc::pollfd {
        fd: listener.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };

    loop {
        let poll_ret = unsafe { libc::poll(&mut poll_fd, 1, POLL_INTERVAL_MS) };
        if poll_ret < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                continue;
            }
            error!("poll failed: {}", errno);
            break;
        }

        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                info!("Child finished: {:?}", status);
                return Ok(status);
            }
            Ok(other) => debug!("Child status: {:?}", other),
            Err(Errno::ECHILD) => anyhow::bail!("child {} is no longer ours to wait for", child),
            Err(e) => warn!("waitpid error: {}", e),
        }

        if poll_ret == 0 {
            continue;
        }

        if poll_fd.revents & libc::POLLIN != 0 {
            match notif_receive(listener) {
                Ok(notif) => dispatch(notif),
                // Its caller died between poll and receive.
                Err(Errno::EAGAIN | Errno::ENOENT | Errno::EINTR) => {}
                Err(e) => warn!("Receiving notification failed: {}", e),
            }
        } else if poll_fd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            debug!("Listener hung up, no caller left with the filter");
            break;
        }
    }

    info!("Waiting for child to exit...");
    Ok(waitpid(child, None)?)
}
