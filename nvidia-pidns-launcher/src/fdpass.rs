//! Handing the seccomp listener from the child to the supervisor over a
//! unix socket with `SCM_RIGHTS`.

use anyhow::{Result, anyhow};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use tracing::*;

const FD_SIZE: u32 = size_of::<RawFd>() as u32;

/// Send `fd` over `sock`, or a bare marker byte when there is none so the
/// receiver learns the child failed.
pub fn send_fd(sock: BorrowedFd<'_>, fd: Option<BorrowedFd<'_>>) -> Result<()> {
    let data = [1u8; 1];
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut _,
        iov_len: data.len(),
    };

    let cmsg_size = unsafe { libc::CMSG_SPACE(FD_SIZE) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_size];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(fd) = fd {
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut _;
        msg.msg_controllen = cmsg_size as _;

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(FD_SIZE) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd.as_raw_fd());
        }
    }

    let ret = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, 0) };
    if ret < 0 {
        return Err(anyhow!("sendmsg failed: {}", std::io::Error::last_os_error()));
    }
    trace!("send_fd: sent {} bytes, fd attached: {}", ret, fd.is_some());
    Ok(())
}

/// Receive a descriptor sent with [`send_fd`]. `None` means the peer sent
/// the marker without one.
pub fn recv_fd(sock: BorrowedFd<'_>) -> Result<Option<OwnedFd>> {
    let mut data = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr() as *mut _,
        iov_len: data.len(),
    };

    let cmsg_size = unsafe { libc::CMSG_SPACE(FD_SIZE) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_size];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut _;
    msg.msg_controllen = cmsg_size as _;

    let ret = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if ret < 0 {
        return Err(anyhow!("recvmsg failed: {}", std::io::Error::last_os_error()));
    }
    if ret == 0 {
        return Err(anyhow!("peer closed the socket before sending a descriptor"));
    }

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null()
            || (*cmsg).cmsg_level != libc::SOL_SOCKET
            || (*cmsg).cmsg_type != libc::SCM_RIGHTS
        {
            debug!("recv_fd: no descriptor attached");
            return Ok(None);
        }
        let fd = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const RawFd);
        Ok(Some(OwnedFd::from_raw_fd(fd)))
    }
}
