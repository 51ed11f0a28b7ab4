use crate::ioctl::UserMemory;
use nix::errno::Errno;
use nix::unistd::Pid;

/// Memory of a traced process, accessed with `process_vm_readv`/`process_vm_writev`.
#[derive(Debug, Clone, Copy)]
pub struct ProcessMemory {
    pid: Pid,
}

impl ProcessMemory {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }
}

impl UserMemory for ProcessMemory {
    fn copy_from_user(&self, addr: u64, buf: &mut [u8]) -> Result<(), Errno> {
        if buf.is_empty() {
            return Ok(());
        }

        let local_iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut _,
            iov_len: buf.len(),
        };

        let remote_iov = libc::iovec {
            iov_base: addr as usize as *mut _,
            iov_len: buf.len(),
        };

        let ret = unsafe { libc::process_vm_readv(self.pid.as_raw(), &local_iov, 1, &remote_iov, 1, 0) };

        if ret < 0 {
            return Err(fault(Errno::last()));
        }
        if ret as usize != buf.len() {
            return Err(Errno::EFAULT);
        }

        Ok(())
    }

    fn copy_to_user(&self, addr: u64, data: &[u8]) -> Result<(), Errno> {
        if data.is_empty() {
            return Ok(());
        }

        let local_iov = libc::iovec {
            iov_base: data.as_ptr() as *mut _,
            iov_len: data.len(),
        };

        let remote_iov = libc::iovec {
            iov_base: addr as usize as *mut _,
            iov_len: data.len(),
        };

        let ret =
            unsafe { libc::process_vm_writev(self.pid.as_raw(), &local_iov, 1, &remote_iov, 1, 0) };

        if ret < 0 {
            return Err(fault(Errno::last()));
        }
        if ret as usize != data.len() {
            return Err(Errno::EFAULT);
        }

        Ok(())
    }
}

/// The caller sees a bad pointer; a vanished caller is reported as such.
fn fault(errno: Errno) -> Errno {
    match errno {
        Errno::ESRCH => Errno::ESRCH,
        _ => Errno::EFAULT,
    }
}
