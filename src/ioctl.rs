//! The calling convention shared by driver entry points and the interceptor.

use crate::device::DeviceNumber;
use bytemuck::Pod;
use nix::errno::Errno;
use nix::unistd::Pid;
use std::os::unix::io::RawFd;

/// Return value of an ioctl entry point: the syscall value or an errno.
pub type IoctlResult = Result<i64, Errno>;

/// Access to the address space of the process that issued a call.
pub trait UserMemory: Send + Sync {
    /// Fill `buf` from `addr` in the caller. Partial copies are `EFAULT`.
    fn copy_from_user(&self, addr: u64, buf: &mut [u8]) -> Result<(), Errno>;

    /// Write all of `data` to `addr` in the caller. Partial copies are `EFAULT`.
    fn copy_to_user(&self, addr: u64, data: &[u8]) -> Result<(), Errno>;
}

/// Copy a whole `T` out of user memory.
pub fn read_user<T: Pod>(memory: &dyn UserMemory, addr: u64) -> Result<T, Errno> {
    let mut value = T::zeroed();
    memory.copy_from_user(addr, bytemuck::bytes_of_mut(&mut value))?;
    Ok(value)
}

/// The execution context a call arrived on.
#[derive(Clone, Copy)]
pub struct Caller<'a> {
    /// Thread that issued the call, as seen from the supervisor
    pub pid: Pid,
    pub memory: &'a dyn UserMemory,
}

impl<'a> Caller<'a> {
    pub fn new(pid: Pid, memory: &'a dyn UserMemory) -> Self {
        Self { pid, memory }
    }
}

/// The caller's open file a call was issued on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenFile {
    /// Descriptor number in the caller's table
    pub fd: RawFd,
    /// Device number when the file is a character or block special file
    pub rdev: Option<DeviceNumber>,
}

impl OpenFile {
    pub fn new(fd: RawFd, rdev: Option<DeviceNumber>) -> Self {
        Self { fd, rdev }
    }

    pub fn is_device(&self, device: DeviceNumber) -> bool {
        self.rdev == Some(device)
    }
}

/// How a forwarded call was finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    /// The entry point ran the call; this is its result
    Done(IoctlResult),
    /// The kernel should run the caller's own syscall untouched
    Continue,
}

impl From<IoctlResult> for Reply {
    fn from(result: IoctlResult) -> Self {
        Reply::Done(result)
    }
}

/// One slot of a device's operation table.
pub trait IoctlEntry: Send + Sync {
    /// Run the call to completion and report its result.
    fn call(&self, caller: &Caller<'_>, file: &OpenFile, command: u32, arg: u64) -> IoctlResult;

    /// Hand the call on without inspecting it.
    fn forward(&self, caller: &Caller<'_>, file: &OpenFile, command: u32, arg: u64) -> Reply {
        Reply::Done(self.call(caller, file, command, arg))
    }
}
