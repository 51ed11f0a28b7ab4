//! Per-method payload translators.
//!
//! Each translator owns its private copy of the payload for the length of one
//! call. The order of copies and the call-through is fixed: the driver only
//! ever reads host identifiers and the caller only ever reads identifiers from
//! its own namespace.

pub mod get_pid_info;
pub mod get_pids;

use crate::ioctl::{Caller, IoctlEntry, IoctlResult, OpenFile};
use crate::protocol::RmControlParams;
use bytemuck::Pod;
use nix::errno::Errno;

/// A decoded resource-manager control call.
pub struct ControlCall<'a> {
    pub caller: &'a Caller<'a>,
    pub file: &'a OpenFile,
    pub command: u32,
    pub arg: u64,
    pub envelope: RmControlParams,
}

impl ControlCall<'_> {
    /// Run the untranslated call through the driver's own entry point.
    ///
    /// Any non-zero return is the driver's answer and ends the translation.
    fn call_through(&self, original: &dyn IoctlEntry) -> Option<IoctlResult> {
        match original.call(self.caller, self.file, self.command, self.arg) {
            Ok(0) => None,
            other => Some(other),
        }
    }

    fn copy_in<T: Pod>(&self, payload: &mut T) -> Result<(), Errno> {
        self.caller
            .memory
            .copy_from_user(self.envelope.parameter, bytemuck::bytes_of_mut(payload))
    }

    fn copy_out<T: Pod>(&self, payload: &T) -> Result<(), Errno> {
        self.caller
            .memory
            .copy_to_user(self.envelope.parameter, bytemuck::bytes_of(payload))
    }
}

/// A zeroed private payload buffer, or `ENOMEM`.
fn alloc_payload<T: Pod>() -> Result<Box<T>, Errno> {
    bytemuck::try_zeroed_box::<T>().map_err(|_| Errno::ENOMEM)
}
