//! The replacement entry point.
//!
//! Every call funnels through [`Interceptor`]. Anything that is not the
//! resource-manager control command on the target device, or that names a
//! method we do not translate, is handed to the saved original untouched.

use crate::device::DeviceNumber;
use crate::ioctl::{Caller, IoctlEntry, IoctlResult, OpenFile, Reply, read_user};
use crate::pidns::PidRegistry;
use crate::protocol::{
    GPU_GET_PID_INFO_METHOD, GPU_GET_PIDS_METHOD, RM_CONTROL_COMMAND, RmControlParams,
};
use crate::translate::{self, ControlCall};
use std::sync::Arc;
use tracing::*;

pub struct Interceptor {
    device: DeviceNumber,
    original: Arc<dyn IoctlEntry>,
    registry: Arc<dyn PidRegistry>,
}

impl Interceptor {
    pub fn new(
        device: DeviceNumber,
        original: Arc<dyn IoctlEntry>,
        registry: Arc<dyn PidRegistry>,
    ) -> Self {
        Self {
            device,
            original,
            registry,
        }
    }

    /// Translate the call if it is one of ours. `None` means pass it on.
    fn intercept(
        &self,
        caller: &Caller<'_>,
        file: &OpenFile,
        command: u32,
        arg: u64,
    ) -> Option<IoctlResult> {
        if !file.is_device(self.device) || command != RM_CONTROL_COMMAND {
            return None;
        }

        let envelope: RmControlParams = match read_user(caller.memory, arg) {
            Ok(envelope) => envelope,
            Err(errno) => {
                debug!("RM control on fd {}: envelope unreadable: {}", file.fd, errno);
                return Some(Err(errno));
            }
        };

        let original = self.original.as_ref();
        let registry = self.registry.as_ref();
        let call = ControlCall {
            caller,
            file,
            command,
            arg,
            envelope,
        };

        match envelope.method_id {
            GPU_GET_PIDS_METHOD => {
                debug!("pid {}: translating GPU_GET_PIDS", caller.pid);
                Some(translate::get_pids::translate(&call, original, registry))
            }
            GPU_GET_PID_INFO_METHOD => {
                debug!("pid {}: translating GPU_GET_PID_INFO", caller.pid);
                Some(translate::get_pid_info::translate(&call, original, registry))
            }
            method => {
                trace!("pid {}: passing through method {:#010x}", caller.pid, method);
                None
            }
        }
    }
}

impl IoctlEntry for Interceptor {
    fn call(&self, caller: &Caller<'_>, file: &OpenFile, command: u32, arg: u64) -> IoctlResult {
        match self.intercept(caller, file, command, arg) {
            Some(result) => result,
            None => self.original.call(caller, file, command, arg),
        }
    }

    fn forward(&self, caller: &Caller<'_>, file: &OpenFile, command: u32, arg: u64) -> Reply {
        match self.intercept(caller, file, command, arg) {
            Some(result) => Reply::Done(result),
            None => self.original.forward(caller, file, command, arg),
        }
    }
}
