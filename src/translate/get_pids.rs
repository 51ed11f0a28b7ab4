//! `GPU_GET_PIDS`: the driver lists host PIDs of a GPU object's users;
//! the caller gets them in its own namespace.

use super::{ControlCall, alloc_payload};
use crate::ioctl::{IoctlEntry, IoctlResult};
use crate::pidns::PidRegistry;
use crate::protocol::GpuGetPidsParams;
use tracing::*;

pub fn translate(
    call: &ControlCall<'_>,
    original: &dyn IoctlEntry,
    registry: &dyn PidRegistry,
) -> IoctlResult {
    if let Some(result) = call.call_through(original) {
        return result;
    }

    let mut params = alloc_payload::<GpuGetPidsParams>()?;
    call.copy_in(&mut *params)?;

    let count = params.len();
    let kept = {
        let snapshot = match registry.read_lock(call.caller.pid) {
            Ok(snapshot) => snapshot,
            Err(errno) => {
                // Host PIDs must not reach the caller.
                params.pids.fill(0);
                params.count = 0;
                call.copy_out(&*params)?;
                return Err(errno);
            }
        };
        compact(&mut params.pids[..count], |host| {
            snapshot
                .find_host_pid(host)
                .map(|process| process.vnr())
                .filter(|&local| local != 0)
        })
    };

    params.pids[kept..].fill(0);
    params.count = kept as u32;

    trace!(
        "GPU_GET_PIDS: kept {} of {} pids for pid {}",
        kept, count, call.caller.pid
    );

    call.copy_out(&*params)?;
    Ok(0)
}

/// Replace each PID with its projection, dropping those without one and
/// moving survivors to the front in their original order.
fn compact(pids: &mut [u32], project: impl Fn(u32) -> Option<u32>) -> usize {
    let mut wrote = 0;
    for i in 0..pids.len() {
        if let Some(projected) = project(pids[i]) {
            pids[wrote] = projected;
            wrote += 1;
        }
    }
    wrote
}
