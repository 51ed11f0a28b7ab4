//! `GPU_GET_PID_INFO`: the caller asks for per-process usage by PIDs from
//! its own namespace. The driver is shown host PIDs and the caller gets its
//! own PIDs back in every record.

use super::{ControlCall, alloc_payload};
use crate::ioctl::{IoctlEntry, IoctlResult};
use crate::pidns::PidRegistry;
use crate::protocol::GpuGetPidInfoParams;
use nix::errno::Errno;
use tracing::*;

pub fn translate(
    call: &ControlCall<'_>,
    original: &dyn IoctlEntry,
    registry: &dyn PidRegistry,
) -> IoctlResult {
    let mut params = alloc_payload::<GpuGetPidInfoParams>()?;
    call.copy_in(&mut *params)?;

    let mut requested: Vec<u32> = Vec::new();
    requested
        .try_reserve_exact(params.len())
        .map_err(|_| Errno::ENOMEM)?;
    requested.extend(params.records().iter().map(|record| record.pid));

    {
        let snapshot = registry.read_lock(call.caller.pid)?;
        for record in params.records_mut() {
            if let Some(process) = snapshot.find_caller_pid(record.pid) {
                let host = process.nr();
                if host != 0 {
                    record.pid = host;
                }
            }
        }
    }

    // The driver reads its request from the caller's buffer.
    call.copy_out(&*params)?;

    // On failure the caller's buffer is left holding host PIDs.
    if let Some(result) = call.call_through(original) {
        return result;
    }

    call.copy_in(&mut *params)?;
    let records = params.records_mut();
    let restored = records.len().min(requested.len());
    for (record, &pid) in records.iter_mut().zip(&requested) {
        record.pid = pid;
    }

    // Records the driver added beyond the request carry host PIDs.
    let added = &mut records[restored..];
    if !added.is_empty() {
        match registry.read_lock(call.caller.pid) {
            Ok(snapshot) => {
                for record in added.iter_mut() {
                    record.pid = snapshot
                        .find_host_pid(record.pid)
                        .map_or(0, |process| process.vnr());
                }
            }
            Err(errno) => {
                debug!("GPU_GET_PID_INFO: hiding {} added records: {}", added.len(), errno);
                added.iter_mut().for_each(|record| record.pid = 0);
            }
        }
    }

    trace!(
        "GPU_GET_PID_INFO: restored {} records for pid {}",
        restored,
        call.caller.pid
    );

    call.copy_out(&*params)?;
    Ok(0)
}
