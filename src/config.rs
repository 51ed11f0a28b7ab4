use crate::device::DeviceNumber;
use crate::protocol::{NV_MAJOR_DEVICE_NUMBER, NV_MINOR_DEVICE_NUMBER_CONTROL_DEVICE};
use std::path::PathBuf;

/// Settings the shim needs to find and hook the control device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimConfig {
    /// Device number of the control device to intercept
    pub device: DeviceNumber,
    /// Parent directory for the scaffolding mount point
    pub scratch_dir: PathBuf,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            device: DeviceNumber::new(
                NV_MAJOR_DEVICE_NUMBER,
                NV_MINOR_DEVICE_NUMBER_CONTROL_DEVICE,
            ),
            scratch_dir: std::env::temp_dir(),
        }
    }
}
