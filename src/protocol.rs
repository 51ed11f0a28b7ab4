//! Wire layouts of the NVIDIA resource-manager control call.
//!
//! Layouts follow `nvos.h` and `ctrl2080gpu.h` from the open GPU kernel
//! modules. Padding the C compiler would insert is spelled out as explicit
//! fields so every struct is `Pod`.

use bytemuck::{Pod, Zeroable};

// ioctl direction bits
pub const IOC_NONE: u32 = 0;
pub const IOC_WRITE: u32 = 1;
pub const IOC_READ: u32 = 2;

pub const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << 30) | ((size as u32 & 0x3fff) << 16) | ((ty as u32) << 8) | nr as u32
}

pub const fn ioc_dir(cmd: u32) -> u32 {
    (cmd >> 30) & 0x3
}

pub const fn ioc_type(cmd: u32) -> u8 {
    ((cmd >> 8) & 0xff) as u8
}

pub const fn ioc_nr(cmd: u32) -> u8 {
    (cmd & 0xff) as u8
}

pub const fn ioc_size(cmd: u32) -> usize {
    ((cmd >> 16) & 0x3fff) as usize
}

/// `nv-chardev-numbers.h`
pub const NV_MAJOR_DEVICE_NUMBER: u64 = 195;
pub const NV_MINOR_DEVICE_NUMBER_CONTROL_DEVICE: u64 = 255;

pub const NV_IOCTL_MAGIC: u8 = b'F';
/// `nv_escape.h`
pub const NV_ESC_RM_CONTROL: u8 = 0x2a;

/// The one command code the interceptor inspects.
pub const RM_CONTROL_COMMAND: u32 = ioc(
    IOC_READ | IOC_WRITE,
    NV_IOCTL_MAGIC,
    NV_ESC_RM_CONTROL,
    std::mem::size_of::<RmControlParams>(),
);

/// `NV2080_CTRL_CMD_GPU_GET_PIDS`
pub const GPU_GET_PIDS_METHOD: u32 = 0x2080_018d;
/// `NV2080_CTRL_CMD_GPU_GET_PID_INFO`
pub const GPU_GET_PID_INFO_METHOD: u32 = 0x2080_018e;

pub const GPU_GET_PIDS_MAX_COUNT: usize = 950;
pub const GPU_GET_PID_INFO_MAX_COUNT: usize = 200;

/// `NVOS54_PARAMETERS`, the envelope every control call carries.
///
/// `parameter` is an `NvP64`: always 64 bits wide, so native and compat
/// callers share this layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RmControlParams {
    pub client: u32,
    pub object: u32,
    pub method_id: u32,
    pub flags: u32,
    pub parameter: u64,
    pub parameter_size: u32,
    pub status: u32,
}

/// `NV2080_CTRL_GPU_GET_PIDS_PARAMS`
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct GpuGetPidsParams {
    pub id_type: u32,
    pub id: u32,
    pub count: u32,
    pub pids: [u32; GPU_GET_PIDS_MAX_COUNT],
}

impl GpuGetPidsParams {
    /// Number of valid slots, clamped to the list capacity.
    pub fn len(&self) -> usize {
        (self.count as usize).min(GPU_GET_PIDS_MAX_COUNT)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `NV2080_CTRL_GPU_PID_INFO_VIDEO_MEMORY_USAGE_DATA`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VideoMemoryUsage {
    pub private: u64,
    pub owned: u64,
    pub duped: u64,
    pub protected_private: u64,
    pub protected_owned: u64,
    pub protected_duped: u64,
}

/// `NV2080_CTRL_GPU_PID_INFO_DATA`. The C type is a union whose only member
/// is the video memory usage record.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct GpuPidInfoData {
    pub usage: VideoMemoryUsage,
}

/// `NV2080_CTRL_SMC_SUBSCRIPTION_INFO`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SmcSubscriptionInfo {
    pub compute_instance_id: u32,
    pub gpu_instance_id: u32,
}

/// `NV2080_CTRL_GPU_PID_INFO`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct GpuPidInfo {
    pub pid: u32,
    pub index: u32,
    pub result: u32,
    pub _pad: u32,
    pub data: GpuPidInfoData,
    pub subscription: SmcSubscriptionInfo,
}

/// `NV2080_CTRL_GPU_GET_PID_INFO_PARAMS`
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct GpuGetPidInfoParams {
    pub count: u32,
    pub _pad: u32,
    pub list: [GpuPidInfo; GPU_GET_PID_INFO_MAX_COUNT],
}

impl GpuGetPidInfoParams {
    /// Number of valid records, clamped to the list capacity.
    pub fn len(&self) -> usize {
        (self.count as usize).min(GPU_GET_PID_INFO_MAX_COUNT)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> &[GpuPidInfo] {
        &self.list[..self.len()]
    }

    pub fn records_mut(&mut self) -> &mut [GpuPidInfo] {
        let len = self.len();
        &mut self.list[..len]
    }
}
