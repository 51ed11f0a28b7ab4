//! nvidia-pidns - PID namespace translation for the NVIDIA control device
//!
//! This library intercepts the generic resource-manager control ioctl issued
//! against `/dev/nvidiactl` and rewrites the process identifiers carried by
//! two of its methods, so that a workload running in its own PID namespace
//! only ever sees and supplies identifiers that are meaningful there, while
//! the driver keeps operating on host identifiers.

pub mod config;
pub mod device;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod hook;
pub mod ioctl;
pub mod memory;
pub mod pidns;
pub mod protocol;
pub mod shim;
pub mod translate;

pub use config::ShimConfig;
pub use device::{ControlDevice, DeviceHandle, DeviceNumber};
pub use dispatch::Interceptor;
pub use error::{Error, Result};
pub use hook::{Abi, FileOperations, Hooks, InstalledHooks};
pub use ioctl::{Caller, IoctlEntry, IoctlResult, OpenFile, Reply, UserMemory};
pub use pidns::{PidRegistry, PidSnapshot, ProcessRef, ProcfsRegistry};
pub use shim::Shim;
