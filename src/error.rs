use crate::device::DeviceNumber;
use nix::errno::Errno;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to prepare scaffolding at {path}: {source}")]
    Scaffold {
        path: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("failed to create device node {device}: {source}")]
    Mknod {
        device: DeviceNumber,
        #[source]
        source: Errno,
    },

    #[error("failed to open nvidiactl ({source}), is the nvidia module loaded?")]
    DriverNotLoaded {
        #[source]
        source: Errno,
    },

    #[error("failed to open device {device}: {source}")]
    Open {
        device: DeviceNumber,
        #[source]
        source: Errno,
    },

    #[error("opened file is device {found}, expected {expected}")]
    WrongDevice {
        expected: DeviceNumber,
        found: DeviceNumber,
    },

    #[error("process registry unavailable: {0}")]
    Registry(Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
