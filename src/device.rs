//! Locating the control device.
//!
//! The device is opened through a character node created on a private tmpfs
//! in a throwaway mount namespace, so no `/dev/nvidiactl` has to exist in any
//! namespace the supervisor can see.

use crate::config::ShimConfig;
use crate::driver::DriverEntry;
use crate::error::{Error, Result};
use crate::hook::{Abi, FileOperations};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, unshare};
use nix::sys::stat::{Mode, SFlag, mknod};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::*;

/// A character device number.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceNumber(libc::dev_t);

impl DeviceNumber {
    pub fn new(major: u64, minor: u64) -> Self {
        Self(nix::sys::stat::makedev(major, minor))
    }

    pub fn from_raw(dev: libc::dev_t) -> Self {
        Self(dev)
    }

    pub fn raw(self) -> libc::dev_t {
        self.0
    }

    pub fn major(self) -> u64 {
        nix::sys::stat::major(self.0)
    }

    pub fn minor(self) -> u64 {
        nix::sys::stat::minor(self.0)
    }
}

impl fmt::Display for DeviceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major(), self.minor())
    }
}

impl fmt::Debug for DeviceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceNumber({self})")
    }
}

/// An open handle to the device whose entry points get hooked.
pub trait DeviceHandle: Send + Sync {
    fn number(&self) -> DeviceNumber;

    /// The operation table shared by every open file of this device
    fn operations(&self) -> &Arc<FileOperations>;
}

/// The open control device, held for as long as hooks are installed.
pub struct ControlDevice {
    _file: File,
    number: DeviceNumber,
    operations: Arc<FileOperations>,
}

impl ControlDevice {
    /// Open the control device named by `config.device`.
    pub fn locate(config: &ShimConfig) -> Result<Self> {
        let device = config.device;
        let scratch = config.scratch_dir.as_path();

        // unshare() only moves the calling thread, so the scaffolding lives
        // and dies with this one.
        let file = std::thread::scope(|s| {
            s.spawn(|| open_in_scaffold(device, scratch))
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("scaffold thread panicked").into()))
        })?;

        let found = DeviceNumber::from_raw(file.metadata()?.rdev());
        if found != device {
            return Err(Error::WrongDevice {
                expected: device,
                found,
            });
        }

        debug!("Located control device {}", device);

        Ok(Self {
            _file: file,
            number: device,
            operations: Arc::new(FileOperations::new(
                Arc::new(DriverEntry::new(Abi::Native)),
                Arc::new(DriverEntry::new(Abi::Compat)),
            )),
        })
    }
}

impl DeviceHandle for ControlDevice {
    fn number(&self) -> DeviceNumber {
        self.number
    }

    fn operations(&self) -> &Arc<FileOperations> {
        &self.operations
    }
}

impl Drop for ControlDevice {
    fn drop(&mut self) {
        debug!("Released control device {}", self.number);
    }
}

fn open_in_scaffold(device: DeviceNumber, scratch: &Path) -> Result<File> {
    unshare(CloneFlags::CLONE_NEWNS).map_err(scaffold_err(scratch))?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(scaffold_err(Path::new("/")))?;

    let dir = tempfile::Builder::new()
        .prefix("nvidia-pidns.")
        .tempdir_in(scratch)?;
    let scaffold = ScratchMount::new(dir.path()).map_err(scaffold_err(dir.path()))?;

    let node = scaffold.path().join("nvidiactl");
    mknod(
        &node,
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(0o600),
        device.raw(),
    )
    .map_err(|source| Error::Mknod { device, source })?;

    let opened = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(&node);

    // The open file keeps the inode alive; the node and mount are not needed
    // past this point whether or not the open succeeded.
    if let Err(e) = std::fs::remove_file(&node) {
        debug!("Failed to unlink {}: {}", node.display(), e);
    }
    drop(scaffold);
    drop(dir);

    opened.map_err(|e| {
        let source = Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO));
        match source {
            Errno::ENXIO | Errno::ENODEV | Errno::ENOENT => {
                error!(
                    "nvidia-pidns: failed to open nvidiactl ({}), is the nvidia module loaded?",
                    source
                );
                Error::DriverNotLoaded { source }
            }
            _ => {
                error!("nvidia-pidns: failed to open device {} ({})", device, source);
                Error::Open { device, source }
            }
        }
    })
}

fn scaffold_err(path: &Path) -> impl FnOnce(Errno) -> Error + use<> {
    let path = path.to_path_buf();
    move |source| Error::Scaffold { path, source }
}

/// A tmpfs mounted over a scratch directory, detached on drop.
struct ScratchMount {
    path: PathBuf,
}

impl ScratchMount {
    fn new(path: &Path) -> std::result::Result<Self, Errno> {
        mount(
            Some("nvidia_pidns"),
            path,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some("mode=0700,size=16k"),
        )?;
        trace!("Mounted scaffolding at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchMount {
    fn drop(&mut self) {
        if let Err(e) = umount2(&self.path, MntFlags::MNT_DETACH) {
            warn!("Failed to unmount {}: {}", self.path.display(), e);
        }
    }
}
