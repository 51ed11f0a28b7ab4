//! Saving, replacing and restoring a device's two ioctl entry points.

use crate::device::DeviceHandle;
use crate::dispatch::Interceptor;
use crate::ioctl::IoctlEntry;
use crate::pidns::PidRegistry;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};
use tracing::*;

/// Which entry point a call arrives through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Abi {
    /// Callers of the supervisor's own architecture (`unlocked_ioctl`)
    Native,
    /// 32-bit callers on a 64-bit host (`compat_ioctl`)
    Compat,
}

/// The ioctl slots of a device's operation table.
///
/// Readers take a clone of the slot's current entry and release the lock
/// before calling into it, so no lock is held across a driver call.
pub struct FileOperations {
    unlocked_ioctl: RwLock<Arc<dyn IoctlEntry>>,
    compat_ioctl: RwLock<Arc<dyn IoctlEntry>>,
}

impl FileOperations {
    pub fn new(unlocked_ioctl: Arc<dyn IoctlEntry>, compat_ioctl: Arc<dyn IoctlEntry>) -> Self {
        Self {
            unlocked_ioctl: RwLock::new(unlocked_ioctl),
            compat_ioctl: RwLock::new(compat_ioctl),
        }
    }

    fn slot(&self, abi: Abi) -> &RwLock<Arc<dyn IoctlEntry>> {
        match abi {
            Abi::Native => &self.unlocked_ioctl,
            Abi::Compat => &self.compat_ioctl,
        }
    }

    /// The entry point currently installed for `abi`.
    pub fn entry(&self, abi: Abi) -> Arc<dyn IoctlEntry> {
        self.slot(abi).read().clone()
    }

    fn replace(&self, abi: Abi, entry: Arc<dyn IoctlEntry>) -> Arc<dyn IoctlEntry> {
        std::mem::replace(&mut *self.slot(abi).write(), entry)
    }
}

/// The originals captured at install time.
#[derive(Clone)]
struct SavedEntryPoints {
    unlocked_ioctl: Arc<dyn IoctlEntry>,
    compat_ioctl: Arc<dyn IoctlEntry>,
}

pub struct Hooks;

impl Hooks {
    /// Capture both entry points of `handle`'s table, then point both slots
    /// at interceptors wrapping them.
    pub fn install<H: DeviceHandle>(handle: H, registry: Arc<dyn PidRegistry>) -> InstalledHooks<H> {
        let operations = handle.operations().clone();
        let device = handle.number();

        let saved = SavedEntryPoints {
            unlocked_ioctl: operations.entry(Abi::Native),
            compat_ioctl: operations.entry(Abi::Compat),
        };

        let unlocked: Arc<dyn IoctlEntry> = Arc::new(Interceptor::new(
            device,
            saved.unlocked_ioctl.clone(),
            registry.clone(),
        ));
        let compat: Arc<dyn IoctlEntry> =
            Arc::new(Interceptor::new(device, saved.compat_ioctl.clone(), registry));

        fence(Ordering::Release);
        operations.replace(Abi::Native, unlocked);
        operations.replace(Abi::Compat, compat);

        debug!("Hooked ioctl entry points of device {}", device);

        InstalledHooks {
            handle: Some(handle),
            operations,
            saved,
        }
    }
}

/// Hooks installed on a device. Dropping this tears them down.
pub struct InstalledHooks<H: DeviceHandle> {
    handle: Option<H>,
    operations: Arc<FileOperations>,
    saved: SavedEntryPoints,
}

impl<H: DeviceHandle> InstalledHooks<H> {
    pub fn handle(&self) -> Option<&H> {
        self.handle.as_ref()
    }

    pub fn operations(&self) -> &Arc<FileOperations> {
        &self.operations
    }

    pub fn is_installed(&self) -> bool {
        self.handle.is_some()
    }

    /// Write the saved originals back, then release the device handle.
    /// Calling this again is a no-op.
    pub fn teardown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        self.operations
            .replace(Abi::Native, self.saved.unlocked_ioctl.clone());
        self.operations
            .replace(Abi::Compat, self.saved.compat_ioctl.clone());
        fence(Ordering::Release);

        debug!("Restored ioctl entry points of device {}", handle.number());
        drop(handle);
    }
}

impl<H: DeviceHandle> Drop for InstalledHooks<H> {
    fn drop(&mut self) {
        self.teardown();
    }
}
