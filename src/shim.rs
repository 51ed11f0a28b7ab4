use crate::config::ShimConfig;
use crate::device::{ControlDevice, DeviceHandle};
use crate::error::{Error, Result};
use crate::hook::{Abi, FileOperations, Hooks, InstalledHooks};
use crate::ioctl::IoctlEntry;
use crate::pidns::{PidRegistry, ProcfsRegistry};
use std::sync::Arc;
use tracing::*;

/// The loaded shim: the located device with its entry points hooked.
///
/// Load either fully succeeds or leaves nothing behind. Unloading restores
/// the original entry points before the device handle is released.
pub struct Shim<H: DeviceHandle = ControlDevice> {
    hooks: Option<InstalledHooks<H>>,
}

impl Shim<ControlDevice> {
    /// Locate the control device named by `config` and hook it.
    pub fn load(config: &ShimConfig) -> Result<Self> {
        let registry = ProcfsRegistry::default();
        registry.self_check().map_err(Error::Registry)?;
        Self::load_with(|| ControlDevice::locate(config), Arc::new(registry))
    }
}

impl<H: DeviceHandle> Shim<H> {
    pub fn load_with(
        locate: impl FnOnce() -> Result<H>,
        registry: Arc<dyn PidRegistry>,
    ) -> Result<Self> {
        let handle = locate()?;
        let hooks = Hooks::install(handle, registry);
        info!("nvidia-pidns loaded");
        Ok(Self { hooks: Some(hooks) })
    }

    pub fn is_loaded(&self) -> bool {
        self.hooks.as_ref().is_some_and(InstalledHooks::is_installed)
    }

    /// The hooked operation table, while loaded.
    pub fn operations(&self) -> Option<&Arc<FileOperations>> {
        self.hooks.as_ref().map(InstalledHooks::operations)
    }

    /// The live entry point for `abi`, while loaded.
    pub fn entry(&self, abi: Abi) -> Option<Arc<dyn IoctlEntry>> {
        self.operations().map(|operations| operations.entry(abi))
    }

    /// Restore the original entry points and release the device.
    /// Does nothing if the shim is not loaded.
    pub fn unload(&mut self) {
        if let Some(mut hooks) = self.hooks.take() {
            hooks.teardown();
            info!("nvidia-pidns unloaded");
        }
    }
}

impl<H: DeviceHandle> Drop for Shim<H> {
    fn drop(&mut self) {
        self.unload();
    }
}
