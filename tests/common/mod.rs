//! In-memory stand-ins for the caller, the driver and the process registry.

#![allow(dead_code)]

use bytemuck::Pod;
use nix::errno::Errno;
use nix::unistd::Pid;
use nvidia_pidns::protocol::{RM_CONTROL_COMMAND, RmControlParams};
use nvidia_pidns::{
    Caller, DeviceHandle, DeviceNumber, FileOperations, IoctlEntry, IoctlResult, OpenFile,
    PidRegistry, PidSnapshot, ProcessRef, Reply, UserMemory,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

pub const CALLER: i32 = 4242;

pub fn nvidiactl() -> DeviceNumber {
    DeviceNumber::new(195, 255)
}

pub fn caller(memory: &FakeMemory) -> Caller<'_> {
    Caller::new(Pid::from_raw(CALLER), memory)
}

pub fn control_file() -> OpenFile {
    OpenFile::new(5, Some(nvidiactl()))
}

/// A sparse user address space made of separately mapped regions.
pub struct FakeMemory {
    regions: Mutex<BTreeMap<u64, Vec<u8>>>,
    next: AtomicU64,
}

impl Default for FakeMemory {
    fn default() -> Self {
        Self {
            regions: Mutex::new(BTreeMap::new()),
            next: AtomicU64::new(0x1000_0000),
        }
    }
}

impl FakeMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&self, bytes: &[u8]) -> u64 {
        let addr = self.next.fetch_add(0x10_0000, Ordering::Relaxed);
        self.regions.lock().insert(addr, bytes.to_vec());
        addr
    }

    pub fn put<T: Pod>(&self, value: &T) -> u64 {
        self.map(bytemuck::bytes_of(value))
    }

    pub fn get<T: Pod>(&self, addr: u64) -> T {
        let mut value = T::zeroed();
        self.copy_from_user(addr, bytemuck::bytes_of_mut(&mut value))
            .expect("mapped");
        value
    }

    pub fn get_boxed<T: Pod>(&self, addr: u64) -> Box<T> {
        let mut value: Box<T> = bytemuck::zeroed_box();
        self.copy_from_user(addr, bytemuck::bytes_of_mut(&mut *value))
            .expect("mapped");
        value
    }

    pub fn set<T: Pod>(&self, addr: u64, value: &T) {
        self.copy_to_user(addr, bytemuck::bytes_of(value))
            .expect("mapped");
    }

    pub fn snapshot(&self) -> BTreeMap<u64, Vec<u8>> {
        self.regions.lock().clone()
    }

    fn with_region<R>(
        &self,
        addr: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, Errno> {
        let mut regions = self.regions.lock();
        let (&base, region) = regions.range_mut(..=addr).next_back().ok_or(Errno::EFAULT)?;
        let start = (addr - base) as usize;
        let end = start.checked_add(len).ok_or(Errno::EFAULT)?;
        if end > region.len() {
            return Err(Errno::EFAULT);
        }
        Ok(f(&mut region[start..end]))
    }
}

impl UserMemory for FakeMemory {
    fn copy_from_user(&self, addr: u64, buf: &mut [u8]) -> Result<(), Errno> {
        self.with_region(addr, buf.len(), |region| buf.copy_from_slice(region))
    }

    fn copy_to_user(&self, addr: u64, data: &[u8]) -> Result<(), Errno> {
        self.with_region(addr, data.len(), |region| region.copy_from_slice(data))
    }
}

type Behavior = dyn Fn(&Caller<'_>, &OpenFile, u32, u64) -> IoctlResult + Send + Sync;

/// A scripted driver entry point that counts how often it was entered.
pub struct FakeDriver {
    behavior: Box<Behavior>,
    calls: AtomicUsize,
    continues: bool,
}

impl FakeDriver {
    pub fn new(
        behavior: impl Fn(&Caller<'_>, &OpenFile, u32, u64) -> IoctlResult + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::build(behavior, false)
    }

    fn build(
        behavior: impl Fn(&Caller<'_>, &OpenFile, u32, u64) -> IoctlResult + Send + Sync + 'static,
        continues: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            behavior: Box::new(behavior),
            calls: AtomicUsize::new(0),
            continues,
        })
    }

    /// A driver that answers every call with `ret`.
    pub fn returning(ret: IoctlResult) -> Arc<Self> {
        Self::new(move |_, _, _, _| ret)
    }

    /// A driver whose forwarding lets the kernel finish the call.
    pub fn continuing() -> Arc<Self> {
        Self::build(|_, _, _, _| Ok(0), true)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl IoctlEntry for FakeDriver {
    fn call(&self, caller: &Caller<'_>, file: &OpenFile, command: u32, arg: u64) -> IoctlResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.behavior)(caller, file, command, arg)
    }

    fn forward(&self, caller: &Caller<'_>, file: &OpenFile, command: u32, arg: u64) -> Reply {
        if self.continues {
            self.calls.fetch_add(1, Ordering::SeqCst);
            return Reply::Continue;
        }
        Reply::Done(self.call(caller, file, command, arg))
    }
}

/// A registry of processes, each with a host PID and a PID in the caller's
/// namespace (`0` when the caller cannot see it).
#[derive(Default)]
pub struct FakeRegistry {
    by_host: HashMap<u32, u32>,
    read_locks: AtomicUsize,
    fail: Option<Errno>,
}

impl FakeRegistry {
    pub fn new(processes: &[(u32, u32)]) -> Arc<Self> {
        Arc::new(Self {
            by_host: processes.iter().copied().collect(),
            read_locks: AtomicUsize::new(0),
            fail: None,
        })
    }

    /// A registry whose every lock attempt fails with `errno`.
    pub fn failing(errno: Errno) -> Arc<Self> {
        Arc::new(Self {
            by_host: HashMap::new(),
            read_locks: AtomicUsize::new(0),
            fail: Some(errno),
        })
    }

    pub fn read_locks(&self) -> usize {
        self.read_locks.load(Ordering::SeqCst)
    }
}

impl PidRegistry for FakeRegistry {
    fn read_lock(&self, _caller: Pid) -> Result<Box<dyn PidSnapshot + '_>, Errno> {
        self.read_locks.fetch_add(1, Ordering::SeqCst);
        if let Some(errno) = self.fail {
            return Err(errno);
        }
        Ok(Box::new(FakeSnapshot { registry: self }))
    }
}

struct FakeSnapshot<'a> {
    registry: &'a FakeRegistry,
}

impl PidSnapshot for FakeSnapshot<'_> {
    fn find_host_pid(&self, nr: u32) -> Option<ProcessRef> {
        let local = *self.registry.by_host.get(&nr)?;
        Some(ProcessRef::new(nr, local))
    }

    fn find_caller_pid(&self, nr: u32) -> Option<ProcessRef> {
        self.registry
            .by_host
            .iter()
            .find(|&(_, &local)| local != 0 && local == nr)
            .map(|(&host, &local)| ProcessRef::new(host, local))
    }
}

/// A device handle over a caller-built operation table that records
/// whether the table had been restored by the time it was released.
pub struct FakeDevice {
    pub number: DeviceNumber,
    pub operations: Arc<FileOperations>,
    pub originals: (Arc<dyn IoctlEntry>, Arc<dyn IoctlEntry>),
    pub released: Arc<AtomicBool>,
    pub restored_before_release: Arc<AtomicBool>,
}

impl FakeDevice {
    pub fn new(native: Arc<dyn IoctlEntry>, compat: Arc<dyn IoctlEntry>) -> Self {
        Self {
            number: nvidiactl(),
            operations: Arc::new(FileOperations::new(native.clone(), compat.clone())),
            originals: (native, compat),
            released: Arc::new(AtomicBool::new(false)),
            restored_before_release: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl DeviceHandle for FakeDevice {
    fn number(&self) -> DeviceNumber {
        self.number
    }

    fn operations(&self) -> &Arc<FileOperations> {
        &self.operations
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        use nvidia_pidns::Abi;
        let restored = Arc::ptr_eq(&self.operations.entry(Abi::Native), &self.originals.0)
            && Arc::ptr_eq(&self.operations.entry(Abi::Compat), &self.originals.1);
        self.restored_before_release.store(restored, Ordering::SeqCst);
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Map an envelope for `method` pointing at `parameter`, returning its address.
pub fn envelope(memory: &FakeMemory, method: u32, parameter: u64, size: usize) -> u64 {
    memory.put(&RmControlParams {
        client: 0xc1d0_0001,
        object: 0x5c00_0080,
        method_id: method,
        flags: 0,
        parameter,
        parameter_size: size as u32,
        status: 0,
    })
}

/// Read the payload pointer back out of an envelope at `arg`.
pub fn parameter_of(memory: &dyn UserMemory, arg: u64) -> u64 {
    nvidia_pidns::ioctl::read_user::<RmControlParams>(memory, arg)
        .expect("envelope")
        .parameter
}

pub const RM_CONTROL: u32 = RM_CONTROL_COMMAND;
