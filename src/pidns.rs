//! Resolving process identifiers across PID namespaces.
//!
//! [`PidRegistry::read_lock`] opens a read-side view of the process registry
//! for one caller. Lookups through the view never block processes from
//! starting or exiting; a process that goes away mid-lookup simply does not
//! resolve.

use nix::errno::Errno;
use nix::unistd::Pid;
use std::cell::OnceCell;
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::*;

/// A resolved process, projected into the host's and the caller's namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessRef {
    host: u32,
    local: u32,
}

impl ProcessRef {
    pub fn new(host: u32, local: u32) -> Self {
        Self { host, local }
    }

    /// PID in the host namespace
    pub fn nr(&self) -> u32 {
        self.host
    }

    /// PID in the caller's namespace, `0` when the process is not visible there
    pub fn vnr(&self) -> u32 {
        self.local
    }
}

/// A consistent read-side view of the registry, scoped to one caller.
pub trait PidSnapshot {
    /// Resolve a PID from the host namespace.
    fn find_host_pid(&self, nr: u32) -> Option<ProcessRef>;

    /// Resolve a PID from the caller's own namespace.
    ///
    /// Below the supervisor's namespace only thread-group leaders are found;
    /// a thread id from the caller's namespace does not resolve there.
    fn find_caller_pid(&self, nr: u32) -> Option<ProcessRef>;
}

pub trait PidRegistry: Send + Sync {
    fn read_lock(&self, caller: Pid) -> Result<Box<dyn PidSnapshot + '_>, Errno>;
}

// NS_GET_PARENT from linux/nsfs.h
nix::ioctl_none!(ns_get_parent, 0xb7, 0x2);

/// Identity of a namespace: device and inode of its nsfs entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct NamespaceId {
    dev: u64,
    ino: u64,
}

/// The registry as exposed by procfs.
#[derive(Debug, Clone)]
pub struct ProcfsRegistry {
    root: PathBuf,
}

impl Default for ProcfsRegistry {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcfsRegistry {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// The `NSpid:` chain of `pid`, outermost namespace first.
    fn nspid(&self, pid: u32) -> Option<Vec<u32>> {
        let status = std::fs::read_to_string(self.root.join(pid.to_string()).join("status")).ok()?;
        parse_nspid(&status).or_else(|| Some(vec![pid]))
    }

    /// The PID namespace `hops` levels above the one `pid` lives in.
    fn ancestor_namespace(&self, pid: u32, hops: usize) -> Result<NamespaceId, Errno> {
        let path = self.root.join(pid.to_string()).join("ns/pid");
        let mut ns = File::open(&path).map_err(io_errno)?;

        for _ in 0..hops {
            let parent = unsafe { ns_get_parent(ns.as_raw_fd()) }?;
            // SAFETY: NS_GET_PARENT returns a new descriptor we now own.
            ns = unsafe { File::from_raw_fd(parent) };
        }

        let meta = ns.metadata().map_err(io_errno)?;
        Ok(NamespaceId {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    /// Check that the registry can resolve the calling process.
    pub fn self_check(&self) -> Result<(), Errno> {
        self.read_lock(Pid::this()).map(drop)
    }

    fn live_pids(&self) -> Vec<u32> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .collect()
    }
}

impl PidRegistry for ProcfsRegistry {
    fn read_lock(&self, caller: Pid) -> Result<Box<dyn PidSnapshot + '_>, Errno> {
        let caller_pid = caller.as_raw() as u32;
        let chain = self.nspid(caller_pid).ok_or(Errno::ESRCH)?;
        let namespace = self.ancestor_namespace(caller_pid, 0)?;

        trace!(
            "pid {}: namespace level {}, nsfs {}:{}",
            caller,
            chain.len() - 1,
            namespace.dev,
            namespace.ino
        );

        Ok(Box::new(ProcfsSnapshot {
            registry: self,
            namespace,
            level: chain.len() - 1,
            by_local: OnceCell::new(),
        }))
    }
}

struct ProcfsSnapshot<'a> {
    registry: &'a ProcfsRegistry,
    /// The caller's PID namespace
    namespace: NamespaceId,
    /// Depth of the caller's namespace below the supervisor's
    level: usize,
    by_local: OnceCell<HashMap<u32, ProcessRef>>,
}

impl ProcfsSnapshot<'_> {
    fn project(&self, host: u32, chain: &[u32]) -> Option<ProcessRef> {
        let depth = chain.len().checked_sub(1)?;
        if depth < self.level {
            return Some(ProcessRef::new(host, 0));
        }

        let ancestor = self
            .registry
            .ancestor_namespace(host, depth - self.level)
            .ok()?;
        let local = if ancestor == self.namespace {
            chain[self.level]
        } else {
            0
        };
        Some(ProcessRef::new(host, local))
    }

    fn scan(&self) -> HashMap<u32, ProcessRef> {
        let mut visible = HashMap::new();
        for host in self.registry.live_pids() {
            let Some(chain) = self.registry.nspid(host) else {
                continue;
            };
            if chain.len() <= self.level {
                continue;
            }
            if let Some(process) = self.project(host, &chain) {
                if process.vnr() != 0 {
                    visible.insert(process.vnr(), process);
                }
            }
        }
        debug!(
            "Scanned registry: {} processes visible at level {}",
            visible.len(),
            self.level
        );
        visible
    }
}

impl PidSnapshot for ProcfsSnapshot<'_> {
    fn find_host_pid(&self, nr: u32) -> Option<ProcessRef> {
        if nr == 0 {
            return None;
        }
        let chain = self.registry.nspid(nr)?;
        self.project(nr, &chain)
    }

    // The reverse map is built from the numeric entries of `/proc`, which
    // list thread-group leaders only.
    fn find_caller_pid(&self, nr: u32) -> Option<ProcessRef> {
        if nr == 0 {
            return None;
        }
        if self.level == 0 {
            return self
                .find_host_pid(nr)
                .filter(|process| process.vnr() == nr);
        }
        self.by_local.get_or_init(|| self.scan()).get(&nr).copied()
    }
}

fn parse_nspid(status: &str) -> Option<Vec<u32>> {
    let line = status.lines().find_map(|line| line.strip_prefix("NSpid:"))?;
    let chain: Vec<u32> = line
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    if chain.is_empty() { None } else { Some(chain) }
}

fn io_errno(e: std::io::Error) -> Errno {
    Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO))
}
