use anyhow::{Result, anyhow};
use libc::c_ulong;
use nix::errno::Errno;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use tracing::*;

const SECCOMP_SET_MODE_FILTER: c_ulong = 1;
const SECCOMP_FILTER_FLAG_NEW_LISTENER: c_ulong = 1 << 3;
pub const SECCOMP_USER_NOTIF_FLAG_CONTINUE: u32 = 1;

const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_USER_NOTIF: u32 = 0x7fc0_0000;

const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

// Offsets into struct seccomp_data
const NR_OFFSET: u32 = 0;
const ARCH_OFFSET: u32 = 4;
#[cfg(target_endian = "little")]
const COMMAND_OFFSET: u32 = 24;
#[cfg(target_endian = "big")]
const COMMAND_OFFSET: u32 = 28;

#[cfg(target_arch = "x86_64")]
pub const AUDIT_ARCH_NATIVE: u32 = 0xc000_003e;
#[cfg(target_arch = "aarch64")]
pub const AUDIT_ARCH_NATIVE: u32 = 0xc000_00b7;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("nvidia-pidns-launcher supports x86_64 and aarch64 only");

#[cfg(target_arch = "x86_64")]
pub const AUDIT_ARCH_COMPAT: Option<u32> = Some(0x4000_0003);
#[cfg(not(target_arch = "x86_64"))]
pub const AUDIT_ARCH_COMPAT: Option<u32> = None;

/// ioctl in the i386 syscall table
const COMPAT_SYS_IOCTL: u32 = 54;

const SECCOMP_IOC_MAGIC: c_ulong = b'!' as c_ulong;

const fn ioc(dir: c_ulong, nr: c_ulong, size: usize) -> c_ulong {
    (dir << 30) | ((size as c_ulong) << 16) | (SECCOMP_IOC_MAGIC << 8) | nr
}

const SECCOMP_IOCTL_NOTIF_RECV: c_ulong = ioc(3, 0, size_of::<SeccompNotif>());
const SECCOMP_IOCTL_NOTIF_SEND: c_ulong = ioc(3, 1, size_of::<SeccompNotifResp>());
const SECCOMP_IOCTL_NOTIF_ID_VALID: c_ulong = ioc(1, 2, size_of::<u64>());

#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *const libc::sock_filter,
}

/// Kernel `struct seccomp_data`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SeccompData {
    pub nr: i32,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

/// Kernel `struct seccomp_notif`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SeccompNotif {
    pub id: u64,
    pub pid: u32,
    pub flags: u32,
    pub data: SeccompData,
}

/// Kernel `struct seccomp_notif_resp`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeccompNotifResp {
    pub id: u64,
    pub val: i64,
    pub error: i32,
    pub flags: u32,
}

impl SeccompNotifResp {
    pub fn success(id: u64, val: i64) -> Self {
        Self {
            id,
            val,
            error: 0,
            flags: 0,
        }
    }

    pub fn error(id: u64, errno: Errno) -> Self {
        Self {
            id,
            val: -1,
            error: -(errno as i32),
            flags: 0,
        }
    }

    /// Let the kernel run the syscall as the caller issued it.
    pub fn continuing(id: u64) -> Self {
        Self {
            id,
            val: 0,
            error: 0,
            flags: SECCOMP_USER_NOTIF_FLAG_CONTINUE,
        }
    }
}

/// Install a filter that notifies on the control ioctl and return the
/// listener. The calling thread is restricted with `PR_SET_NO_NEW_PRIVS`.
pub fn install_filter(command: u32) -> Result<OwnedFd> {
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret < 0 {
        return Err(anyhow!("prctl(PR_SET_NO_NEW_PRIVS) failed: {}", Errno::last()));
    }

    let filter = build_filter(command);
    let prog = SockFprog {
        len: filter.len() as u16,
        filter: filter.as_ptr(),
    };

    let ret = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            SECCOMP_FILTER_FLAG_NEW_LISTENER,
            &prog as *const SockFprog,
        )
    };
    if ret < 0 {
        return Err(anyhow!("seccomp failed: {}", Errno::last()));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(ret as i32) })
}

/// Syscall numbers of ioctl per audit architecture the filter accepts.
pub fn ioctl_syscalls() -> Vec<(u32, u32)> {
    let mut arches = vec![(AUDIT_ARCH_NATIVE, libc::SYS_ioctl as u32)];
    if let Some(compat) = AUDIT_ARCH_COMPAT {
        arches.push((compat, COMPAT_SYS_IOCTL));
    }
    arches
}

fn stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn jeq(k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter {
        code: BPF_JMP | BPF_JEQ | BPF_K,
        jt,
        jf,
        k,
    }
}

/// One seven-instruction block per architecture. A block whose arch does not
/// match is skipped with the arch still in the accumulator.
pub fn build_filter(command: u32) -> Vec<libc::sock_filter> {
    let mut filter = vec![stmt(BPF_LD | BPF_W | BPF_ABS, ARCH_OFFSET)];

    for (arch, nr) in ioctl_syscalls() {
        filter.extend([
            jeq(arch, 0, 6),
            stmt(BPF_LD | BPF_W | BPF_ABS, NR_OFFSET),
            jeq(nr, 0, 3),
            stmt(BPF_LD | BPF_W | BPF_ABS, COMMAND_OFFSET),
            jeq(command, 0, 1),
            stmt(BPF_RET | BPF_K, SECCOMP_RET_USER_NOTIF),
            stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
        ]);
    }

    filter.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));

    debug!("Built BPF filter with {} instructions", filter.len());
    filter
}

pub fn notif_receive(listener: BorrowedFd<'_>) -> Result<SeccompNotif, Errno> {
    let mut req: SeccompNotif = unsafe { std::mem::zeroed() };
    let ret = unsafe {
        libc::ioctl(
            listener.as_raw_fd(),
            SECCOMP_IOCTL_NOTIF_RECV as _,
            &mut req as *mut SeccompNotif,
        )
    };
    if ret < 0 {
        return Err(Errno::last());
    }
    Ok(req)
}

pub fn notif_respond(listener: BorrowedFd<'_>, resp: &SeccompNotifResp) -> Result<(), Errno> {
    trace!(
        "Respond: id={}, val={}, error={}, flags={:#x}",
        resp.id, resp.val, resp.error, resp.flags
    );

    let ret = unsafe {
        libc::ioctl(
            listener.as_raw_fd(),
            SECCOMP_IOCTL_NOTIF_SEND as _,
            resp as *const SeccompNotifResp,
        )
    };
    if ret < 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Whether the notification `id` still has a blocked caller behind it.
pub fn notif_id_valid(listener: BorrowedFd<'_>, id: u64) -> bool {
    let ret = unsafe {
        libc::ioctl(
            listener.as_raw_fd(),
            SECCOMP_IOCTL_NOTIF_ID_VALID as _,
            &id as *const u64,
        )
    };
    ret == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Evaluate the subset of classic BPF the filter uses.
    fn run(filter: &[libc::sock_filter], data: &SeccompData) -> u32 {
        let bytes: &[u8] = unsafe {
            std::slice::from_raw_parts(
                data as *const SeccompData as *const u8,
                size_of::<SeccompData>(),
            )
        };
        let mut acc = 0u32;
        let mut pc = 0usize;
        loop {
            let insn = filter[pc];
            pc += 1;
            match insn.code {
                c if c == BPF_LD | BPF_W | BPF_ABS => {
                    let k = insn.k as usize;
                    acc = u32::from_ne_bytes(bytes[k..k + 4].try_into().unwrap());
                }
                c if c == BPF_JMP | BPF_JEQ | BPF_K => {
                    let offset = if acc == insn.k { insn.jt } else { insn.jf };
                    pc += offset as usize;
                }
                c if c == BPF_RET | BPF_K => return insn.k,
                other => panic!("unexpected opcode {other:#x}"),
            }
        }
    }

    fn syscall(arch: u32, nr: u32, command: u64) -> SeccompData {
        SeccompData {
            nr: nr as i32,
            arch,
            instruction_pointer: 0,
            args: [3, command, 0x7fff_0000, 0, 0, 0],
        }
    }

    const COMMAND: u32 = 0xc020_462a;

    #[test]
    fn notifies_on_the_control_ioctl() {
        let filter = build_filter(COMMAND);
        let nr = libc::SYS_ioctl as u32;
        assert_eq!(
            run(&filter, &syscall(AUDIT_ARCH_NATIVE, nr, COMMAND as u64)),
            SECCOMP_RET_USER_NOTIF
        );
    }

    #[test]
    fn matches_only_the_low_word_of_the_command() {
        let filter = build_filter(COMMAND);
        let nr = libc::SYS_ioctl as u32;
        let sign_extended = 0xffff_ffff_0000_0000 | COMMAND as u64;
        assert_eq!(
            run(&filter, &syscall(AUDIT_ARCH_NATIVE, nr, sign_extended)),
            SECCOMP_RET_USER_NOTIF
        );
    }

    #[test]
    fn allows_other_ioctls_and_syscalls() {
        let filter = build_filter(COMMAND);
        let nr = libc::SYS_ioctl as u32;
        assert_eq!(
            run(&filter, &syscall(AUDIT_ARCH_NATIVE, nr, 0xc010_4629)),
            SECCOMP_RET_ALLOW
        );
        assert_eq!(
            run(
                &filter,
                &syscall(AUDIT_ARCH_NATIVE, libc::SYS_read as u32, COMMAND as u64)
            ),
            SECCOMP_RET_ALLOW
        );
        assert_eq!(
            run(&filter, &syscall(0x1234_5678, nr, COMMAND as u64)),
            SECCOMP_RET_ALLOW
        );
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn notifies_compat_callers_by_their_own_syscall_number() {
        let filter = build_filter(COMMAND);
        let compat = AUDIT_ARCH_COMPAT.unwrap();
        assert_eq!(
            run(&filter, &syscall(compat, COMPAT_SYS_IOCTL, COMMAND as u64)),
            SECCOMP_RET_USER_NOTIF
        );
        // 16 is ioctl natively but lchown for i386.
        assert_eq!(
            run(
                &filter,
                &syscall(compat, libc::SYS_ioctl as u32, COMMAND as u64)
            ),
            SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn kernel_struct_sizes() {
        assert_eq!(size_of::<SeccompData>(), 64);
        assert_eq!(size_of::<SeccompNotif>(), 80);
        assert_eq!(size_of::<SeccompNotifResp>(), 24);
        assert_eq!(SECCOMP_IOCTL_NOTIF_RECV, 0xc050_2100);
        assert_eq!(SECCOMP_IOCTL_NOTIF_SEND, 0xc018_2101);
        assert_eq!(SECCOMP_IOCTL_NOTIF_ID_VALID, 0x4008_2102);
    }

    #[test]
    fn error_responses_carry_negative_errno() {
        let resp = SeccompNotifResp::error(9, Errno::EFAULT);
        assert_eq!(resp.error, -libc::EFAULT);
        assert_eq!(SeccompNotifResp::continuing(9).flags, SECCOMP_USER_NOTIF_FLAG_CONTINUE);
    }
}
