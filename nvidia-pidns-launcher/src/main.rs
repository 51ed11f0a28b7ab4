use anyhow::{Context, Result, anyhow};
use clap::Parser;
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::sys::wait::WaitStatus;
use nix::unistd::{ForkResult, execvp, fork};
use nvidia_pidns::protocol::RM_CONTROL_COMMAND;
use nvidia_pidns::{DeviceNumber, Shim, ShimConfig};
use std::ffi::{CString, OsString};
use std::os::fd::AsFd;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use tracing::*;
use tracing_subscriber::EnvFilter;

mod fdpass;
mod seccomp;
mod supervisor;

#[derive(Parser, Debug)]
#[command(name = "nvidia-pidns-launcher")]
#[command(about = "Run a program with NVIDIA process queries translated into its PID namespace")]
#[command(version)]
struct Args {
    /// Major number of the NVIDIA control device
    #[arg(long, env = "NVIDIA_PIDNS_MAJOR", default_value_t = 195)]
    major: u64,

    /// Minor number of the NVIDIA control device
    #[arg(long, env = "NVIDIA_PIDNS_MINOR", default_value_t = 255)]
    minor: u64,

    /// Threads answering intercepted calls
    #[arg(long, env = "NVIDIA_PIDNS_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Where the temporary device scaffolding is mounted
    #[arg(long, env = "NVIDIA_PIDNS_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,

    /// Locate the device, hook and unhook it, then exit
    #[arg(long, env = "NVIDIA_PIDNS_CHECK")]
    check: bool,

    /// Program to run, followed by its arguments
    #[arg(trailing_var_arg = true, required_unless_present = "check")]
    command: Vec<OsString>,
}

impl Args {
    fn config(&self) -> ShimConfig {
        let mut config = ShimConfig {
            device: DeviceNumber::new(self.major, self.minor),
            ..ShimConfig::default()
        };
        if let Some(dir) = &self.scratch_dir {
            config.scratch_dir = dir.clone();
        }
        config
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.config();

    let mut shim = Shim::load(&config).context("failed to load nvidia-pidns")?;

    if args.check {
        info!("Control device {} located and hooked", config.device);
        shim.unload();
        return Ok(());
    }

    let argv = args
        .command
        .into_iter()
        .map(|arg| CString::new(arg.into_vec()))
        .collect::<Result<Vec<_>, _>>()
        .context("program arguments must not contain NUL bytes")?;
    let program = argv
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("no program given"))?;

    info!("Launching {:?} with seccomp filter", program);

    let (parent_sock, child_sock) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;

    match unsafe { fork()? } {
        ForkResult::Parent { child } => {
            drop(child_sock);
            debug!("Parent: forked child {}, waiting for listener", child);

            let listener = fdpass::recv_fd(parent_sock.as_fd())?
                .ok_or_else(|| anyhow!("child failed to install seccomp filter"))?;
            drop(parent_sock);

            let operations = shim
                .operations()
                .cloned()
                .ok_or_else(|| anyhow!("shim unloaded before supervision"))?;
            let status = supervisor::supervise(child, listener, &operations, args.workers)?;
            drop(operations);

            shim.unload();
            std::process::exit(exit_code(status));
        }
        ForkResult::Child => {
            drop(parent_sock);

            let listener = match seccomp::install_filter(RM_CONTROL_COMMAND) {
                Ok(fd) => fd,
                Err(e) => {
                    error!("Failed to install filter: {}", e);
                    let _ = fdpass::send_fd(child_sock.as_fd(), None);
                    std::process::exit(1);
                }
            };

            if let Err(e) = fdpass::send_fd(child_sock.as_fd(), Some(listener.as_fd())) {
                error!("Failed to send listener to parent: {}", e);
                std::process::exit(1);
            }
            drop(listener);
            drop(child_sock);

            let err = match execvp(&program, &argv) {
                Err(err) => err,
                Ok(never) => match never {},
            };
            error!("Failed to exec {:?}: {}", program, err);
            std::process::exit(127);
        }
    }
}

/// Shell convention: the exit code, or 128 plus the terminating signal.
fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 1,
    }
}
