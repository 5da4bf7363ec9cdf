//! Linux backend (spec.md §4.1, §4.4): a `fork`-based spawner that freezes
//! the child on a synchronization pipe before `execve`, plus cgroup-based
//! resource accounting.

use std::ffi::CString;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sched::{sched_setaffinity, CpuSet};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{ForkResult, Pid};

use crate::error::{self, Error, Result};
use crate::memory::MemorySize;
use crate::redirect::{self, StdStream};
use crate::spec::SubprocessSpec;

use super::{ExitObservation, FrozenProcessHandle, RunningProcessHandle, Usage};

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Error {
        let errno = e.as_errno().map(|errno| errno as i32).unwrap_or(-1);
        error::os_error("<nix>", errno)
    }
}

/// Root directory under which per-process cgroups are created. A real
/// deployment mounts cgroup v1 controllers here; tests that exercise this
/// path run under `#[cfg(unix)]` and tolerate a missing mount by degrading
/// to "no accounting" rather than failing the run.
const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Self-delivered when the child fails before `execve` (e.g. the target
/// path doesn't exist or isn't executable). The parent distinguishes this
/// from a real signal death on the user program by the signal number alone,
/// since nothing can run in the child to tag the failure any other way.
const STARTUP_FAILURE_SIGNAL: Signal = Signal::SIGUSR1;

struct Cgroup {
    name: String,
    mounted: bool,
}

impl Cgroup {
    fn controller_path(&self, controller: &str) -> PathBuf {
        Path::new(CGROUP_ROOT).join(controller).join("sandrun").join(&self.name)
    }

    /// Create the cpu/memory/pids cgroups for `pid` and attach it to each.
    /// Mirrors the per-pid-named cgroup grouping used by the daemon's own
    /// resource bookkeeping: one directory per subsystem, named after the
    /// child's pid.
    fn setup(pid: Pid, memory_limit: Option<MemorySize>, process_limit: Option<u32>) -> Cgroup {
        let name = pid.as_raw().to_string();
        let cgroup = Cgroup { name, mounted: true };

        let mut ok = true;
        for controller in ["cpu", "memory", "pids"] {
            let dir = cgroup.controller_path(controller);
            if fs::create_dir_all(&dir).is_err() {
                ok = false;
                continue;
            }
            let _ = fs::write(dir.join("cgroup.procs"), pid.as_raw().to_string());
        }

        if let Some(limit) = memory_limit {
            let path = cgroup.controller_path("memory").join("memory.limit_in_bytes");
            let _ = fs::write(path, limit.bytes().to_string());
        }
        if let Some(limit) = process_limit {
            let path = cgroup.controller_path("pids").join("pids.max");
            let _ = fs::write(path, limit.to_string());
        }

        if !ok {
            log::warn!("cgroup mount at {} unavailable; running without resource accounting", CGROUP_ROOT);
        }

        Cgroup { mounted: ok, ..cgroup }
    }

    fn cpu_time(&self) -> Duration {
        if !self.mounted {
            return Duration::default();
        }
        let path = self.controller_path("cpu").join("cpuacct.usage");
        fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_nanos)
            .unwrap_or_default()
    }

    fn peak_memory(&self) -> MemorySize {
        if !self.mounted {
            return MemorySize::Bytes(0);
        }
        let path = self.controller_path("memory").join("memory.max_usage_in_bytes");
        fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(MemorySize::Bytes)
            .unwrap_or(MemorySize::Bytes(0))
    }

    fn total_processes(&self) -> u32 {
        if !self.mounted {
            return 1;
        }
        let path = self.controller_path("pids").join("pids.events");
        // Not all kernels expose a cumulative counter; absent the file we
        // report 1 (just the child itself).
        fs::read_to_string(path).is_ok() as u32 + 1
    }

    fn remove(&self) {
        if !self.mounted {
            return;
        }
        for controller in ["cpu", "memory", "pids"] {
            let _ = fs::remove_dir(self.controller_path(controller));
        }
    }
}

pub struct LinuxFrozen {
    pid: Pid,
    sync_write: fs::File,
    cgroup: Cgroup,
    start_instant: Option<Instant>,
}

pub struct LinuxRunning {
    pid: Pid,
    cgroup: Cgroup,
    start_instant: Instant,
}

impl FrozenProcessHandle for LinuxFrozen {
    fn resume(self: Box<Self>) -> Result<Box<dyn RunningProcessHandle>> {
        let mut sync_write = self.sync_write;
        // One byte releases the child from its blocking read on the sync
        // pipe, right before it calls execve.
        sync_write.write_all(&[0u8])?;

        Ok(Box::new(LinuxRunning {
            pid: self.pid,
            cgroup: self.cgroup,
            start_instant: Instant::now(),
        }))
    }

    fn abandon(self: Box<Self>) -> Result<()> {
        nix::sys::signal::kill(self.pid, Signal::SIGKILL)?;
        let _ = waitpid(self.pid, None);
        self.cgroup.remove();
        Ok(())
    }
}

impl RunningProcessHandle for LinuxRunning {
    fn poll_usage(&self) -> Result<Usage> {
        Ok(Usage {
            user_time: self.cgroup.cpu_time(),
            kernel_time: Duration::default(),
            peak_memory: self.cgroup.peak_memory(),
            total_processes: self.cgroup.total_processes(),
        })
    }

    fn poll_exit(&self) -> Result<ExitObservation> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG))? {
            WaitStatus::StillAlive => Ok(ExitObservation::StillRunning),
            WaitStatus::Exited(_, code) => Ok(ExitObservation::Exited {
                exit_code: code as u32,
            }),
            WaitStatus::Signaled(_, sig, _) if sig == STARTUP_FAILURE_SIGNAL => {
                Ok(ExitObservation::StartupFailed)
            }
            WaitStatus::Signaled(_, sig, _) => Ok(ExitObservation::KilledBySignal {
                signal: sig as i32,
            }),
            WaitStatus::Stopped(_, sig) => Ok(ExitObservation::Stopped { signal: sig as i32 }),
            _ => Ok(ExitObservation::StillRunning),
        }
    }

    fn terminate(&self) -> Result<()> {
        nix::sys::signal::kill(self.pid, Signal::SIGKILL)?;
        Ok(())
    }

    fn reap(self: Box<Self>) -> Result<()> {
        let _ = waitpid(self.pid, None);
        self.cgroup.remove();
        Ok(())
    }
}

impl LinuxRunning {
    pub fn wall_time(&self) -> Duration {
        self.start_instant.elapsed()
    }
}

/// Create a process in the FROZEN state (spec.md §4.4, Linux algorithm).
pub fn create_frozen(spec: &SubprocessSpec) -> Result<super::FrozenCreation> {
    let argv = spec.command.argv();
    let native_argv: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_bytes()).unwrap())
        .collect();
    let native_path = native_argv[0].clone();

    let native_envs: Vec<CString> = crate::env::to_key_value_strings(&spec.environment)
        .into_iter()
        .map(|kv| CString::new(kv).unwrap())
        .collect();

    let stdin = redirect::resolve(&spec.redirects.stdin, StdStream::Stdin)?;
    let stdout = redirect::resolve(&spec.redirects.stdout, StdStream::Stdout)?;
    let stderr = if spec.redirects.join_stderr_to_stdout {
        None
    } else {
        Some(redirect::resolve(&spec.redirects.stderr, StdStream::Stderr)?)
    };

    let mut drainers = Vec::new();
    if let Some(d) = stdout.drainer {
        drainers.push((StdStream::Stdout, d));
    }
    let stderr_child_file = stderr.map(|r| {
        if let Some(d) = r.drainer {
            drainers.push((StdStream::Stderr, d));
        }
        r.child_file
    });

    let (sync_read, sync_write) = redirect::make_pipe()?;

    let lock = crate::session::fork_lock();
    let _guard = lock.lock().expect("fork lock poisoned");

    let fork_result = nix::unistd::fork()?;
    match fork_result {
        ForkResult::Parent { child } => {
            drop(sync_read);
            drop(stdin.child_file);
            drop(stdout.child_file);
            if let Some(file) = stderr_child_file {
                drop(file);
            }

            let cgroup = Cgroup::setup(child, spec.limits.hard_memory_limit, spec.limits.process_limit);

            Ok(super::FrozenCreation {
                handle: Box::new(LinuxFrozen {
                    pid: child,
                    sync_write,
                    cgroup,
                    start_instant: None,
                }),
                drainers,
            })
        }
        ForkResult::Child => {
            match child_entry(
                spec,
                native_path,
                native_argv,
                native_envs,
                stdin.child_file,
                stdout.child_file,
                stderr_child_file.flatten(),
                sync_read,
            ) {
                Ok(()) => unreachable!(),
                Err(e) => {
                    eprintln!("sandrun: failed to start child process: {}", e);
                    let _ = nix::sys::signal::kill(nix::unistd::getpid(), STARTUP_FAILURE_SIGNAL);
                    loop {
                        std::thread::sleep(Duration::from_secs(3600));
                    }
                }
            }
        }
    }
}

fn child_entry(
    spec: &SubprocessSpec,
    path: CString,
    argv: Vec<CString>,
    envs: Vec<CString>,
    stdin: Option<fs::File>,
    stdout: Option<fs::File>,
    stderr: Option<fs::File>,
    sync_read: fs::File,
) -> Result<()> {
    if let Some(file) = stdin {
        nix::unistd::dup2(file.into_raw_fd(), libc::STDIN_FILENO)?;
    }
    if let Some(file) = stdout {
        nix::unistd::dup2(file.as_raw_fd(), libc::STDOUT_FILENO)?;
        if spec.redirects.join_stderr_to_stdout {
            nix::unistd::dup2(file.as_raw_fd(), libc::STDERR_FILENO)?;
        }
    }
    if let Some(file) = stderr {
        nix::unistd::dup2(file.into_raw_fd(), libc::STDERR_FILENO)?;
    }

    if let Some(dir) = &spec.cwd {
        nix::unistd::chdir(dir.as_path())?;
    }

    if let Some(crate::identity::Identity::Linux { uid }) = &spec.identity {
        nix::unistd::setuid(nix::unistd::Uid::from_raw(*uid))?;
    }

    if let Some(mask) = spec.limits.process_affinity_mask {
        // `process_affinity_mask` is a 64-bit CPU bitmask; cap at 64 bits
        // regardless of how many CPUs `CpuSet` itself can represent.
        let mut cpu_set = CpuSet::new();
        for cpu in 0..64 {
            if mask & (1u64 << cpu) != 0 {
                cpu_set.set(cpu)?;
            }
        }
        sched_setaffinity(Pid::from_raw(0), &cpu_set)?;
    }

    // Block until the parent has finished cgroup setup and calls resume().
    let mut sync_read = sync_read;
    let mut byte = [0u8; 1];
    let _ = sync_read.read(&mut byte)?;
    drop(sync_read);

    nix::unistd::execve(&path, argv.as_ref(), envs.as_ref())?;

    unreachable!()
}
