//! Platform primitives (spec.md §4.1): the thin, typed contract over OS
//! facilities that the rest of the crate builds on. Everything above this
//! module is platform-agnostic; everything here is not.

use std::time::Duration;

use crate::error::Result;
use crate::memory::MemorySize;
use crate::redirect::{Drainer, StdStream};
use crate::spec::SubprocessSpec;

#[cfg(unix)]
pub mod linux;
#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub use linux as backend;
#[cfg(windows)]
pub use windows as backend;

/// A snapshot of resource usage, read from the cgroup (Linux) or job object
/// / process handle (Windows).
#[derive(Clone, Copy, Debug, Default)]
pub struct Usage {
    pub user_time: Duration,
    pub kernel_time: Duration,
    pub peak_memory: MemorySize,
    pub total_processes: u32,
}

/// The outcome observed by a non-blocking wait on the frozen/running process.
#[derive(Clone, Copy, Debug)]
pub enum ExitObservation {
    /// Still running; no status change observed.
    StillRunning,
    Exited { exit_code: u32 },
    KilledBySignal { signal: i32 },
    Stopped { signal: i32 },
    /// The child never reached the user program: it signaled the daemon's
    /// own startup-failure protocol before `execve` (Linux: self-delivered
    /// `SIGUSR1`). Distinguished from `KilledBySignal` so the runner can
    /// report this as a `UserError` rather than a normal signal death.
    StartupFailed,
}

/// A process created in the FROZEN state (spec.md §3): all redirects bound,
/// all limits pre-installed, no user instruction has executed yet.
pub trait FrozenProcessHandle {
    /// Leave FROZEN: let the first user instruction execute.
    fn resume(self: Box<Self>) -> Result<Box<dyn RunningProcessHandle>>;

    /// Abort a frozen process without ever resuming it (used when creation
    /// of a sibling in an interconnect pair fails).
    fn abandon(self: Box<Self>) -> Result<()>;
}

/// A process in the RUNNING (or already-TERMINATED-but-not-yet-REAPED)
/// state.
pub trait RunningProcessHandle: Send {
    fn poll_usage(&self) -> Result<Usage>;
    fn poll_exit(&self) -> Result<ExitObservation>;
    fn terminate(&self) -> Result<()>;

    /// Block until the process has fully exited and release all OS handles
    /// it owns. Idempotent ownership release is the caller's (runner's)
    /// responsibility; this only performs the wait/close.
    fn reap(self: Box<Self>) -> Result<()>;
}

/// Everything `create_frozen` hands back: the platform handle plus any
/// drainer threads spawned for `Memory` redirects, which the runner must
/// join during finalization (spec.md §4.5, "Await all output drainers to
/// quiesce").
pub struct FrozenCreation {
    pub handle: Box<dyn FrozenProcessHandle>,
    pub drainers: Vec<(StdStream, Drainer)>,
}

/// Create a process in the FROZEN state for the given spec (spec.md §4.4).
pub fn create_frozen(spec: &SubprocessSpec) -> Result<FrozenCreation> {
    backend::create_frozen(spec)
}
