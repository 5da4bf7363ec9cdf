//! Owns the state-machine transitions a subprocess goes through
//! (spec.md §3: SPECIFIED → FROZEN → RUNNING → TERMINATED → REAPED).

use crate::error::Result;
use crate::platform::{self, FrozenCreation, RunningProcessHandle};
use crate::redirect::{Drainer, StdStream};
use crate::spec::SubprocessSpec;

/// A process in the FROZEN state: created, all limits bound, not yet
/// resumed.
pub struct FrozenProcess {
    handle: Box<dyn platform::FrozenProcessHandle>,
    drainers: Vec<(StdStream, Drainer)>,
}

impl FrozenProcess {
    /// Create a process in the FROZEN state for `spec` (spec.md §4.4).
    pub fn create(spec: &SubprocessSpec) -> Result<FrozenProcess> {
        let FrozenCreation { handle, drainers } = platform::create_frozen(spec)?;
        Ok(FrozenProcess { handle, drainers })
    }

    /// Leave FROZEN: the process may now execute user code
    /// (spec.md §4.5, `Unfreeze`).
    pub fn resume(self) -> Result<RunningProcess> {
        let handle = self.handle.resume()?;
        Ok(RunningProcess {
            handle,
            drainers: self.drainers,
        })
    }

    /// Abort without ever resuming (used when a sibling in an interconnect
    /// pair fails to reach FROZEN).
    pub fn abandon(self) -> Result<()> {
        self.handle.abandon()
    }
}

/// A process in the RUNNING state (or TERMINATED, pending reap).
pub struct RunningProcess {
    handle: Box<dyn RunningProcessHandle>,
    drainers: Vec<(StdStream, Drainer)>,
}

impl RunningProcess {
    pub fn poll_usage(&self) -> Result<platform::Usage> {
        self.handle.poll_usage()
    }

    pub fn poll_exit(&self) -> Result<platform::ExitObservation> {
        self.handle.poll_exit()
    }

    pub fn terminate(&self) -> Result<()> {
        self.handle.terminate()
    }

    /// Reach REAPED: release all OS handles, then join every drainer and
    /// hand back whatever each one captured.
    pub fn reap(self) -> Result<Vec<(StdStream, Vec<u8>)>> {
        self.handle.reap()?;
        Ok(self
            .drainers
            .into_iter()
            .map(|(stream, drainer)| (stream, drainer.join()))
            .collect())
    }
}
