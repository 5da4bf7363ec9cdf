//! The result record produced once a subprocess reaches REAPED (spec.md §3).

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::limits::SuccessCode;
use crate::memory::MemorySize;

/// A complete, well-typed account of one finished run.
///
/// Frozen at REAPED: nothing mutates a `ResultRecord` once the runner hands
/// it back, matching the invariant that output/error buffers stop growing
/// once the process has been reaped.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResultRecord {
    pub wall_time: Duration,
    pub user_time: Duration,
    pub kernel_time: Duration,

    /// Peak resident memory observed over the process's lifetime.
    pub peak_memory: MemorySize,

    /// Cumulative number of processes that were ever active inside the job
    /// (Windows job object) or cgroup (Linux), including the main process.
    pub total_processes: u32,

    /// The OS exit code. Meaningful on its own only when `success_code` is
    /// `NORMAL`; otherwise the process was forcibly ended and this value, if
    /// present at all, reflects whatever the OS still reported.
    pub exit_code: u32,

    pub success_code: SuccessCode,

    /// Captured stdout, present only when stdout was redirected to `Memory`.
    pub output: Option<Vec<u8>>,

    /// Captured stderr, present only when stderr was redirected to `Memory`
    /// and not joined into stdout.
    pub error: Option<Vec<u8>>,

    /// Signal that killed the process (Linux only).
    pub kill_signal: Option<i32>,

    /// Signal that stopped the process (Linux only, `STOPPED` bit set).
    pub stop_signal: Option<i32>,
}

impl ResultRecord {
    /// `true` when the process ran to completion on its own, with no limit
    /// violation or forced termination.
    pub fn is_normal(&self) -> bool {
        self.success_code.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_record_is_normal_and_empty() {
        let record = ResultRecord::default();
        assert!(record.is_normal());
        assert!(record.output.is_none());
        assert!(record.error.is_none());
    }

    #[test]
    fn non_empty_success_code_is_not_normal() {
        let mut record = ResultRecord::default();
        record.success_code = SuccessCode::KILLED;
        assert!(!record.is_normal());
    }
}
