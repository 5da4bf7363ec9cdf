//! Resource limits (spec.md §3, "limits") and the `success_code` bitmask
//! (spec.md §3, "success_code") that summarizes how a run departed from
//! normal termination.

use std::time::Duration;

use bitflags::bitflags;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::memory::MemorySize;

bitflags! {
    /// Bitmask describing non-normal termination causes. Orthogonal to
    /// `exit_code`: a run can be `KILLED` and still have an `exit_code` the
    /// OS happens to still report.
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct SuccessCode: u32 {
        /// No bits set: the process ran to completion on its own.
        const NORMAL = 0;
        const KILLED = 1;
        const TIME_LIMIT_HIT = 2;
        const MEMORY_LIMIT_HIT = 4;
        const IDLENESS_LIMIT_HIT = 8;
        const INACTIVE = 16;
        const STOPPED = 32;
        const KILLED_BY_OTHER = 64;
        const PROCESS_LIMIT_HIT = 128;
        const USER_TIME_LIMIT_HIT = 256;
    }
}

impl Default for SuccessCode {
    fn default() -> Self {
        SuccessCode::NORMAL
    }
}

/// Hard and soft resource limits applied to a subprocess.
///
/// Soft limits (`time_limit`, `memory_limit`) are enforced by the runner's
/// polling loop and can be detected and reported precisely; hard limits
/// (`hard_time_limit`, `hard_memory_limit`) are enforced by the OS (job
/// object or cgroup) as a backstop and may terminate the process before the
/// runner's next poll.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResourceLimits {
    /// Soft user-CPU time limit.
    pub time_limit: Option<Duration>,

    /// Wall-clock ceiling enforced by the kernel/job object, independent of
    /// the monitor's own wall-time-multiplier heuristic.
    pub hard_time_limit: Option<Duration>,

    /// Soft memory limit, checked by the runner's polling loop.
    pub memory_limit: Option<MemorySize>,

    /// Hard memory limit, enforced by the job object or cgroup.
    pub hard_memory_limit: Option<MemorySize>,

    /// Maximum number of simultaneously active processes inside the job.
    pub process_limit: Option<u32>,

    /// Processor affinity mask (Windows) / CPU set (Linux), if restricted.
    pub process_affinity_mask: Option<u64>,

    /// Enable the idleness heuristic (wall time grows, user time does not).
    pub check_idleness: bool,

    /// Restrict UI access (desktop switch, clipboard, global atoms, ...).
    pub restrict_ui: bool,

    /// Skip job-object/cgroup creation entirely. Disables every
    /// job-enforced hard limit; the builder emits a warning if any hard
    /// limit was also set (spec.md §4.3).
    pub no_job: bool,
}

/// Default polling period between two consecutive resource checks.
pub const DEFAULT_TIME_QUANTUM: Duration = Duration::from_millis(200);

/// Multiplier applied to `time_limit` to derive the wall-clock ceiling used
/// by the monitor's own `TIME_LIMIT_HIT` check (spec.md §4.5).
pub const WALL_TIME_MULTIPLIER: u32 = 4;

/// Minimum wall-clock ceiling regardless of how small `time_limit` is.
pub const WALL_TIME_FLOOR: Duration = Duration::from_secs(60);

/// Grace period before the idleness heuristic fires once `check_idleness`
/// is enabled and wall time is growing without matching user-time growth.
pub const IDLENESS_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Derive the wall-clock ceiling used by the `TIME_LIMIT_HIT` check from a
/// soft CPU time limit: `max(time_limit * WALL_TIME_MULTIPLIER, WALL_TIME_FLOOR)`.
pub fn wall_time_ceiling(time_limit: Duration) -> Duration {
    std::cmp::max(time_limit * WALL_TIME_MULTIPLIER, WALL_TIME_FLOOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_code_normal_is_empty() {
        assert_eq!(SuccessCode::NORMAL.bits(), 0);
        assert!(SuccessCode::default().is_empty());
    }

    #[test]
    fn success_code_bits_combine() {
        let code = SuccessCode::KILLED | SuccessCode::TIME_LIMIT_HIT;
        assert!(code.contains(SuccessCode::KILLED));
        assert!(code.contains(SuccessCode::TIME_LIMIT_HIT));
        assert!(!code.contains(SuccessCode::MEMORY_LIMIT_HIT));
    }

    #[test]
    fn wall_time_ceiling_applies_floor() {
        assert_eq!(
            wall_time_ceiling(Duration::from_millis(500)),
            WALL_TIME_FLOOR
        );
        assert_eq!(
            wall_time_ceiling(Duration::from_secs(30)),
            Duration::from_secs(120)
        );
    }
}
